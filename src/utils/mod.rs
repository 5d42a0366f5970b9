// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 工具模块: 图像缩放与张量打包
//! Utility helpers shared by the detector backends
use fast_image_resize as fr;
use image::RgbImage;
use ndarray::{Array, IxDyn};

use crate::error::{CounterError, Result};
use crate::models::ModelKind;

/// 输入张量通道顺序
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// 缩放RGB图像 (fast_image_resize, 双线性插值)
pub fn resize_rgb(img: &RgbImage, width: u32, height: u32, kind: ModelKind) -> Result<RgbImage> {
    if img.width() == width && img.height() == height {
        return Ok(img.clone());
    }

    let src_image = fr::images::Image::from_vec_u8(
        img.width(),
        img.height(),
        img.as_raw().clone(),
        fr::PixelType::U8x3,
    )
    .map_err(|e| CounterError::transient(kind, e))?;

    let mut dst_image = fr::images::Image::new(width, height, fr::PixelType::U8x3);

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src_image,
            &mut dst_image,
            &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )
        .map_err(|e| CounterError::transient(kind, e))?;

    RgbImage::from_raw(width, height, dst_image.into_vec())
        .ok_or_else(|| CounterError::transient(kind, "缩放后图像尺寸不匹配"))
}

/// HWC 像素 → NCHW 浮点张量 [1, 3, h, w], 每个通道值经 `normalize` 变换
pub fn to_nchw(img: &RgbImage, order: ChannelOrder, normalize: impl Fn(u8) -> f32) -> Array<f32, IxDyn> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut ys = Array::zeros(IxDyn(&[1, 3, h, w]));

    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        let (c0, c2) = match order {
            ChannelOrder::Rgb => (r, b),
            ChannelOrder::Bgr => (b, r),
        };
        ys[[0, 0, y, x]] = normalize(c0);
        ys[[0, 1, y, x]] = normalize(g);
        ys[[0, 2, y, x]] = normalize(c2);
    }
    ys
}
