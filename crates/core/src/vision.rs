use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, imageops::FilterType};
use tracing::debug;

/// SigLIP-style preprocessing: square bilinear resize, then `(x / 255 - 0.5) / 0.5` in CHW order.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    image_size: u32,
    device: Device,
    dtype: DType,
}

impl ImagePreprocessor {
    pub fn new(image_size: u32, device: &Device, dtype: DType) -> Self {
        Self {
            image_size,
            device: device.clone(),
            dtype,
        }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn open(path: &Path) -> Result<DynamicImage> {
        image::open(path).with_context(|| format!("failed to open image {}", path.display()))
    }

    /// Produce the `[1, 3, S, S]` pixel tensor the vision encoder consumes.
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Tensor> {
        let (width, height) = (image.width(), image.height());
        let resized = if width == self.image_size && height == self.image_size {
            image.clone()
        } else {
            image.resize_exact(self.image_size, self.image_size, FilterType::Triangle)
        };
        debug!(
            width,
            height,
            target = self.image_size,
            "resized image for vision encoder"
        );
        let pixels = image_to_tensor(&resized, &self.device, self.dtype)?;
        Ok(pixels.unsqueeze(0)?)
    }
}

pub fn image_to_tensor(image: &DynamicImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for c in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let value = rgb.get_pixel(x, y)[c] as f32 / 255.0;
                data.push((value - 0.5) / 0.5);
            }
        }
    }
    let tensor = Tensor::from_vec(data, (3, height as usize, width as usize), device)?;
    if tensor.dtype() == dtype {
        Ok(tensor)
    } else {
        Ok(tensor.to_dtype(dtype)?)
    }
}
