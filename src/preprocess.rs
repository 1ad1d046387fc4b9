use candle_core::{Device, Tensor};
use image::{imageops::FilterType, RgbImage};

use crate::{Error, Result};

/// Side length of the square backbone input.
pub const INPUT_SIZE: u32 = 256;

// ImageNet statistics the backbone was trained with.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub struct Preprocessed {
    /// Decoded image at its original resolution.
    pub original: RgbImage,
    /// Normalized NCHW tensor of shape (1, 3, 256, 256).
    pub input: Tensor,
}

pub fn decode(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    Ok(image.to_rgb8())
}

/// Resize to 256x256, scale to [0,1] and apply the per-channel ImageNet normalization.
pub fn to_input_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let resized = image::imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let size = INPUT_SIZE as usize;
    let plane = size * size;

    // HWC -> CHW
    let mut input_data = vec![0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = y as usize * size + x as usize;
        for c in 0..3 {
            let p = pixel[c] as f32 / 255.0;
            input_data[c * plane + offset] = (p - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    Ok(Tensor::from_vec(input_data, (1, 3, size, size), device)?)
}

pub fn preprocess(bytes: &[u8], device: &Device) -> Result<Preprocessed> {
    let original = decode(bytes)?;
    let input = to_input_tensor(&original, device)?;
    Ok(Preprocessed { original, input })
}
