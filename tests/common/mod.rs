#![allow(dead_code)]

use std::io::Cursor;

use candle_core::{Device, Tensor};
use image::{ImageFormat, Rgb, RgbImage};

use patchcore_inspect::backbone::{FeatureBackbone, Stage};
use patchcore_inspect::config::RenderConfig;
use patchcore_inspect::features::FeatureExtractor;
use patchcore_inspect::memory_bank::MemoryBank;
use patchcore_inspect::preprocess;
use patchcore_inspect::{InferenceContext, Result};

/// Deterministic stand-in for the ResNet: every stage is a plain average pool
/// of the input at a stage-specific stride, layer3 squared so the two stages
/// disagree on direction.
pub struct PoolingBackbone {
    device: Device,
}

impl PoolingBackbone {
    pub fn new() -> Self {
        Self { device: Device::Cpu }
    }
}

impl FeatureBackbone for PoolingBackbone {
    fn name(&self) -> String {
        "pooling stub".to_string()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward_stages(&self, xs: &Tensor, stages: &[Stage]) -> Result<Vec<(Stage, Tensor)>> {
        let mut out = Vec::with_capacity(stages.len());
        for stage in stages {
            let activation = match stage {
                Stage::Layer1 => xs.avg_pool2d(4)?,
                Stage::Layer2 => xs.avg_pool2d(8)?,
                Stage::Layer3 => xs.avg_pool2d(16)?.sqr()?,
                Stage::Layer4 => xs.avg_pool2d(32)?.sqr()?,
            };
            out.push((*stage, activation));
        }
        Ok(out)
    }
}

pub fn default_layers() -> Vec<String> {
    vec!["layer2".to_string(), "layer3".to_string()]
}

pub fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn gray_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
}

/// Gray image with a 64x64 black block in its top-left corner.
pub fn defect_image() -> RgbImage {
    let mut image = gray_image(256, 256);
    for y in 0..64 {
        for x in 0..64 {
            image.put_pixel(x, y, Rgb([0, 0, 0]));
        }
    }
    image
}

/// A memory bank made of the stub's own patch features for `normal`.
pub fn bank_from(normal: &RgbImage) -> MemoryBank {
    let backbone = PoolingBackbone::new();
    let input = preprocess::to_input_tensor(normal, backbone.device()).unwrap();
    let grid = FeatureExtractor::new(&default_layers())
        .extract(&backbone, &input)
        .unwrap();
    MemoryBank::new(grid.features, Default::default()).unwrap()
}

pub fn ready_context(threshold: f32) -> InferenceContext {
    let bank = bank_from(&gray_image(256, 256));
    InferenceContext::from_parts(
        Box::new(PoolingBackbone::new()),
        Some(&bank),
        &default_layers(),
        threshold,
        &RenderConfig::default(),
    )
    .unwrap()
}
