//! Frozen ResNet-50 feature backbone.
//!
//! The network layout and parameter names follow torchvision (`conv1`, `bn1`,
//! `layer{1..4}.{i}.conv{1,2,3}`, `downsample.{0,1}`), so the torchvision /
//! timm ImageNet checkpoints load unchanged. Instead of observing the forward
//! pass from the outside, [`FeatureBackbone::forward_stages`] hands back the
//! activations of the requested stages, which keeps concurrent calls isolated.
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{batch_norm, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};
use tracing::info;

use crate::Result;

/// A residual stage of the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Layer1,
    Layer2,
    Layer3,
    Layer4,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Layer1, Stage::Layer2, Stage::Layer3, Stage::Layer4];

    pub fn parse(name: &str) -> Option<Stage> {
        match name {
            "layer1" => Some(Stage::Layer1),
            "layer2" => Some(Stage::Layer2),
            "layer3" => Some(Stage::Layer3),
            "layer4" => Some(Stage::Layer4),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Layer1 => "layer1",
            Stage::Layer2 => "layer2",
            Stage::Layer3 => "layer3",
            Stage::Layer4 => "layer4",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Output channels of this stage in ResNet-50.
    pub fn channels(&self) -> usize {
        256 << self.index()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A frozen network exposing intermediate stage activations.
///
/// Implementations must be read-only after construction: one instance serves
/// every request of the process.
pub trait FeatureBackbone: Send + Sync {
    fn name(&self) -> String;

    fn device(&self) -> &Device;

    /// Runs the forward pass on `xs` (N, 3, H, W) and returns the activation of
    /// every stage in `stages`, in the order requested.
    fn forward_stages(&self, xs: &Tensor, stages: &[Stage]) -> Result<Vec<(Stage, Tensor)>>;
}

fn conv2d(
    c_in: usize,
    c_out: usize,
    ksize: usize,
    padding: usize,
    stride: usize,
    vb: VarBuilder,
) -> candle_core::Result<Conv2d> {
    let conv2d_cfg = Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    candle_nn::conv2d_no_bias(c_in, c_out, ksize, conv2d_cfg, vb)
}

struct Downsample {
    conv: Conv2d,
    bn: BatchNorm,
}

struct Bottleneck {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
    downsample: Option<Downsample>,
}

impl Bottleneck {
    const EXPANSION: usize = 4;

    fn new(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let e_dim = Self::EXPANSION * c_out;
        let downsample = if stride != 1 || c_in != e_dim {
            let vb = vb.pp("downsample");
            Some(Downsample {
                conv: conv2d(c_in, e_dim, 1, 0, stride, vb.pp(0))?,
                bn: batch_norm(e_dim, 1e-5, vb.pp(1))?,
            })
        } else {
            None
        };
        Ok(Self {
            conv1: conv2d(c_in, c_out, 1, 0, 1, vb.pp("conv1"))?,
            bn1: batch_norm(c_out, 1e-5, vb.pp("bn1"))?,
            conv2: conv2d(c_out, c_out, 3, 1, stride, vb.pp("conv2"))?,
            bn2: batch_norm(c_out, 1e-5, vb.pp("bn2"))?,
            conv3: conv2d(c_out, e_dim, 1, 0, 1, vb.pp("conv3"))?,
            bn3: batch_norm(e_dim, 1e-5, vb.pp("bn3"))?,
            downsample,
        })
    }
}

impl Module for Bottleneck {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = xs
            .apply(&self.conv1)?
            .apply_t(&self.bn1, false)?
            .relu()?
            .apply(&self.conv2)?
            .apply_t(&self.bn2, false)?
            .relu()?
            .apply(&self.conv3)?
            .apply_t(&self.bn3, false)?;
        let shortcut = match &self.downsample {
            Some(ds) => xs.apply(&ds.conv)?.apply_t(&ds.bn, false)?,
            None => xs.clone(),
        };
        (shortcut + ys)?.relu()
    }
}

struct ResidualStage {
    blocks: Vec<Bottleneck>,
}

impl ResidualStage {
    fn new(c_in: usize, c_out: usize, stride: usize, cnt: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut blocks = Vec::with_capacity(cnt);
        for index in 0..cnt {
            let l_in = if index == 0 { c_in } else { Bottleneck::EXPANSION * c_out };
            let stride = if index == 0 { stride } else { 1 };
            blocks.push(Bottleneck::new(l_in, c_out, stride, vb.pp(index))?);
        }
        Ok(Self { blocks })
    }
}

impl Module for ResidualStage {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for block in self.blocks.iter() {
            xs = xs.apply(block)?;
        }
        Ok(xs)
    }
}

pub struct ResNet50 {
    conv1: Conv2d,
    bn1: BatchNorm,
    stages: [ResidualStage; 4],
    device: Device,
}

impl ResNet50 {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let conv1 = conv2d(3, 64, 7, 3, 2, vb.pp("conv1"))?;
        let bn1 = batch_norm(64, 1e-5, vb.pp("bn1"))?;
        let stages = [
            ResidualStage::new(64, 64, 1, 3, vb.pp("layer1"))?,
            ResidualStage::new(4 * 64, 128, 2, 4, vb.pp("layer2"))?,
            ResidualStage::new(4 * 128, 256, 2, 6, vb.pp("layer3"))?,
            ResidualStage::new(4 * 256, 512, 2, 3, vb.pp("layer4"))?,
        ];
        Ok(Self {
            conv1,
            bn1,
            stages,
            device,
        })
    }

    /// Loads torchvision-named weights from a local safetensors file.
    pub fn load(weights: &Path, device: &Device) -> Result<Self> {
        info!("loading ResNet-50 weights from {}", weights.display());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        Self::new(vb)
    }

    /// Fetches the weights from the Hugging Face hub (cached after the first call).
    pub fn from_hub(repo: &str, file: &str, device: &Device) -> Result<Self> {
        info!("fetching ResNet-50 weights {}/{}", repo, file);
        let api = hf_hub::api::sync::Api::new()?;
        let weights = api.model(repo.to_string()).get(file)?;
        Self::load(&weights, device)
    }

    fn stem(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.apply(&self.conv1)?
            .apply_t(&self.bn1, false)?
            .relu()?
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)
    }
}

impl FeatureBackbone for ResNet50 {
    fn name(&self) -> String {
        "ResNet-50 (ImageNet)".to_string()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward_stages(&self, xs: &Tensor, stages: &[Stage]) -> Result<Vec<(Stage, Tensor)>> {
        // Nothing past the deepest requested stage can influence the captures.
        let deepest = match stages.iter().max() {
            Some(stage) => stage.index(),
            None => return Ok(Vec::new()),
        };

        let mut captured: [Option<Tensor>; 4] = Default::default();
        let mut xs = self.stem(xs)?;
        for (index, stage) in self.stages.iter().enumerate().take(deepest + 1) {
            xs = xs.apply(stage)?;
            if stages.iter().any(|s| s.index() == index) {
                captured[index] = Some(xs.clone());
            }
        }

        Ok(stages
            .iter()
            .filter_map(|stage| captured[stage.index()].clone().map(|t| (*stage, t)))
            .collect())
    }
}
