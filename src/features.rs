use candle_core::{Device, IndexOp, Tensor};
use tracing::{debug, warn};

use crate::backbone::{FeatureBackbone, Stage};
use crate::types::PatchFeatureGrid;
use crate::{Error, Result};

/// Side length of the common patch grid every captured stage is pooled to.
pub const FEATURE_GRID: usize = 28;

/// Turns backbone stage activations into one feature vector per grid patch.
pub struct FeatureExtractor {
    layers: Vec<String>,
    stages: Vec<Stage>,
    grid: usize,
}

impl FeatureExtractor {
    /// Unknown layer names are skipped; if none is known every extraction fails.
    pub fn new(layers: &[String]) -> Self {
        let stages = layers
            .iter()
            .filter_map(|name| {
                let stage = Stage::parse(name);
                if stage.is_none() {
                    warn!("unknown backbone layer `{}` ignored", name);
                }
                stage
            })
            .collect();
        Self {
            layers: layers.to_vec(),
            stages,
            grid: FEATURE_GRID,
        }
    }

    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn extract(&self, backbone: &dyn FeatureBackbone, input: &Tensor) -> Result<PatchFeatureGrid> {
        let captured = backbone.forward_stages(input, &self.stages)?;
        if captured.is_empty() {
            return Err(Error::FeatureExtraction {
                layers: self.layers.clone(),
            });
        }

        let mut pooled = Vec::with_capacity(captured.len());
        for (stage, activation) in captured {
            debug!("{} activation {:?}", stage, activation.dims());
            pooled.push(adaptive_avg_pool2d(&activation, self.grid, self.grid)?);
        }
        let features = Tensor::cat(&pooled, 1)?;

        let (b, c, h, w) = features.dims4()?;
        if b != 1 {
            return Err(Error::Analysis(format!("expected a single image, got a batch of {}", b)));
        }
        // (1, C, H, W) -> (H*W, C)
        let features = features.i(0)?.reshape((c, h * w))?.t()?.contiguous()?;

        let grid = PatchFeatureGrid {
            features,
            height: h,
            width: w,
        };
        debug!(
            "{} patches of {} features",
            grid.num_patches(),
            grid.channel_dim()
        );
        Ok(grid)
    }
}

/// Averages every region of an (N, C, H, W) tensor onto an `out_h` x `out_w` grid.
///
/// Output cell `i` along an axis of length `n` covers input indices
/// `floor(i*n/out) .. ceil((i+1)*n/out)`, which also handles upsampling.
pub fn adaptive_avg_pool2d(xs: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (n, c, h, w) = xs.dims4()?;
    let device = xs.device();
    let dtype = xs.dtype();
    let pool_w = pooling_matrix(w, out_w, device)?.to_dtype(dtype)?;
    let pool_h = pooling_matrix(h, out_h, device)?.to_dtype(dtype)?;

    // Pool along W, then swap axes and pool along H.
    let ys = xs.contiguous()?.reshape((n * c * h, w))?.matmul(&pool_w)?;
    let ys = ys
        .reshape((n, c, h, out_w))?
        .transpose(2, 3)?
        .contiguous()?
        .reshape((n * c * out_w, h))?
        .matmul(&pool_h)?;
    Ok(ys
        .reshape((n, c, out_w, out_h))?
        .transpose(2, 3)?
        .contiguous()?)
}

/// (input, output) matrix whose column `i` averages the window of output cell `i`.
fn pooling_matrix(input: usize, output: usize, device: &Device) -> Result<Tensor> {
    let mut weights = vec![0f32; input * output];
    for i in 0..output {
        let start = i * input / output;
        let end = ((i + 1) * input).div_ceil(output);
        let scale = 1.0 / (end - start) as f32;
        for j in start..end {
            weights[j * output + i] = scale;
        }
    }
    Ok(Tensor::from_vec(weights, (input, output), device)?)
}
