use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::numeric::FloatMap;

/// Patch feature vectors of one image: row `y * width + x` holds the
/// concatenated stage features of grid cell (x, y).
#[derive(Debug, Clone)]
pub struct PatchFeatureGrid {
    /// Shape (height * width, channels).
    pub features: Tensor,
    pub height: usize,
    pub width: usize,
}

impl PatchFeatureGrid {
    pub fn num_patches(&self) -> usize {
        self.height * self.width
    }

    pub fn channel_dim(&self) -> usize {
        self.features.dims().get(1).copied().unwrap_or(0)
    }
}

/// Outcome of scoring one image against the memory bank.
#[derive(Debug, Clone)]
pub struct AnomalyResult {
    /// Largest nearest-neighbour distance over all patches.
    pub anomaly_score: f32,
    /// Per-patch distances on the feature grid.
    pub patch_map: FloatMap,
    /// `patch_map` resized to the display resolution.
    pub anomaly_map: FloatMap,
    pub is_anomaly: bool,
    pub confidence: f32,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResults {
    pub original_image: String,
    pub anomaly_map: String,
    pub overlay_image: String,
    pub contour_image: String,
    pub anomaly_score: f32,
    pub is_anomaly: bool,
    pub confidence: f32,
    pub threshold: f32,
    /// Seconds.
    pub processing_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<AnalysisResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisResponse {
    pub fn success(results: AnalysisResults) -> Self {
        Self {
            success: true,
            results: Some(results),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            results: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub message: String,
    /// Backbone and memory index both loaded, i.e. `analyze` can succeed.
    pub model_loaded: bool,
    /// The memory index alone is built.
    pub index_ready: bool,
    /// "ready" or "model not loaded", following `model_loaded`.
    pub state: String,
    pub device: String,
    pub memory_bank_size: Option<[usize; 2]>,
}
