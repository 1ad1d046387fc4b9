use tracing::debug;

use crate::index::MemoryIndex;
use crate::numeric::FloatMap;
use crate::types::{AnomalyResult, PatchFeatureGrid};
use crate::{Error, Result};

/// Side length of the anomaly map handed to the renderers.
pub const OUTPUT_SIZE: usize = 256;

/// Confidence reported when the threshold is not positive.
pub const FALLBACK_CONFIDENCE: f32 = 0.5;

/// Strictly above the threshold is anomalous; a score equal to it is normal.
pub fn is_anomalous(score: f32, threshold: f32) -> bool {
    score > threshold
}

/// Relative distance of the score from the threshold.
pub fn confidence(score: f32, threshold: f32) -> f32 {
    if threshold > 0.0 {
        (score - threshold).abs() / threshold
    } else {
        FALLBACK_CONFIDENCE
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AnomalyScorer {
    threshold: f32,
    output_size: usize,
}

impl AnomalyScorer {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            output_size: OUTPUT_SIZE,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn score(&self, index: &MemoryIndex, grid: &PatchFeatureGrid) -> Result<AnomalyResult> {
        let distances = index.query(&grid.features)?;
        self.score_distances(distances, grid.height, grid.width)
    }

    /// Builds the result from per-patch distances laid out row-major on a
    /// `height` x `width` grid.
    pub fn score_distances(&self, distances: Vec<f32>, height: usize, width: usize) -> Result<AnomalyResult> {
        if distances.is_empty() {
            return Err(Error::Analysis("no patch distances to score".into()));
        }
        // The worst patch decides, not the average.
        let anomaly_score = distances.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let patch_map = FloatMap::new(width, height, distances)?;
        let anomaly_map = patch_map.resize_bilinear(self.output_size, self.output_size);
        debug!(
            "scored {} patches, max {:.4}",
            patch_map.values().len(),
            anomaly_score
        );

        Ok(AnomalyResult {
            anomaly_score,
            patch_map,
            anomaly_map,
            is_anomaly: is_anomalous(anomaly_score, self.threshold),
            confidence: confidence(anomaly_score, self.threshold),
            threshold: self.threshold,
        })
    }
}
