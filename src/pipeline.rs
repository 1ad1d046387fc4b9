//! The inference context: everything loaded once at startup and shared,
//! read-only, by every analysis request.
use std::time::Instant;

use candle_core::{Device, DeviceLocation};
use image::RgbImage;
use tracing::{error, info, warn};

use crate::backbone::{FeatureBackbone, ResNet50};
use crate::config::{AppConfig, ModelConfig, RenderConfig};
use crate::features::FeatureExtractor;
use crate::index::MemoryIndex;
use crate::memory_bank::MemoryBank;
use crate::preprocess;
use crate::scorer::AnomalyScorer;
use crate::types::{AnalysisResponse, AnalysisResults, AnomalyResult, StatusReport};
use crate::visualize::{to_data_uri, Renderer, Renderings};
use crate::{Error, Result};

/// What one successful analysis produces before transport encoding.
#[derive(Debug, Clone)]
pub struct AnomalyReport {
    pub result: AnomalyResult,
    pub renderings: Renderings,
    /// Decoded input at its original resolution.
    pub original: RgbImage,
}

impl AnomalyReport {
    pub fn into_results(self, processing_time: f64) -> Result<AnalysisResults> {
        Ok(AnalysisResults {
            original_image: to_data_uri(&self.renderings.original)?,
            anomaly_map: to_data_uri(&self.renderings.heatmap)?,
            overlay_image: to_data_uri(&self.renderings.overlay)?,
            contour_image: to_data_uri(&self.renderings.contour)?,
            anomaly_score: self.result.anomaly_score,
            is_anomaly: self.result.is_anomaly,
            confidence: self.result.confidence,
            threshold: self.result.threshold,
            processing_time,
        })
    }
}

/// Immutable after construction; share it behind an `Arc` across threads.
pub struct InferenceContext {
    device: Device,
    backbone: std::result::Result<Box<dyn FeatureBackbone>, String>,
    extractor: FeatureExtractor,
    index: MemoryIndex,
    bank_shape: Option<[usize; 2]>,
    scorer: AnomalyScorer,
    renderer: Renderer,
}

pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            warn!("CUDA device unavailable ({}), running on CPU", e);
            Device::Cpu
        }
    }
}

pub fn device_label(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_string(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda:{}", gpu_id),
        DeviceLocation::Metal { gpu_id } => format!("metal:{}", gpu_id),
    }
}

fn load_backbone(model: &ModelConfig, device: &Device) -> Result<ResNet50> {
    match &model.backbone_weights {
        Some(path) => ResNet50::load(path, device),
        None => ResNet50::from_hub(&model.backbone_repo, &model.backbone_file, device),
    }
}

impl InferenceContext {
    /// Loads backbone and memory bank as configured. Never fails: anything that
    /// cannot be loaded is logged and leaves the context degraded, so `status`
    /// keeps answering and `analyze` reports the missing piece.
    pub fn load(config: &AppConfig) -> Self {
        let model = &config.model;
        let device = select_device(model.force_cpu);
        info!("using device: {}", device_label(&device));

        let backbone: std::result::Result<Box<dyn FeatureBackbone>, String> =
            match load_backbone(model, &device) {
                Ok(backbone) => {
                    info!("backbone loaded: {}", backbone.name());
                    Ok(Box::new(backbone))
                }
                Err(e) => {
                    error!("error loading backbone: {}", e);
                    Err(e.to_string())
                }
            };

        let bank = if model.memory_bank.exists() {
            match MemoryBank::load(&model.memory_bank, &device) {
                Ok(bank) => Some(bank),
                Err(e) => {
                    error!("error loading memory bank {}: {}", model.memory_bank.display(), e);
                    None
                }
            }
        } else {
            warn!("model file not found: {}", model.memory_bank.display());
            None
        };

        let mut threshold = model.threshold;
        let mut layers = model.layers.clone();
        if model.artifact_overrides {
            if let Some(bank) = &bank {
                if let Some(t) = bank.threshold() {
                    threshold = t;
                }
                if let Some(l) = bank.layers() {
                    layers = l;
                }
            }
        }

        let (index, bank_shape) = match &bank {
            Some(bank) => match MemoryIndex::build(bank) {
                Ok(index) => {
                    info!("nearest-neighbour index built over {:?}", bank.shape());
                    (index, Some(bank.shape()))
                }
                Err(e) => {
                    error!("error building memory index: {}", e);
                    (MemoryIndex::not_ready(e.to_string()), None)
                }
            },
            None => (
                MemoryIndex::not_ready(format!(
                    "memory bank {} not loaded",
                    model.memory_bank.display()
                )),
                None,
            ),
        };

        info!("threshold {:.4}, layers {:?}", threshold, layers);
        Self {
            device,
            backbone,
            extractor: FeatureExtractor::new(&layers),
            index,
            bank_shape,
            scorer: AnomalyScorer::new(threshold),
            renderer: Renderer::new(&config.render),
        }
    }

    /// Assembles a context from already-loaded parts. `bank: None` gives a
    /// context whose index is not ready.
    pub fn from_parts(
        backbone: Box<dyn FeatureBackbone>,
        bank: Option<&MemoryBank>,
        layers: &[String],
        threshold: f32,
        render: &RenderConfig,
    ) -> Result<Self> {
        let (index, bank_shape) = match bank {
            Some(bank) => (MemoryIndex::build(bank)?, Some(bank.shape())),
            None => (MemoryIndex::not_ready("memory bank not loaded"), None),
        };
        Ok(Self {
            device: backbone.device().clone(),
            backbone: Ok(backbone),
            extractor: FeatureExtractor::new(layers),
            index,
            bank_shape,
            scorer: AnomalyScorer::new(threshold),
            renderer: Renderer::new(render),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn threshold(&self) -> f32 {
        self.scorer.threshold()
    }

    pub fn layers(&self) -> &[String] {
        self.extractor.layers()
    }

    pub fn is_ready(&self) -> bool {
        self.backbone.is_ok() && self.index.is_ready()
    }

    pub fn status(&self) -> StatusReport {
        let ready = self.is_ready();
        StatusReport {
            message: "PatchCore API".to_string(),
            model_loaded: ready,
            index_ready: self.index.is_ready(),
            state: if ready { "ready" } else { "model not loaded" }.to_string(),
            device: device_label(&self.device),
            memory_bank_size: self.bank_shape,
        }
    }

    /// Decode, extract, score and render one image.
    pub fn analyze(&self, image_bytes: &[u8]) -> Result<AnomalyReport> {
        let original = preprocess::decode(image_bytes)?;
        self.index.ensure_ready()?;
        let backbone = self
            .backbone
            .as_deref()
            .map_err(|reason| Error::BackboneNotLoaded(reason.clone()))?;

        let input = preprocess::to_input_tensor(&original, backbone.device())?;
        let grid = self.extractor.extract(backbone, &input)?;
        let result = self.scorer.score(&self.index, &grid)?;
        info!(
            "Score: {:.4}, Threshold: {:.4}, Anomaly: {}",
            result.anomaly_score, result.threshold, result.is_anomaly
        );

        let renderings = self.renderer.render(&original, &result);
        Ok(AnomalyReport {
            result,
            renderings,
            original,
        })
    }

    /// Request boundary: never panics, always yields a status code and a
    /// response body. A declared content type must be `image/*`.
    pub fn respond(&self, content_type: Option<&str>, image_bytes: &[u8]) -> (u16, AnalysisResponse) {
        let start = Instant::now();
        let outcome = match content_type {
            Some(ct) if !ct.starts_with("image/") => Err(Error::UnsupportedMediaType(ct.to_string())),
            _ => self.analyze(image_bytes).and_then(|report| report.into_results(0.0)),
        };
        match outcome {
            Ok(mut results) => {
                // Stamped after encoding so the time covers the whole request.
                results.processing_time = start.elapsed().as_secs_f64();
                (200, AnalysisResponse::success(results))
            }
            Err(e) => {
                error!("analysis failed: {}", e);
                (e.status_code(), AnalysisResponse::failure(e.to_string()))
            }
        }
    }
}
