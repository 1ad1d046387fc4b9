use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Local ResNet-50 safetensors file. When unset the weights come from `backbone_repo`.
    pub backbone_weights: Option<PathBuf>,
    pub backbone_repo: String,
    pub backbone_file: String,
    pub memory_bank: PathBuf,
    /// Backbone stages whose activations form the patch features, in concatenation order.
    pub layers: Vec<String>,
    pub threshold: f32,
    /// Let `threshold` / `layers` stored in the memory bank metadata win over this file.
    pub artifact_overrides: bool,
    pub force_cpu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub contour_percentile: f32,
    /// Weight of the original image in the overlay; the heatmap gets the rest.
    pub overlay_alpha: f32,
    pub contour_thickness: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone_weights: None,
            backbone_repo: "timm/resnet50.tv_in1k".to_string(),
            backbone_file: "model.safetensors".to_string(),
            memory_bank: PathBuf::from("model/patchcore.safetensors"),
            layers: vec!["layer2".to_string(), "layer3".to_string()],
            threshold: 0.3269,
            artifact_overrides: true,
            force_cpu: false,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            contour_percentile: 85.0,
            overlay_alpha: 0.6,
            contour_thickness: 2,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

impl AppConfig {
    pub const PATH: &'static str = "config.json";

    /// Reads the config at `path`. A missing or unparsable file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("configuration file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        // Missing fields fall back through #[serde(default)].
        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) => {
                warn!("error parsing {}: {}. Loading defaults.", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
