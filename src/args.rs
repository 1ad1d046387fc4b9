use std::path::PathBuf;

use clap::Parser;

use patchcore_inspect::config::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file (created with defaults by --write-config)
    #[arg(long, default_value = AppConfig::PATH)]
    pub config: PathBuf,

    /// Image to analyze; repeat for several images
    #[arg(short, long)]
    pub image: Vec<PathBuf>,

    /// Memory bank safetensors file
    #[arg(long)]
    pub memory_bank: Option<PathBuf>,

    /// Local ResNet-50 safetensors weights (downloaded from the hub otherwise)
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Decision threshold; takes precedence over the memory bank metadata
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Comma separated backbone stages, e.g. layer2,layer3
    #[arg(long, value_delimiter = ',')]
    pub layers: Option<Vec<String>>,

    /// Run on the CPU even if a GPU is available
    #[arg(long, default_value_t = false)]
    pub cpu: bool,

    /// Print the service status and exit
    #[arg(long)]
    pub status: bool,

    /// Directory for the original / heatmap / overlay / contour PNGs
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Print the full response JSON for every image
    #[arg(long)]
    pub json: bool,

    /// Save the effective configuration to --config
    #[arg(long)]
    pub write_config: bool,
}

impl Args {
    /// Folds the command line overrides into `config`. An explicit threshold or
    /// layer list also stops the memory bank metadata from replacing it.
    pub fn apply(&self, config: &mut AppConfig) {
        let model = &mut config.model;
        if let Some(path) = &self.memory_bank {
            model.memory_bank = path.clone();
        }
        if let Some(path) = &self.weights {
            model.backbone_weights = Some(path.clone());
        }
        if let Some(threshold) = self.threshold {
            model.threshold = threshold;
            model.artifact_overrides = false;
        }
        if let Some(layers) = &self.layers {
            model.layers = layers.clone();
            model.artifact_overrides = false;
        }
        if self.cpu {
            model.force_cpu = true;
        }
    }
}
