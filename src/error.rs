use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the analysis pipeline and of model loading.
///
/// Every variant is terminal for the request that raised it; nothing here is
/// retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("File must be an image (content type `{0}`)")]
    UnsupportedMediaType(String),

    #[error("no features extracted: none of the layers {layers:?} produced output")]
    FeatureExtraction { layers: Vec<String> },

    #[error("memory index not ready: {0}")]
    IndexNotReady(String),

    #[error("backbone not loaded: {0}")]
    BackboneNotLoaded(String),

    #[error("invalid memory bank: {0}")]
    MemoryBank(String),

    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("analysis failed: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("analysis failed: image encoding: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid safetensors artifact: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("weight download failed: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),
}

impl Error {
    /// True when the caller sent something we cannot analyze.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::UnsupportedMediaType(_))
    }

    /// HTTP-style status used when the error is turned into a response.
    pub fn status_code(&self) -> u16 {
        if self.is_client_error() {
            400
        } else {
            500
        }
    }
}
