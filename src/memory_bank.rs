//! The memory bank artifact: normal-sample patch features stored as a
//! safetensors file with a 2D `memory_bank` tensor. The header metadata is the
//! free-form config of the run that produced the bank.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use tracing::{info, warn};

use crate::{Error, Result};

pub const MEMORY_BANK_KEY: &str = "memory_bank";
pub const THRESHOLD_KEY: &str = "threshold";
pub const LAYERS_KEY: &str = "layers";

#[derive(Debug, Clone)]
pub struct MemoryBank {
    vectors: Tensor,
    metadata: BTreeMap<String, String>,
}

impl MemoryBank {
    /// `vectors` must be (num_reference_patches, channel_dim) with both sides non-zero.
    pub fn new(vectors: Tensor, metadata: BTreeMap<String, String>) -> Result<Self> {
        let (rows, dim) = match vectors.dims() {
            [rows, dim] => (*rows, *dim),
            dims => {
                return Err(Error::MemoryBank(format!(
                    "expected a 2D array, got shape {:?}",
                    dims
                )))
            }
        };
        if rows == 0 || dim == 0 {
            return Err(Error::MemoryBank(format!("empty memory bank ({}x{})", rows, dim)));
        }
        let vectors = match vectors.dtype() {
            DType::F32 | DType::F64 => vectors,
            DType::F16 | DType::BF16 => vectors.to_dtype(DType::F32)?,
            other => {
                return Err(Error::MemoryBank(format!("unsupported dtype {:?}", other)));
            }
        };
        Ok(Self { vectors, metadata })
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let bytes = fs::read(path)?;
        let bank = Self::from_bytes(&bytes, device)?;
        info!(
            "memory bank loaded from {}: {:?}",
            path.display(),
            bank.shape()
        );
        if !bank.metadata.is_empty() {
            info!("memory bank config: {:?}", bank.metadata);
        }
        Ok(bank)
    }

    pub fn from_bytes(bytes: &[u8], device: &Device) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header
            .metadata()
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();

        let mut tensors = candle_core::safetensors::load_buffer(bytes, device)?;
        let vectors = tensors.remove(MEMORY_BANK_KEY).ok_or_else(|| {
            Error::MemoryBank(format!("artifact has no `{}` tensor", MEMORY_BANK_KEY))
        })?;
        Self::new(vectors, metadata)
    }

    pub fn vectors(&self) -> &Tensor {
        &self.vectors
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn shape(&self) -> [usize; 2] {
        let dims = self.vectors.dims();
        [dims[0], dims[1]]
    }

    /// Decision threshold recorded with the bank, if any.
    pub fn threshold(&self) -> Option<f32> {
        let raw = self.metadata.get(THRESHOLD_KEY)?;
        match raw.trim().parse::<f32>() {
            Ok(value) if value.is_finite() => Some(value),
            _ => {
                warn!("ignoring unparsable `{}` metadata: {:?}", THRESHOLD_KEY, raw);
                None
            }
        }
    }

    /// Backbone layers the bank was built from, if recorded (comma separated).
    pub fn layers(&self) -> Option<Vec<String>> {
        let raw = self.metadata.get(LAYERS_KEY)?;
        let layers: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if layers.is_empty() {
            None
        } else {
            Some(layers)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn artifact(tensors: Vec<(&str, Tensor)>, metadata: Option<HashMap<String, String>>) -> Vec<u8> {
        safetensors::serialize(tensors, &metadata).unwrap()
    }

    #[test]
    fn loads_bank_and_metadata() {
        let bank = Tensor::new(&[[1f32, 0., 0.], [0., 1., 0.]], &Device::Cpu).unwrap();
        let metadata = HashMap::from([
            ("threshold".to_string(), "0.42".to_string()),
            ("layers".to_string(), "layer2, layer3".to_string()),
            ("category".to_string(), "metal_nut".to_string()),
        ]);
        let bytes = artifact(vec![("memory_bank", bank)], Some(metadata));

        let loaded = MemoryBank::from_bytes(&bytes, &Device::Cpu).unwrap();
        assert_eq!(loaded.shape(), [2, 3]);
        assert_eq!(loaded.threshold(), Some(0.42));
        assert_eq!(
            loaded.layers(),
            Some(vec!["layer2".to_string(), "layer3".to_string()])
        );
        assert_eq!(loaded.metadata().get("category").unwrap(), "metal_nut");
    }

    #[test]
    fn missing_tensor_is_rejected() {
        let other = Tensor::new(&[[1f32, 2.]], &Device::Cpu).unwrap();
        let bytes = artifact(vec![("features", other)], None);

        let err = MemoryBank::from_bytes(&bytes, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::MemoryBank(_)), "got {:?}", err);
    }

    #[test]
    fn non_matrix_bank_is_rejected() {
        let flat = Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap();
        assert!(MemoryBank::new(flat, BTreeMap::new()).is_err());
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(MemoryBank::from_bytes(b"not a safetensors file", &Device::Cpu).is_err());
    }

    #[test]
    fn bad_threshold_metadata_is_ignored() {
        let bank = Tensor::new(&[[1f32]], &Device::Cpu).unwrap();
        let metadata = BTreeMap::from([("threshold".to_string(), "high".to_string())]);
        let bank = MemoryBank::new(bank, metadata).unwrap();
        assert_eq!(bank.threshold(), None);
        assert_eq!(bank.layers(), None);
    }
}
