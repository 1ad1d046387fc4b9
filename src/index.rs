use candle_core::{DType, Tensor};

use crate::memory_bank::MemoryBank;
use crate::{Error, Result};

/// Number of memory-bank rows compared per matmul.
const BANK_CHUNK: usize = 4096;

/// Floor for vector norms; a zero vector has cosine similarity 0 with anything.
const NORM_EPS: f64 = 1e-12;

/// 1-nearest-neighbour search over the memory bank.
pub trait NearestNeighbor: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dim(&self) -> usize;

    /// Distance from every row of `vectors` (num_queries, dim) to its nearest
    /// bank vector, in row order.
    fn query(&self, vectors: &Tensor) -> Result<Vec<f32>>;
}

/// Exhaustive cosine-distance search. The bank is normalized once at build time.
pub struct CosineIndex {
    /// Transposed, row-normalized bank slices of shape (dim, <= BANK_CHUNK).
    chunks: Vec<Tensor>,
    len: usize,
    dim: usize,
    dtype: DType,
}

impl CosineIndex {
    pub fn build(vectors: &Tensor) -> Result<Self> {
        let (len, dim) = vectors.dims2()?;
        if len == 0 || dim == 0 {
            return Err(Error::MemoryBank(format!("cannot index an empty bank ({}x{})", len, dim)));
        }
        let normalized = l2_normalize_rows(vectors)?;
        let mut chunks = Vec::with_capacity(len.div_ceil(BANK_CHUNK));
        let mut start = 0;
        while start < len {
            let size = BANK_CHUNK.min(len - start);
            chunks.push(normalized.narrow(0, start, size)?.t()?.contiguous()?);
            start += size;
        }
        Ok(Self {
            chunks,
            len,
            dim,
            dtype: vectors.dtype(),
        })
    }
}

impl NearestNeighbor for CosineIndex {
    fn len(&self) -> usize {
        self.len
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn query(&self, vectors: &Tensor) -> Result<Vec<f32>> {
        let (_, dim) = vectors.dims2()?;
        if dim != self.dim {
            return Err(Error::Analysis(format!(
                "query vectors have {} features but the memory bank has {}",
                dim, self.dim
            )));
        }
        let queries = l2_normalize_rows(&vectors.to_dtype(self.dtype)?)?;

        let mut best: Option<Tensor> = None;
        for chunk in &self.chunks {
            let similarity = queries.matmul(chunk)?.max(1)?;
            best = Some(match best {
                Some(prev) => prev.maximum(&similarity)?,
                None => similarity,
            });
        }
        let best = best.ok_or_else(|| Error::Analysis("memory index has no vectors".into()))?;

        // cosine distance = 1 - cosine similarity, bounded to [0, 2]
        let distances = best.affine(-1.0, 1.0)?.clamp(0.0, 2.0)?;
        Ok(distances.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

fn l2_normalize_rows(xs: &Tensor) -> candle_core::Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(NORM_EPS)?;
    xs.broadcast_div(&norm)
}

/// The process-wide index slot. Stays `NotReady` when the memory bank could
/// not be loaded, and then refuses every query instead of inventing distances.
pub enum MemoryIndex {
    Ready(Box<dyn NearestNeighbor>),
    NotReady { reason: String },
}

impl MemoryIndex {
    pub fn build(bank: &MemoryBank) -> Result<Self> {
        Ok(MemoryIndex::Ready(Box::new(CosineIndex::build(bank.vectors())?)))
    }

    pub fn not_ready(reason: impl Into<String>) -> Self {
        MemoryIndex::NotReady {
            reason: reason.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, MemoryIndex::Ready(_))
    }

    pub fn ensure_ready(&self) -> Result<()> {
        match self {
            MemoryIndex::Ready(_) => Ok(()),
            MemoryIndex::NotReady { reason } => Err(Error::IndexNotReady(reason.clone())),
        }
    }

    pub fn query(&self, vectors: &Tensor) -> Result<Vec<f32>> {
        match self {
            MemoryIndex::Ready(index) => index.query(vectors),
            MemoryIndex::NotReady { reason } => Err(Error::IndexNotReady(reason.clone())),
        }
    }
}
