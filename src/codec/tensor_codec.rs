//! Tensor-level codec: wraps a byte-level `CompressionPipeline` with the
//! tag bookkeeping and delta arithmetic spec'd for C3.

use crate::codec::pipeline::CompressionPipeline;
use crate::error::{CoordinatorError, Result};
use crate::types::{Tensor, TensorKey, TransformerMetadata};

pub struct TensorCodec {
    pipeline: Box<dyn CompressionPipeline>,
}

impl TensorCodec {
    pub fn new(pipeline: Box<dyn CompressionPipeline>) -> Self {
        Self { pipeline }
    }

    fn tensor_to_bytes(t: &Tensor) -> Vec<u8> {
        let mut out = Vec::with_capacity(t.values.len() * 4);
        for v in &t.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn bytes_to_tensor(shape: Vec<usize>, bytes: &[u8]) -> Result<Tensor> {
        if bytes.len() % 4 != 0 {
            return Err(CoordinatorError::Codec("tensor byte buffer not f32-aligned".into()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Tensor { shape, values, metadata: Vec::new() })
    }

    /// Compresses `t`, tagging the returned key `compressed` (lossless) or
    /// `lossy_compressed` (lossy) per the pipeline's own nature.
    pub fn compress(
        &self,
        key: &TensorKey,
        tensor: &Tensor,
        lossless: bool,
    ) -> Result<(TensorKey, Vec<u8>, TransformerMetadata)> {
        if lossless && !self.pipeline.is_lossless() {
            return Err(CoordinatorError::Codec(
                "lossless compression requested but pipeline is lossy".into(),
            ));
        }
        let bytes = Self::tensor_to_bytes(tensor);
        let compressed = self.pipeline.compress(&bytes)?;
        let tag = if self.pipeline.is_lossless() { "compressed" } else { "lossy_compressed" };
        let new_key = key.with_tag_added(tag);
        let metadata = TransformerMetadata {
            int_list: tensor.shape.iter().map(|&d| d as i64).collect(),
            ..Default::default()
        };
        Ok((new_key, compressed, metadata))
    }

    /// Decompresses `bytes` into a tensor, stripping the corresponding
    /// compression tag from the returned key.
    pub fn decompress(
        &self,
        key: &TensorKey,
        bytes: &[u8],
        metadata: &TransformerMetadata,
        require_lossless: bool,
    ) -> Result<(TensorKey, Tensor)> {
        if require_lossless && !self.pipeline.is_lossless() {
            return Err(CoordinatorError::Codec(
                "lossless decode requested but pipeline is lossy".into(),
            ));
        }
        let raw = self.pipeline.decompress(bytes)?;
        let shape: Vec<usize> = metadata.int_list.iter().map(|&d| d as usize).collect();
        let tensor = Self::bytes_to_tensor(shape, &raw)?;
        let new_key = key.with_tag_removed("compressed").with_tag_removed("lossy_compressed");
        Ok((new_key, tensor))
    }

    /// `generate_delta(k, t, base) -> (k', t - base)`, appending `delta`.
    pub fn generate_delta(&self, key: &TensorKey, tensor: &Tensor, base: &Tensor) -> Result<(TensorKey, Tensor)> {
        if tensor.values.len() != base.values.len() {
            return Err(CoordinatorError::Codec("delta shape mismatch".into()));
        }
        let values = tensor
            .values
            .iter()
            .zip(base.values.iter())
            .map(|(t, b)| t - b)
            .collect();
        let delta = Tensor { shape: tensor.shape.clone(), values, metadata: tensor.metadata.clone() };
        Ok((key.with_tag_added("delta"), delta))
    }

    /// `apply_delta(k, delta, base) -> (k'', delta + base)`, removing `delta`.
    pub fn apply_delta(&self, key: &TensorKey, delta: &Tensor, base: &Tensor) -> Result<(TensorKey, Tensor)> {
        if delta.values.len() != base.values.len() {
            return Err(CoordinatorError::Codec("delta shape mismatch".into()));
        }
        let values = delta
            .values
            .iter()
            .zip(base.values.iter())
            .map(|(d, b)| d + b)
            .collect();
        let tensor = Tensor { shape: delta.shape.clone(), values, metadata: delta.metadata.clone() };
        Ok((key.with_tag_removed("delta"), tensor))
    }
}
