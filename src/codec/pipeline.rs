//! Concrete compression backends behind the `CompressionPipeline` trait.
//!
//! Generalized from the teacher crate's `CompressionMethod` enum and its
//! int8 gradient quantizer into pluggable, independently testable pipelines.

use crate::error::{CoordinatorError, Result};
use std::io::{Read, Write};

/// A pure codec over raw bytes. `is_lossless()` tells the tensor codec
/// whether it may use this pipeline when `require_lossless` is set.
pub trait CompressionPipeline: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn is_lossless(&self) -> bool;
}

pub struct NoCompressionPipeline;

impl CompressionPipeline for NoCompressionPipeline {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_lossless(&self) -> bool {
        true
    }
}

pub struct ZstdPipeline {
    pub level: i32,
}

impl Default for ZstdPipeline {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl CompressionPipeline for ZstdPipeline {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = zstd::Encoder::new(Vec::new(), self.level)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        encoder
            .write_all(data)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        encoder.finish().map_err(|e| CoordinatorError::Codec(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder =
            zstd::Decoder::new(data).map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        Ok(out)
    }

    fn is_lossless(&self) -> bool {
        true
    }
}

pub struct Lz4Pipeline {
    pub level: u32,
}

impl Default for Lz4Pipeline {
    fn default() -> Self {
        Self { level: 4 }
    }
}

impl CompressionPipeline for Lz4Pipeline {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut compressed = Vec::new();
        let mut encoder = lz4::EncoderBuilder::new()
            .level(self.level)
            .build(&mut compressed)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        encoder
            .write_all(data)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        let (_, result) = encoder.finish();
        result.map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder =
            lz4::Decoder::new(data).map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        Ok(out)
    }

    fn is_lossless(&self) -> bool {
        true
    }
}

pub struct SnappyPipeline;

impl CompressionPipeline for SnappyPipeline {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = snap::write::FrameEncoder::new(Vec::new());
        encoder
            .write_all(data)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        encoder.into_inner().map_err(|e| CoordinatorError::Codec(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = snap::read::FrameDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        Ok(out)
    }

    fn is_lossless(&self) -> bool {
        true
    }
}

/// Lossy int8 quantization, generalized from the teacher's
/// `quantize_gradient`/`dequantize_gradient` gradient helpers to operate
/// over the coordinator's raw little-endian f32 tensor byte buffers.
pub struct QuantizedPipeline;

impl QuantizedPipeline {
    fn bytes_to_floats(data: &[u8]) -> Result<Vec<f32>> {
        if data.len() % 4 != 0 {
            return Err(CoordinatorError::Codec("tensor byte buffer not f32-aligned".into()));
        }
        Ok(data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn floats_to_bytes(values: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() * 4);
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

impl CompressionPipeline for QuantizedPipeline {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let values = Self::bytes_to_floats(data)?;
        let min = values.iter().fold(f32::INFINITY, |a, &b| a.min(b));
        let max = values.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));

        if min == max {
            let mut out = Vec::with_capacity(8);
            out.extend_from_slice(&min.to_le_bytes());
            out.extend_from_slice(&(values.len() as u32).to_le_bytes());
            return Ok(out);
        }

        let scale = 255.0 / (max - min);
        let mut out = Vec::with_capacity(values.len() + 8);
        out.extend_from_slice(&min.to_le_bytes());
        out.extend_from_slice(&max.to_le_bytes());
        for &v in &values {
            let q = ((v - min) * scale).round().clamp(0.0, 255.0) as u8;
            out.push(q);
        }
        Ok(out)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() == 8 {
            let min = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            let len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
            return Ok(Self::floats_to_bytes(&vec![min; len]));
        }
        if data.len() < 8 {
            return Err(CoordinatorError::Codec("truncated quantized tensor".into()));
        }
        let min = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let max = f32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let scale = (max - min) / 255.0;
        let values: Vec<f32> = data[8..].iter().map(|&q| min + q as f32 * scale).collect();
        Ok(Self::floats_to_bytes(&values))
    }

    fn is_lossless(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossless_pipelines_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let pipelines: Vec<Box<dyn CompressionPipeline>> = vec![
            Box::new(NoCompressionPipeline),
            Box::new(ZstdPipeline::default()),
            Box::new(Lz4Pipeline::default()),
            Box::new(SnappyPipeline),
        ];
        for p in pipelines {
            let compressed = p.compress(&data).unwrap();
            let decompressed = p.decompress(&compressed).unwrap();
            assert_eq!(data, decompressed);
            assert!(p.is_lossless());
        }
    }

    #[test]
    fn quantized_pipeline_round_trips_within_epsilon() {
        let values: Vec<f32> = (0..64).map(|i| i as f32 * 0.1).collect();
        let bytes = QuantizedPipeline::floats_to_bytes(&values);
        let pipeline = QuantizedPipeline;
        let compressed = pipeline.compress(&bytes).unwrap();
        let decompressed = pipeline.decompress(&compressed).unwrap();
        let restored = QuantizedPipeline::bytes_to_floats(&decompressed).unwrap();
        assert_eq!(restored.len(), values.len());
        for (a, b) in values.iter().zip(restored.iter()) {
            assert!((a - b).abs() <= 0.05, "{a} vs {b}");
        }
        assert!(!pipeline.is_lossless());
    }

    #[test]
    fn quantized_constant_tensor_is_exact() {
        let values = vec![3.5f32; 16];
        let bytes = QuantizedPipeline::floats_to_bytes(&values);
        let pipeline = QuantizedPipeline;
        let compressed = pipeline.compress(&bytes).unwrap();
        let decompressed = pipeline.decompress(&compressed).unwrap();
        let restored = QuantizedPipeline::bytes_to_floats(&decompressed).unwrap();
        assert_eq!(values, restored);
    }
}
