//! Codec pipeline (C3): compression backends plus the tensor-level
//! compress/decompress/delta operations built on top of them.

pub mod pipeline;
pub mod tensor_codec;

pub use pipeline::{
    CompressionPipeline, Lz4Pipeline, NoCompressionPipeline, QuantizedPipeline, SnappyPipeline,
    ZstdPipeline,
};
pub use tensor_codec::TensorCodec;
