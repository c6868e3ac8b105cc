//! Container input types: the metadata map and tensor catalog the engine
//! consumes from the (external) model-file parser.
//!
//! Grounded on `examples/original_source/models/gguf/gguf.h`'s
//! `gguf_value`/`gguf_tensor` pair and the key lookups in
//! `examples/original_source/models/llama2.h`'s `Model::init` (`kv["llama.attention.head_count"]`,
//! `tensors["blk.%u.attn_k.weight"]`, …). The actual GGUF byte-level parser is
//! out of scope (§1); this module only defines the shapes that parser is
//! expected to hand the engine, plus the element-type enum the spec's §6
//! names (fp32, fp16, q8_0).

use std::collections::HashMap;

use crate::error::ContainerError;
use crate::float;

/// One metadata value. The container format carries more value kinds than
/// the engine reads (strings, arrays, …); only the scalar kinds the model
/// init path actually consumes are modeled here.
#[derive(Debug, Clone, Copy)]
pub enum MetadataValue {
    Uint32(u32),
    Float32(f32),
}

/// Flat string-keyed metadata map, e.g. `"llama.attention.head_count" ->
/// Uint32(32)`.
#[derive(Debug, Clone, Default)]
pub struct Metadata(HashMap<String, MetadataValue>);

impl Metadata {
    pub fn new() -> Metadata {
        Metadata(HashMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MetadataValue) {
        self.0.insert(key.into(), value);
    }

    pub fn require_uint32(&self, key: &str) -> Result<u32, ContainerError> {
        match self.0.get(key) {
            Some(MetadataValue::Uint32(v)) => Ok(*v),
            _ => Err(ContainerError::MissingMetadataKey(key.to_string())),
        }
    }

    pub fn require_float32(&self, key: &str) -> Result<f32, ContainerError> {
        match self.0.get(key) {
            Some(MetadataValue::Float32(v)) => Ok(*v),
            _ => Err(ContainerError::MissingMetadataKey(key.to_string())),
        }
    }
}

/// On-disk element type of a tensor's raw bytes, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Fp32,
    Fp16,
    Q8_0,
}

/// One tensor's descriptor plus its raw on-disk bytes, as the external
/// container parser hands it to `Model::init`. `dimensions` is
/// container-native ordering (fastest-varying first, as GGUF stores it);
/// [`TensorDescriptor::shape_chw`] reverses it into this engine's
/// `(channels, height, width)` convention.
#[derive(Debug, Clone)]
pub struct TensorDescriptor {
    pub name: String,
    pub dimensions: Vec<usize>,
    pub element_type: ElementType,
    pub bytes: Vec<u8>,
}

impl TensorDescriptor {
    /// Number of scalar elements this tensor declares, independent of
    /// on-disk encoding.
    pub fn element_count(&self) -> usize {
        self.dimensions.iter().product()
    }

    /// Reverses `dimensions` (GGUF is fastest-varying-first) into this
    /// engine's `(channels, height, width)` tensor convention. 1D tensors
    /// (norm weights) become `(1, 1, len)`; 2D weight matrices become
    /// `(1, rows, cols)`.
    pub fn shape_chw(&self) -> (usize, usize, usize) {
        match self.dimensions.as_slice() {
            [cols] => (1, 1, *cols),
            [cols, rows] => (1, *rows, *cols),
            [cols, rows, channels] => (*channels, *rows, *cols),
            _ => (1, 1, self.element_count()),
        }
    }

    /// Expected raw byte length for `dimensions`/`element_type`, used to
    /// validate `bytes.len()` at load time (§7.5).
    pub fn expected_bytes(&self) -> usize {
        let elements = self.element_count();
        match self.element_type {
            ElementType::Fp32 => elements * 4,
            ElementType::Fp16 => elements * 2,
            ElementType::Q8_0 => float::q8_0_block_count(elements) * float::Q8_0_BLOCK_BYTES,
        }
    }

    /// Decodes this tensor's raw bytes into a flat fp32 host buffer,
    /// regardless of on-disk encoding. Every operator in this engine computes
    /// in fp32 (§4.6), so loading always normalizes to fp32 at this boundary
    /// rather than carrying per-dtype dispatch through the transformer model.
    pub fn decode_fp32(&self) -> Result<Vec<f32>, ContainerError> {
        if self.bytes.len() < self.expected_bytes() {
            return Err(ContainerError::SizeMismatch {
                name: self.name.clone(),
                declared: self.expected_bytes(),
                actual: self.bytes.len(),
            });
        }
        let elements = self.element_count();
        Ok(match self.element_type {
            ElementType::Fp32 => self
                .bytes
                .chunks_exact(4)
                .take(elements)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            ElementType::Fp16 => self
                .bytes
                .chunks_exact(2)
                .take(elements)
                .map(|b| float::fp16_to_fp32(half::f16::from_bits(u16::from_le_bytes([b[0], b[1]]))))
                .collect(),
            ElementType::Q8_0 => {
                let mut out = vec![0f32; elements];
                float::q8_0_dequantize(&self.bytes, elements, &mut out);
                out
            }
        })
    }
}

/// Name-keyed tensor catalog, as handed to `Model::init` alongside
/// [`Metadata`].
#[derive(Debug, Clone, Default)]
pub struct TensorCatalog(HashMap<String, TensorDescriptor>);

impl TensorCatalog {
    pub fn new() -> TensorCatalog {
        TensorCatalog(HashMap::new())
    }

    pub fn insert(&mut self, descriptor: TensorDescriptor) {
        self.0.insert(descriptor.name.clone(), descriptor);
    }

    pub fn require(&self, name: &str) -> Result<&TensorDescriptor, ContainerError> {
        self.0
            .get(name)
            .ok_or_else(|| ContainerError::MissingTensor(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(dimensions: Vec<usize>, element_type: ElementType, bytes: Vec<u8>) -> TensorDescriptor {
        TensorDescriptor {
            name: "t".to_string(),
            dimensions,
            element_type,
            bytes,
        }
    }

    #[test]
    fn shape_chw_reverses_gguf_dimension_order() {
        assert_eq!(descriptor(vec![512], ElementType::Fp32, vec![]).shape_chw(), (1, 1, 512));
        assert_eq!(
            descriptor(vec![512, 1024], ElementType::Fp32, vec![]).shape_chw(),
            (1, 1024, 512)
        );
        assert_eq!(
            descriptor(vec![64, 256, 8], ElementType::Fp32, vec![]).shape_chw(),
            (8, 256, 64)
        );
    }

    #[test]
    fn expected_bytes_matches_element_type() {
        let d = descriptor(vec![4, 4], ElementType::Fp32, vec![]);
        assert_eq!(d.expected_bytes(), 16 * 4);
        let d = descriptor(vec![4, 4], ElementType::Fp16, vec![]);
        assert_eq!(d.expected_bytes(), 16 * 2);
        let d = descriptor(vec![64], ElementType::Q8_0, vec![]);
        assert_eq!(d.expected_bytes(), 2 * float::Q8_0_BLOCK_BYTES);
    }

    #[test]
    fn decode_fp32_roundtrips_fp32_bytes() {
        let values = [1.0f32, -2.5, 0.0, 3.25];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let d = descriptor(vec![4], ElementType::Fp32, bytes);
        assert_eq!(d.decode_fp32().unwrap(), values);
    }

    #[test]
    fn decode_fp32_rejects_short_buffers() {
        let d = descriptor(vec![4], ElementType::Fp32, vec![0u8; 4]);
        assert!(matches!(d.decode_fp32(), Err(ContainerError::SizeMismatch { .. })));
    }

    #[test]
    fn metadata_missing_key_is_an_error() {
        let metadata = Metadata::new();
        assert!(matches!(
            metadata.require_uint32("llama.block_count"),
            Err(ContainerError::MissingMetadataKey(_))
        ));
    }

    #[test]
    fn metadata_roundtrips_inserted_values() {
        let mut metadata = Metadata::new();
        metadata.insert("llama.block_count", MetadataValue::Uint32(32));
        metadata.insert("llama.attention.layer_norm_rms_epsilon", MetadataValue::Float32(1e-5));
        assert_eq!(metadata.require_uint32("llama.block_count").unwrap(), 32);
        assert_eq!(
            metadata.require_float32("llama.attention.layer_norm_rms_epsilon").unwrap(),
            1e-5
        );
    }

    #[test]
    fn catalog_missing_tensor_is_an_error() {
        let catalog = TensorCatalog::new();
        assert!(matches!(catalog.require("token_embd.weight"), Err(ContainerError::MissingTensor(_))));
    }
}
