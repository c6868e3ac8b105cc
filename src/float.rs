//! FP16 conversion and Q8_0 block (de)quantization.
//!
//! fp16↔fp32 conversion is delegated to [`half::f16`], which implements the
//! same round-to-nearest IEEE-754 binary16 semantics the GLSL shaders expect
//! on the device side. This module's own job is the host-side Q8_0 block
//! codec, which has no hardware counterpart and runs purely on the CPU while
//! preparing weights for upload.

use half::f16;

/// Number of int8 weights per Q8_0 block.
pub const Q8_0_BLOCK_SIZE: usize = 32;
/// On-disk/in-memory size of one Q8_0 block: a 2-byte fp16 scale followed by
/// 32 signed bytes.
pub const Q8_0_BLOCK_BYTES: usize = 2 + Q8_0_BLOCK_SIZE;

#[inline]
pub fn fp32_to_fp16(v: f32) -> f16 {
    f16::from_f32(v)
}

#[inline]
pub fn fp16_to_fp32(v: f16) -> f32 {
    v.to_f32()
}

/// One decoded Q8_0 block: a scale and 32 signed weights.
#[derive(Debug, Clone, Copy)]
pub struct Q8_0Block {
    pub scale: f32,
    pub weights: [i8; Q8_0_BLOCK_SIZE],
}

/// Quantizes `src` into a sequence of 34-byte Q8_0 blocks, writing into
/// `dst`. `dst` must be at least `Q8_0_BLOCK_BYTES * ceil(src.len() /
/// Q8_0_BLOCK_SIZE)` bytes.
///
/// Returns the number of blocks written.
pub fn q8_0_quantize(src: &[f32], dst: &mut [u8]) -> usize {
    let block_count = src.len().div_ceil(Q8_0_BLOCK_SIZE);
    assert!(dst.len() >= block_count * Q8_0_BLOCK_BYTES);

    for (b, chunk) in src.chunks(Q8_0_BLOCK_SIZE).enumerate() {
        let max_abs = chunk.iter().fold(0f32, |acc, &v| acc.max(v.abs()));
        let scale = max_abs / 127.0;
        let inv_scale = if scale > 0.0 { 127.0 / max_abs } else { 0.0 };

        let block = &mut dst[b * Q8_0_BLOCK_BYTES..(b + 1) * Q8_0_BLOCK_BYTES];
        block[0..2].copy_from_slice(&fp32_to_fp16(scale).to_bits().to_le_bytes());
        for (i, &v) in chunk.iter().enumerate() {
            block[2 + i] = (v * inv_scale).round() as i8;
        }
        for i in chunk.len()..Q8_0_BLOCK_SIZE {
            block[2 + i] = 0;
        }
    }

    block_count
}

/// Dequantizes `n` elements out of Q8_0-encoded `src` into `dst`.
pub fn q8_0_dequantize(src: &[u8], n: usize, dst: &mut [f32]) {
    assert!(dst.len() >= n);
    let block_count = n.div_ceil(Q8_0_BLOCK_SIZE);
    assert!(src.len() >= block_count * Q8_0_BLOCK_BYTES);

    for b in 0..block_count {
        let block = &src[b * Q8_0_BLOCK_BYTES..(b + 1) * Q8_0_BLOCK_BYTES];
        let scale = f16::from_bits(u16::from_le_bytes([block[0], block[1]])).to_f32();
        let weights = &block[2..2 + Q8_0_BLOCK_SIZE];

        for i in 0..Q8_0_BLOCK_SIZE {
            let idx = b * Q8_0_BLOCK_SIZE + i;
            if idx >= n {
                break;
            }
            dst[idx] = (weights[i] as i8) as f32 * scale;
        }
    }
}

/// Number of Q8_0 blocks needed to hold `elements` scalar values.
#[inline]
pub fn q8_0_block_count(elements: usize) -> usize {
    elements.div_ceil(Q8_0_BLOCK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp16_roundtrip_normals() {
        for &v in &[1.0f32, -1.0, 0.5, 65504.0, -65504.0, 5.96e-8, 1234.5] {
            let back = fp16_to_fp32(fp32_to_fp16(v));
            let tol = (v.abs() * 2e-3).max(1e-6);
            assert!((back - v).abs() <= tol, "{v} -> {back}");
        }
    }

    #[test]
    fn fp16_roundtrip_zero_and_small() {
        assert_eq!(fp16_to_fp32(fp32_to_fp16(0.0)), 0.0);
        let tiny = 1e-10f32;
        assert_eq!(fp16_to_fp32(fp32_to_fp16(tiny)), 0.0);
    }

    #[test]
    fn q8_0_quantize_dequantize_roundtrip() {
        let src: Vec<f32> = (0..100).map(|i| (i as f32 - 50.0) * 0.37).collect();
        let blocks = q8_0_block_count(src.len());
        let mut packed = vec![0u8; blocks * Q8_0_BLOCK_BYTES];
        q8_0_quantize(&src, &mut packed);

        let mut out = vec![0f32; src.len()];
        q8_0_dequantize(&packed, src.len(), &mut out);

        for chunk_idx in 0..blocks {
            let start = chunk_idx * Q8_0_BLOCK_SIZE;
            let end = (start + Q8_0_BLOCK_SIZE).min(src.len());
            let max_abs = src[start..end].iter().fold(0f32, |a, &v| a.max(v.abs()));
            let tol = (max_abs / 127.0).max(1e-6);
            for i in start..end {
                assert!(
                    (out[i] - src[i]).abs() <= tol,
                    "block {chunk_idx} idx {i}: {} vs {}",
                    out[i],
                    src[i]
                );
            }
        }
    }

    #[test]
    fn q8_0_block_count_matches_ceil() {
        assert_eq!(q8_0_block_count(0), 0);
        assert_eq!(q8_0_block_count(1), 1);
        assert_eq!(q8_0_block_count(32), 1);
        assert_eq!(q8_0_block_count(33), 2);
    }
}
