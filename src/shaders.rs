//! Embedded, build-time-compiled SPIR-V for every compute kernel.
//!
//! Each constant is the `OUT_DIR`-relative blob `build.rs` produced from the
//! matching `shaders/<name>.comp` source, pulled in with `include_bytes!`
//! exactly as `db30f1bd_gfx-rs-gfx__examples-hal-compute-main.rs.rs` embeds
//! its own `collatz.spv`. [`Shader::code`] reinterprets the bytes as the
//! `&[u32]` word stream `vkCreateShaderModule` (and `ash`'s
//! `ShaderModuleCreateInfo::code`) expects.

macro_rules! embedded_shader {
    ($name:ident, $file:literal) => {
        pub static $name: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/", $file, ".spv"));
    };
}

embedded_shader!(MATMUL, "matmul");
embedded_shader!(RMSNORM_PARTIAL, "rmsnorm_partial");
embedded_shader!(RMSNORM_REDUCE, "rmsnorm_reduce");
embedded_shader!(RMSNORM_APPLY, "rmsnorm_apply");
embedded_shader!(SOFTMAX_PARTIAL, "softmax_partial");
embedded_shader!(SOFTMAX_REDUCE, "softmax_reduce");
embedded_shader!(SOFTMAX_APPLY, "softmax_apply");
embedded_shader!(ROPE, "rope");
embedded_shader!(REDUCE_PARTIAL, "reduce_partial");
embedded_shader!(REDUCE_FINAL, "reduce_final");
embedded_shader!(EMBEDDING, "embedding");
embedded_shader!(TRANSPOSE, "transpose");
embedded_shader!(SLICE, "slice");
embedded_shader!(CONCAT, "concat");
embedded_shader!(CAST_F32_TO_F16, "cast_f32_to_f16");
embedded_shader!(CAST_F16_TO_F32, "cast_f16_to_f32");
embedded_shader!(ELEMENTWISE, "elementwise");
embedded_shader!(ELEMENTWISE_CONSTANT, "elementwise_constant");
embedded_shader!(KV_CACHE_UPDATE, "kv_cache_update");
embedded_shader!(ARGMAX_PARTIAL, "argmax_partial");
embedded_shader!(ARGMAX_FINAL, "argmax_final");

/// Reinterprets an embedded SPIR-V byte blob as the `u32` word stream Vulkan
/// requires. `build.rs` always emits 4-byte-aligned output, and `shaderc`
/// never emits anything but whole words, so this only ever panics on a
/// corrupted build output.
pub fn code(bytes: &[u8]) -> &[u32] {
    bytemuck::cast_slice(bytes)
}
