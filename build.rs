//! Compiles every `shaders/*.comp` GLSL compute shader to SPIR-V with
//! `shaderc` at build time, writing `<name>.spv` files into `OUT_DIR`.
//!
//! The pack's retrieved GLSL sources were pre-compiled upstream, so there is
//! no checked-in `.spv` to `include_bytes!` directly; compiling from source
//! here keeps the shader text reviewable and lets `shaderc`'s validator catch
//! mistakes before `vkCreateShaderModule` ever sees the bytecode, the same
//! build-time-compile approach used for the embedded compute shader in
//! `db30f1bd_gfx-rs-gfx__examples-hal-compute-main.rs.rs`.

use std::path::Path;

fn main() {
    let shader_dir = Path::new("shaders");
    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR set by cargo");

    let mut compiler = shaderc::Compiler::new().expect("failed to initialize shaderc");
    let mut options = shaderc::CompileOptions::new().expect("failed to initialize shaderc options");
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_2 as u32);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let entries = std::fs::read_dir(shader_dir).expect("shaders/ directory must exist");
    for entry in entries {
        let entry = entry.expect("readable shaders/ directory entry");
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("comp") {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .expect("shader filename must be valid UTF-8")
            .to_owned();

        println!("cargo:rerun-if-changed={}", path.display());
        let source = std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));

        let artifact = compiler
            .compile_into_spirv(
                &source,
                shaderc::ShaderKind::Compute,
                path.to_str().unwrap(),
                "main",
                Some(&options),
            )
            .unwrap_or_else(|e| panic!("failed to compile {}: {e}", path.display()));

        let out_path = Path::new(&out_dir).join(format!("{stem}.spv"));
        std::fs::write(&out_path, artifact.as_binary_u8())
            .unwrap_or_else(|e| panic!("failed to write {}: {e}", out_path.display()));
    }

    println!("cargo:rerun-if-changed=shaders");
}
