//! Minimal smoke-test entry point: initializes the Vulkan device and prints
//! its capabilities. Full inference (`model::Model::init` + `step`) needs a
//! container-file parser and tokenizer, both external collaborators this
//! crate does not implement (see `DESIGN.md`) — grounded in the overall
//! flow of `examples/original_source/app/llama2_infer.cpp`, scaled down to
//! what this crate actually owns: device/queue setup and capability
//! detection, which is exactly the part `llama2_infer.cpp` treats as a
//! black box behind `vkllama::Model`.

use std::process::ExitCode;

use vkllama::{Device, EngineConfig};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let physical_device_index = std::env::args()
        .nth(1)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);

    let config = EngineConfig::default().physical_device_index(physical_device_index);

    let device = match Device::init(&config) {
        Ok(device) => device,
        Err(e) => {
            log::error!("failed to initialize device: {e}");
            return ExitCode::FAILURE;
        }
    };

    let caps = device.capabilities();
    log::info!("device ready: {caps:?}");
    println!("vkllama: device initialized (physical_device_index={physical_device_index})");
    println!("  16-bit storage:            {}", caps.storage_16bit);
    println!("  fp16 shader arithmetic:    {}", caps.fp16_arithmetic);
    println!("  descriptor update template: {}", caps.descriptor_update_template);
    println!("  timestamp queries:         {}", caps.timestamp_queries);

    ExitCode::SUCCESS
}
