//! Transformer model: input embedding, `N` repeated blocks, output head, and
//! the `step` entry point that drives one decode iteration.
//!
//! Grounded on `examples/original_source/models/llama2.h`'s `Model` class
//! (`InputLayer` / `Llama2Block` / `OutputLayer`, one `Command` per stage)
//! and `examples/original_source/src/models/llama2.cpp`'s simpler
//! single-command variant; this port keeps the three-command-class shape
//! (input, one per block, output) the header version uses, since that is
//! what lets each block's command buffer be submitted independently per
//! §4.7/§5.

use std::sync::Arc;

use crate::command::CommandEncoder;
use crate::config::EngineConfig;
use crate::container::{Metadata, TensorCatalog};
use crate::device::Device;
use crate::error::{ContainerError, EngineError};
use crate::operators::attention::MultiHeadAttention;
use crate::operators::elementwise::{BinOp, Elementwise};
use crate::operators::embedding::Embedding;
use crate::operators::feed_forward::FeedForward;
use crate::operators::matmul::{Activation, Broadcast, MatMul};
use crate::operators::rmsnorm::RmsNorm;
use crate::operators::slice::Slice;
use crate::tensor::{DType, Tensor};

const METADATA_PREFIX: &str = "llama";

fn metadata_key(suffix: &str) -> String {
    format!("{METADATA_PREFIX}.{suffix}")
}

/// Uploads `name`'s bytes into a freshly created fp32 device tensor shaped
/// by its declared dimensions, decoding whatever on-disk element type it
/// was stored as (§6).
fn upload_weight(
    command: &mut CommandEncoder,
    device: &Arc<Device>,
    catalog: &TensorCatalog,
    name: &str,
) -> Result<Tensor, EngineError> {
    let descriptor = catalog.require(name)?;
    let host = descriptor.decode_fp32()?;
    let tensor = Tensor::new(
        device,
        descriptor.shape_chw(),
        DType::Fp32,
        ash::vk::BufferUsageFlags::empty(),
        false,
    )?;
    command.upload(bytemuck::cast_slice(&host), &tensor)?;
    Ok(tensor)
}

/// One transformer layer's operators and weights: `RMSNorm -> attention ->
/// residual add -> RMSNorm -> feed-forward -> residual add`, matching
/// `Llama2Block::operator()`.
struct Block {
    attn_norm_weight: Tensor,
    ffn_norm_weight: Tensor,
    w_q: Tensor,
    w_k: Tensor,
    w_v: Tensor,
    w_o: Tensor,
    w_gate: Tensor,
    w_up: Tensor,
    w_down: Tensor,
    k_cache: Tensor,
    v_cache: Tensor,

    norm: RmsNorm,
    attention: MultiHeadAttention,
    feed_forward: FeedForward,
    add: Elementwise,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    fn load(
        device: &Arc<Device>,
        command: &mut CommandEncoder,
        catalog: &TensorCatalog,
        index: usize,
        heads: usize,
        head_dim: usize,
        context_length: usize,
    ) -> Result<Block, EngineError> {
        let name = |suffix: &str| format!("blk.{index}.{suffix}");

        let attn_norm_weight = upload_weight(command, device, catalog, &name("attn_norm.weight"))?;
        let ffn_norm_weight = upload_weight(command, device, catalog, &name("ffn_norm.weight"))?;
        let w_q = upload_weight(command, device, catalog, &name("attn_q.weight"))?;
        let w_k = upload_weight(command, device, catalog, &name("attn_k.weight"))?;
        let w_v = upload_weight(command, device, catalog, &name("attn_v.weight"))?;
        let w_o = upload_weight(command, device, catalog, &name("attn_output.weight"))?;
        let w_gate = upload_weight(command, device, catalog, &name("ffn_gate.weight"))?;
        let w_up = upload_weight(command, device, catalog, &name("ffn_up.weight"))?;
        let w_down = upload_weight(command, device, catalog, &name("ffn_down.weight"))?;

        let k_cache = Tensor::new(
            device,
            (heads, context_length, head_dim),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        let v_cache = Tensor::new(
            device,
            (heads, context_length, head_dim),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;

        Ok(Block {
            attn_norm_weight,
            ffn_norm_weight,
            w_q,
            w_k,
            w_v,
            w_o,
            w_gate,
            w_up,
            w_down,
            k_cache,
            v_cache,
            norm: RmsNorm::new(device)?,
            attention: MultiHeadAttention::new(device, heads, head_dim)?,
            feed_forward: FeedForward::new(device)?,
            add: Elementwise::new(device, BinOp::Add)?,
        })
    }

    fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        x: &Tensor,
        eps: f32,
        past_length: usize,
    ) -> Result<Tensor, EngineError> {
        let normed = self.norm.call(command, device, x, &self.attn_norm_weight, eps)?;
        let attended = self.attention.call(
            command,
            device,
            &normed,
            &self.w_q,
            &self.w_k,
            &self.w_v,
            &self.w_o,
            &self.k_cache,
            &self.v_cache,
            past_length,
        )?;
        let residual1 = self.add.call(command, device, x, &attended)?;

        let normed2 = self.norm.call(command, device, &residual1, &self.ffn_norm_weight, eps)?;
        let fed_forward = self
            .feed_forward
            .call(command, device, &normed2, &self.w_gate, &self.w_up, &self.w_down)?;
        self.add.call(command, device, &residual1, &fed_forward)
    }
}

/// Loaded LLaMA-family model plus its persistent per-layer KV caches. Owns
/// the device and one [`CommandEncoder`] per stage class (input, each block,
/// output), matching the original `Model`'s three-`Command`-class layout.
pub struct Model {
    device: Arc<Device>,
    vocab: Tensor,
    output_weight: Tensor,
    output_norm_weight: Tensor,
    blocks: Vec<Block>,
    eps: f32,
    vocab_size: usize,

    embedding: Embedding,
    output_norm: RmsNorm,
    output_proj: MatMul,
    last_row: Slice,

    input_command: CommandEncoder,
    block_commands: Vec<CommandEncoder>,
    output_command: CommandEncoder,

    /// Set by `step_inner` once the output head has recorded its final
    /// slice; read back by `take_logits` after every fence has signaled.
    pending_logits: Option<(Tensor, usize)>,
}

impl Model {
    /// Reads `{head_count, block_count, layer_norm_rms_epsilon,
    /// context_length}` from `metadata`, uploads every required tensor from
    /// `tensors` (§6), and waits for all upload fences before returning.
    pub fn init(config: &EngineConfig, metadata: &Metadata, tensors: &TensorCatalog) -> Result<Model, EngineError> {
        let device = Device::init(config)?;

        let head_count = metadata.require_uint32(&metadata_key("attention.head_count"))? as usize;
        let block_count = metadata.require_uint32(&metadata_key("block_count"))? as usize;
        let eps = metadata.require_float32(&metadata_key("attention.layer_norm_rms_epsilon"))?;
        let context_length = metadata.require_uint32(&metadata_key("context_length"))? as usize;

        let mut input_command = CommandEncoder::new(&device)?;
        let mut output_command = CommandEncoder::new(&device)?;
        input_command.begin()?;
        output_command.begin()?;

        let vocab = upload_weight(&mut input_command, &device, tensors, "token_embd.weight")?;
        let output_weight = upload_weight(&mut output_command, &device, tensors, "output.weight")?;
        let output_norm_weight = upload_weight(&mut input_command, &device, tensors, "output_norm.weight")?;

        let (_, vocab_size, d_model) = vocab.shape();
        if head_count == 0 || d_model % head_count != 0 {
            return Err(ContainerError::InvalidHeadCount { d_model, head_count }.into());
        }
        let head_dim = d_model / head_count;

        input_command.end()?;
        output_command.end()?;
        input_command.submit()?;
        output_command.submit()?;

        let mut block_commands = Vec::with_capacity(block_count);
        let mut blocks = Vec::with_capacity(block_count);
        for b in 0..block_count {
            let mut command = CommandEncoder::new(&device)?;
            command.begin()?;
            let block = Block::load(&device, &mut command, tensors, b, head_count, head_dim, context_length)?;
            command.end()?;
            command.submit()?;
            block_commands.push(command);
            blocks.push(block);
        }

        input_command.wait()?;
        output_command.wait()?;
        for command in &mut block_commands {
            command.wait()?;
        }

        Ok(Model {
            embedding: Embedding::new(&device)?,
            output_norm: RmsNorm::new(&device)?,
            output_proj: MatMul::new(&device, Activation::None, Broadcast::PerChannel, true)?,
            last_row: Slice::new(&device)?,
            device,
            vocab,
            output_weight,
            output_norm_weight,
            blocks,
            eps,
            vocab_size,
            input_command,
            block_commands,
            output_command,
            pending_logits: None,
        })
    }

    /// Vocabulary width of the loaded model's output projection.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Records the embedding, every block (attention with KV offset
    /// `past_length`), and the output head as three command-buffer classes,
    /// submits them in order, waits on every fence, and returns the logits
    /// at the final sequence position. Any operator error aborts recording,
    /// but every command buffer already submitted is still awaited so their
    /// deferred staging releases still run (§4.7).
    pub fn step(&mut self, tokens: &[u32], past_length: usize) -> Result<Vec<f32>, EngineError> {
        let result = self.step_inner(tokens, past_length);

        let mut first_error = result.err();
        if let Err(e) = self.input_command.wait() {
            first_error.get_or_insert_with(|| e.into());
        }
        for command in &mut self.block_commands {
            if let Err(e) = command.wait() {
                first_error.get_or_insert_with(|| e.into());
            }
        }
        if let Err(e) = self.output_command.wait() {
            first_error.get_or_insert_with(|| e.into());
        }

        match first_error {
            Some(e) => Err(e),
            None => self.take_logits(),
        }
    }

    fn step_inner(&mut self, tokens: &[u32], past_length: usize) -> Result<(), EngineError> {
        let seq = tokens.len();

        self.input_command.begin()?;
        let ids = Tensor::new(
            &self.device,
            (1, 1, seq),
            DType::Uint32,
            ash::vk::BufferUsageFlags::empty(),
            true,
        )?;
        self.input_command.upload(bytemuck::cast_slice(tokens), &ids)?;
        let mut hidden = self.embedding.call(&mut self.input_command, &self.device, &ids, &self.vocab)?;
        self.input_command.end()?;
        self.input_command.submit()?;

        for (command, block) in self.block_commands.iter_mut().zip(&self.blocks) {
            command.begin()?;
            hidden = block.call(command, &self.device, &hidden, self.eps, past_length)?;
            command.end()?;
            command.submit()?;
        }

        self.output_command.begin()?;
        let normed = self
            .output_norm
            .call(&mut self.output_command, &self.device, &hidden, &self.output_norm_weight, self.eps)?;
        let logits = self
            .output_proj
            .call(&mut self.output_command, &self.device, &normed, &self.output_weight, 1.0, 0.0)?;

        let (_, _, width) = logits.shape();
        let last_row = self.last_row.call(&mut self.output_command, &self.device, &logits, 0, seq - 1, 0, 1, 1, width)?;

        self.pending_logits = Some((last_row, width));
        self.output_command.end()?;
        self.output_command.submit()?;
        Ok(())
    }

    fn take_logits(&mut self) -> Result<Vec<f32>, EngineError> {
        let (tensor, width) = self
            .pending_logits
            .take()
            .expect("step_inner sets pending_logits whenever it returns Ok");
        let mut host = vec![0f32; width];
        let mut download_command = CommandEncoder::new(&self.device)?;
        download_command.begin()?;
        download_command.download(&tensor, bytemuck::cast_slice_mut(&mut host))?;
        download_command.end()?;
        download_command.submit_and_wait()?;
        Ok(host)
    }
}
