use crate::config::ModelSettings;
use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::{BatchAddError, LlamaBatch};
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::{
    DecodeError, LlamaContextLoadError, LlamaCppError, LlamaModelLoadError, LogOptions,
    StringToTokenError, TokenToStringError,
};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

// Fixed sampling parameters; requests only choose length and stop sequences.
const TOP_K: i32 = 40;
const TOP_P: f32 = 0.95;
const MIN_P: f32 = 0.05;
const TEMPERATURE: f32 = 0.8;
/// `LLAMA_DEFAULT_SEED`: llama.cpp draws a fresh random seed for the sampler.
const DEFAULT_SEED: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to initialise llama.cpp: {0}")]
    Backend(#[from] LlamaCppError),
    #[error("model file '{}' does not exist", .0.display())]
    ModelNotFound(PathBuf),
    #[error("failed to load model '{}': {source}", .path.display())]
    Load {
        path: PathBuf,
        source: LlamaModelLoadError,
    },
    #[error("failed to create context: {0}")]
    Context(#[from] LlamaContextLoadError),
    #[error("tokenization failed: {0}")]
    Tokenize(#[from] StringToTokenError),
    #[error("requested tokens ({prompt}) exceed context window of {n_ctx}")]
    ContextOverflow { prompt: usize, n_ctx: usize },
    #[error("batch error: {0}")]
    Batch(#[from] BatchAddError),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("detokenization failed: {0}")]
    Detokenize(#[from] TokenToStringError),
    #[error("generation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("model returned no choices")]
    NoChoices,
}

/// Arguments of a single completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Tokens to generate; zero or negative means until the context is full
    pub max_tokens: i32,
    pub stop: Vec<String>,
    /// Prepend the prompt to the returned text
    pub echo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub text: String,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub choices: Vec<Choice>,
}

/// A text-completion engine.
#[async_trait]
pub trait LlmBackend: Send + Sync + 'static {
    async fn generate(&self, request: GenerationRequest) -> Result<Completion, EngineError>;
}

/// llama.cpp engine holding one loaded GGUF model.
///
/// The model is shared between requests; every call gets its own context, so
/// concurrent requests never touch the same KV cache.
pub struct LlamaEngine {
    inner: Arc<Inner>,
}

struct Inner {
    // Dropped before the backend it was loaded with.
    model: LlamaModel,
    backend: LlamaBackend,
    settings: ModelSettings,
}

impl LlamaEngine {
    pub fn load(path: &Path, settings: &ModelSettings) -> Result<Self, EngineError> {
        check_model_path(path)?;
        llama_cpp_2::send_logs_to_tracing(LogOptions::default());
        let backend = LlamaBackend::init()?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(settings.n_gpu_layers);
        let model = LlamaModel::load_from_file(&backend, path, &model_params).map_err(|source| {
            EngineError::Load {
                path: path.to_path_buf(),
                source,
            }
        })?;

        info!(
            "Loaded model {} ({} params, trained context {})",
            path.display(),
            model.n_params(),
            model.n_ctx_train()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                model,
                backend,
                settings: settings.clone(),
            }),
        })
    }
}

#[async_trait]
impl LlmBackend for LlamaEngine {
    async fn generate(&self, request: GenerationRequest) -> Result<Completion, EngineError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.generate(&request)).await?
    }
}

impl Inner {
    fn generate(&self, request: &GenerationRequest) -> Result<Completion, EngineError> {
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.settings.n_ctx))
            .with_n_batch(self.settings.n_batch);
        let mut ctx = self.model.new_context(&self.backend, ctx_params)?;
        let n_ctx = ctx.n_ctx() as usize;

        let tokens = self.model.str_to_token(&request.prompt, AddBos::Always)?;
        if tokens.is_empty() || tokens.len() >= n_ctx {
            return Err(EngineError::ContextOverflow {
                prompt: tokens.len(),
                n_ctx,
            });
        }
        let limit = token_limit(request.max_tokens, n_ctx - tokens.len());
        debug!("Prompt is {} tokens, generating up to {}", tokens.len(), limit);

        // Prompt evaluation, n_batch tokens at a time; only the last token needs logits.
        let n_batch = ctx.n_batch().max(1) as usize;
        let mut batch = LlamaBatch::new(n_batch, 1);
        let last = tokens.len() - 1;
        for (chunk_index, chunk) in tokens.chunks(n_batch).enumerate() {
            batch.clear();
            for (offset, token) in chunk.iter().enumerate() {
                let pos = chunk_index * n_batch + offset;
                batch.add(*token, pos as i32, &[0], pos == last)?;
            }
            ctx.decode(&mut batch)?;
        }

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::top_k(TOP_K),
            LlamaSampler::top_p(TOP_P, 1),
            LlamaSampler::min_p(MIN_P, 1),
            LlamaSampler::temp(TEMPERATURE),
            LlamaSampler::dist(DEFAULT_SEED),
        ]);

        let stops: Vec<&[u8]> = request
            .stop
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes())
            .collect();
        let mut output: Vec<u8> = Vec::new();
        let mut finish_reason = FinishReason::Length;
        let mut n_cur = tokens.len() as i32;

        for _ in 0..limit {
            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            if self.model.is_eog_token(token) {
                finish_reason = FinishReason::Stop;
                break;
            }

            let scanned = output.len();
            output.extend(self.model.token_to_bytes(token, Special::Plaintext)?);
            if let Some(pos) = find_stop(&output, &stops, scanned) {
                output.truncate(pos);
                finish_reason = FinishReason::Stop;
                break;
            }

            batch.clear();
            batch.add(token, n_cur, &[0], true)?;
            n_cur += 1;
            ctx.decode(&mut batch)?;
        }

        Ok(Completion {
            choices: vec![Choice {
                text: render_text(request, &output),
                finish_reason,
            }],
        })
    }
}

/// Number of tokens to generate given the request and the room left in context.
fn token_limit(max_tokens: i32, room: usize) -> usize {
    if max_tokens <= 0 {
        room
    } else {
        (max_tokens as usize).min(room)
    }
}

/// Earliest byte offset of any stop sequence in `text`.
///
/// Bytes before `scanned` were already searched on a previous step, so only
/// matches that end past it are considered.
fn find_stop(text: &[u8], stops: &[&[u8]], scanned: usize) -> Option<usize> {
    stops
        .iter()
        .filter_map(|stop| {
            let from = scanned.saturating_sub(stop.len().saturating_sub(1));
            text.get(from..)?
                .windows(stop.len())
                .position(|window| window == *stop)
                .map(|pos| from + pos)
        })
        .min()
}

/// Turn generated bytes into the choice text, prefixing the prompt on echo.
/// A multi-byte character cut off by the token limit is replaced, not an error.
fn render_text(request: &GenerationRequest, output: &[u8]) -> String {
    let generated = String::from_utf8_lossy(output);
    if request.echo {
        format!("{}{}", request.prompt, generated)
    } else {
        generated.into_owned()
    }
}

// llama.cpp asserts on a missing file in debug builds instead of returning an error.
fn check_model_path(path: &Path) -> Result<(), EngineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(EngineError::ModelNotFound(path.to_path_buf()))
    }
}
