//! Generation backends
//!
//! Concrete [`GenerationBackend`] implementations and the factory that picks
//! one from `[gateways.generation]`.
//!
//! Providers:
//! - `openai`: any OpenAI-compatible chat completions endpoint, with logprobs
//! - `ollama`: local Ollama server (Cargo feature `ollama`)

pub mod openai;

#[cfg(feature = "ollama")]
pub mod ollama;

pub use openai::OpenAiCompatibleGenerator;

#[cfg(feature = "ollama")]
pub use ollama::OllamaGenerator;

use crate::gateways::GenerationBackend;
use crate::types::AppError;
use crate::utils::toml_config::{GenerationProviderConfig, TriangulateConfig};
use std::sync::Arc;
use tracing::info;

/// Build the generation backend described by `provider`.
pub fn generation_backend(
    provider: &GenerationProviderConfig,
    client: reqwest::Client,
    config: &TriangulateConfig,
) -> Result<Arc<dyn GenerationBackend>, AppError> {
    match provider {
        GenerationProviderConfig::OpenAi {
            api_key_env,
            api_base,
            model,
            temperature,
            max_tokens,
        } => {
            let api_key = config.resolve_env(api_key_env).ok_or_else(|| {
                AppError::Configuration(format!(
                    "environment variable {} is not set",
                    api_key_env
                ))
            })?;
            info!(model = %model, api_base = %api_base, "Using OpenAI-compatible generation");
            Ok(Arc::new(
                OpenAiCompatibleGenerator::new(client, api_key, api_base.clone(), model.clone())
                    .with_sampling(*temperature, *max_tokens),
            ))
        }
        #[cfg(feature = "ollama")]
        GenerationProviderConfig::Ollama { base_url, model } => {
            info!(model = %model, base_url = %base_url, "Using Ollama generation");
            Ok(Arc::new(OllamaGenerator::new(base_url, model.clone())))
        }
        #[cfg(not(feature = "ollama"))]
        GenerationProviderConfig::Ollama { .. } => Err(AppError::Configuration(
            "Ollama generation requires the 'ollama' feature".into(),
        )),
    }
}
