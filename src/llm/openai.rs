//! OpenAI-compatible chat completions backend
//!
//! Works against any server speaking the `/chat/completions` protocol
//! (OpenAI, vLLM, llama.cpp server, OpenRouter). Per-token log probabilities
//! are requested so the confidence builder can score the generation; servers
//! that ignore the flag simply yield no logprobs.

use crate::gateways::generation::SYSTEM_PROMPT;
use crate::gateways::{check_status, decode_json, transport_error, GenerationBackend, GenerationRequest};
use crate::types::{ErrorKind, GenerationOutput};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    logprobs: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    logprobs: Option<ChoiceLogprobs>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceLogprobs {
    #[serde(default)]
    content: Option<Vec<TokenLogprob>>,
}

#[derive(Deserialize)]
struct TokenLogprob {
    logprob: f64,
}

pub struct OpenAiCompatibleGenerator {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatibleGenerator {
    pub fn new(client: reqwest::Client, api_key: String, api_base: String, model: String) -> Self {
        Self {
            client,
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
            temperature: 0.2,
            max_tokens: 512,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatibleGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ErrorKind> {
        let prompt = request.prompt();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            logprobs: true,
        };

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let parsed: ChatResponse = decode_json(check_status(response).await?).await?;
        into_output(parsed)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

fn into_output(response: ChatResponse) -> Result<GenerationOutput, ErrorKind> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ErrorKind::Malformed("no choices in completion".into()))?;

    let text = choice
        .message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ErrorKind::Malformed("empty completion".into()))?;

    let per_token_logprobs = choice
        .logprobs
        .and_then(|lp| lp.content)
        .map(|tokens| {
            tokens
                .into_iter()
                .map(|t| t.logprob)
                .filter(|lp| lp.is_finite())
                .collect::<Vec<_>>()
        })
        .filter(|lps| !lps.is_empty());

    Ok(GenerationOutput {
        text,
        per_token_logprobs,
    })
}
