use crate::gateways::generation::SYSTEM_PROMPT;
use crate::gateways::{GenerationBackend, GenerationRequest};
use crate::types::{ErrorKind, GenerationOutput};
use async_trait::async_trait;
use ollama_rs::{
    error::OllamaError,
    generation::chat::{request::ChatMessageRequest, ChatMessage},
    Ollama,
};

const DEFAULT_PORT: u16 = 11434;

/// Fragments of Ollama error bodies that mean the request itself is wrong.
const REJECTION_MARKERS: &[&str] = &["not found", "invalid", "required", "unsupported"];

/// Local generation through an Ollama server. Ollama reports no token
/// likelihoods, so outputs carry no logprobs.
pub struct OllamaGenerator {
    client: Ollama,
    model: String,
}

impl OllamaGenerator {
    pub fn new(base_url: &str, model: String) -> Self {
        let (host, port) = split_host_port(base_url);
        Self {
            client: Ollama::new(host, port),
            model,
        }
    }
}

/// `http://host:port` into (`http://host`, port).
fn split_host_port(base_url: &str) -> (String, u16) {
    let trimmed = base_url.trim_end_matches('/');
    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", trimmed),
    };

    match rest.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (format!("{}://{}", scheme, host), port),
            Err(_) => (format!("{}://{}", scheme, rest), DEFAULT_PORT),
        },
        None => (format!("{}://{}", scheme, rest), DEFAULT_PORT),
    }
}

/// ollama-rs drops the HTTP status of a failed call and keeps only the body,
/// so rejections are recognised by the server's error message.
fn classify_error(err: OllamaError) -> ErrorKind {
    match err {
        OllamaError::ReqwestError(e) if e.is_timeout() => ErrorKind::Timeout,
        OllamaError::ReqwestError(e) if e.is_decode() => ErrorKind::Malformed(e.to_string()),
        OllamaError::ReqwestError(e) => ErrorKind::Transport(format!("Ollama error: {}", e)),
        OllamaError::JsonError(e) => ErrorKind::Malformed(format!("Ollama response: {}", e)),
        OllamaError::InternalError(e) => ErrorKind::Rejected(format!("Ollama: {}", e.message)),
        OllamaError::ToolCallError(e) => ErrorKind::Rejected(format!("Ollama: {}", e)),
        OllamaError::Other(body) => {
            let lowered = body.to_lowercase();
            let detail = format!("Ollama: {}", body.chars().take(200).collect::<String>());
            if REJECTION_MARKERS.iter().any(|m| lowered.contains(m)) {
                ErrorKind::Rejected(detail)
            } else {
                ErrorKind::Transport(detail)
            }
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ErrorKind> {
        let messages = vec![
            ChatMessage::system(SYSTEM_PROMPT.to_string()),
            ChatMessage::user(request.prompt()),
        ];
        let chat = ChatMessageRequest::new(self.model.clone(), messages);

        let response = self
            .client
            .send_chat_messages(chat)
            .await
            .map_err(classify_error)?;

        let text = response.message.content;
        if text.trim().is_empty() {
            return Err(ErrorKind::Malformed("empty completion".into()));
        }

        Ok(GenerationOutput {
            text,
            per_token_logprobs: None,
        })
    }

    fn name(&self) -> &str {
        &self.model
    }
}
