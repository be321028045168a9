use crate::confidence::ConfidenceLevel;
use crate::merge::NarrativeFragment;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Instructions sent as the system message to every generation backend.
pub const SYSTEM_PROMPT: &str = "You are a careful clinical assistant. Answer only from the \
evidence provided. Cite every statement with the evidence id in square brackets, for example \
[doc1]. If the evidence is insufficient or conflicting, say so plainly instead of guessing.";

const MAX_FRAGMENT_CHARS: usize = 600;

/// Everything the generation gateway needs to synthesize an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub question: String,
    /// Evidence gathered so far, in merge order
    pub context: Vec<NarrativeFragment>,
    /// Preliminary confidence before generation contributed
    pub confidence_hint: ConfidenceLevel,
}

impl GenerationRequest {
    pub fn new(
        question: impl Into<String>,
        context: Vec<NarrativeFragment>,
        confidence_hint: ConfidenceLevel,
    ) -> Self {
        Self {
            question: question.into(),
            context,
            confidence_hint,
        }
    }

    /// User prompt: question, cited evidence, and the confidence hint.
    pub fn prompt(&self) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "Question: {}", self.question);
        prompt.push('\n');

        if self.context.is_empty() {
            prompt.push_str("Evidence: none available.\n");
        } else {
            prompt.push_str("Evidence:\n");
            for fragment in &self.context {
                let text: String = fragment.text.chars().take(MAX_FRAGMENT_CHARS).collect();
                let _ = writeln!(
                    prompt,
                    "[{}] ({}) {}",
                    fragment.citation_id, fragment.source_kind, text
                );
            }
        }

        prompt.push('\n');
        let _ = writeln!(
            prompt,
            "Preliminary evidence confidence: {}.",
            self.confidence_hint
        );
        if self.confidence_hint == ConfidenceLevel::Low {
            prompt.push_str(
                "The evidence is weak; state the uncertainty explicitly and recommend expert review.\n",
            );
        }
        prompt.push_str("Answer concisely and cite evidence ids.");
        prompt
    }
}
