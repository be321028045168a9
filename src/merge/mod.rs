//! Contradiction detection and narrative merging
//!
//! The merger turns successful signals into an ordered, citation-bearing list
//! of narrative fragments and reports every pair of sources that disagrees on
//! a categorical claim by more than the configured confidence gap. It never
//! picks a winner; resolving the disagreement is left to the escalation path.

use crate::confidence::ModalityWeights;
use crate::types::{QueryShape, SignalPayload, SourceKind, SourceSignal};
use crate::utils::toml_config::{ClaimTerm, MergeConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One attributed piece of evidence, ready for narrative rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeFragment {
    pub source_kind: SourceKind,
    pub text: String,
    pub citation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
}

/// Two sources asserting opposite polarities of the same claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub source_kind_a: SourceKind,
    pub source_kind_b: SourceKind,
    pub subject: String,
    pub confidence_gap: f64,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub narrative_fragments: Vec<NarrativeFragment>,
    pub contradictions: Vec<Contradiction>,
}

impl MergedResult {
    pub fn has_contradictions(&self) -> bool {
        !self.contradictions.is_empty()
    }

    pub fn citation_ids(&self) -> Vec<&str> {
        self.narrative_fragments
            .iter()
            .map(|f| f.citation_id.as_str())
            .collect()
    }
}

/// Claim polarity per subject: `true` asserts the subject, `false` denies it.
pub type Claims = BTreeMap<String, bool>;

#[derive(Debug, Clone)]
pub struct Merger {
    config: MergeConfig,
}

impl Merger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Fragments and contradictions for the signals of one request.
    ///
    /// `components` are the normalized confidences from the request's
    /// profile; they size the gap between disagreeing sources.
    pub fn merge(
        &self,
        shape: QueryShape,
        signals: &[SourceSignal],
        components: &BTreeMap<SourceKind, f64>,
    ) -> MergedResult {
        MergedResult {
            narrative_fragments: self.fragments(shape, signals),
            contradictions: self.contradictions(signals, components),
        }
    }

    /// Ordered narrative fragments.
    ///
    /// Order: confident vision, relevant retrieval passages, web results, then
    /// everything else. Within a tier, heavier modalities come first and the
    /// sources' own ranking is preserved.
    pub fn fragments(&self, shape: QueryShape, signals: &[SourceSignal]) -> Vec<NarrativeFragment> {
        let mut fragments = Vec::new();

        for signal in signals.iter().filter(|s| s.succeeded()) {
            let Some(payload) = signal.payload() else {
                continue;
            };
            match payload {
                SignalPayload::Vision(finding) => fragments.push(NarrativeFragment {
                    source_kind: SourceKind::Vision,
                    text: format!(
                        "Image classified as {} ({:.1}% confidence)",
                        finding.label,
                        finding.confidence * 100.0
                    ),
                    citation_id: "img1".to_string(),
                    relevance: Some(finding.confidence),
                }),
                SignalPayload::Retrieval(passages) => {
                    fragments.extend(passages.iter().enumerate().filter_map(|(i, p)| {
                        (!p.text.trim().is_empty()).then(|| NarrativeFragment {
                            source_kind: SourceKind::Retrieval,
                            text: p.text.trim().to_string(),
                            citation_id: format!("doc{}", i + 1),
                            relevance: Some(p.score),
                        })
                    }))
                }
                SignalPayload::WebSearch(results) => {
                    fragments.extend(results.iter().enumerate().map(|(i, r)| {
                        NarrativeFragment {
                            source_kind: SourceKind::WebSearch,
                            text: format!("{}: {} ({})", r.title, r.snippet, r.url),
                            citation_id: format!("web{}", i + 1),
                            relevance: Some(self.config.web_search_confidence),
                        }
                    }))
                }
                SignalPayload::Generation(output) => {
                    if !output.text.trim().is_empty() {
                        fragments.push(NarrativeFragment {
                            source_kind: SourceKind::Generation,
                            text: output.text.trim().to_string(),
                            citation_id: "gen1".to_string(),
                            relevance: signal.raw_score(),
                        });
                    }
                }
            }
        }

        let weights = ModalityWeights::for_shape(shape);
        fragments.sort_by(|a, b| {
            self.tier(a).cmp(&self.tier(b)).then_with(|| {
                weights
                    .weight(b.source_kind)
                    .total_cmp(&weights.weight(a.source_kind))
            })
        });
        fragments
    }

    fn tier(&self, fragment: &NarrativeFragment) -> u8 {
        let relevance = fragment.relevance.unwrap_or(0.0);
        match fragment.source_kind {
            SourceKind::Vision if relevance > self.config.vision_priority_threshold => 0,
            SourceKind::Retrieval if relevance > self.config.retrieval_priority_threshold => 1,
            SourceKind::WebSearch => 2,
            _ => 3,
        }
    }

    /// Pairwise disagreements whose confidence gap strictly exceeds the delta.
    pub fn contradictions(
        &self,
        signals: &[SourceSignal],
        components: &BTreeMap<SourceKind, f64>,
    ) -> Vec<Contradiction> {
        let vocabulary = self.vocabulary(signals);

        let mut claimants: Vec<(SourceKind, f64, Claims)> = Vec::new();
        for signal in signals.iter().filter(|s| s.succeeded()) {
            let kind = signal.source_kind();
            if claimants.iter().any(|(k, _, _)| *k == kind) {
                continue;
            }
            let confidence = match kind {
                SourceKind::WebSearch => Some(self.config.web_search_confidence),
                _ => components.get(&kind).copied(),
            };
            let claims = self.claims(signal, &vocabulary);
            if let Some(confidence) = confidence {
                if !claims.is_empty() {
                    claimants.push((kind, confidence, claims));
                }
            }
        }
        claimants.sort_by_key(|(kind, _, _)| *kind);

        let mut contradictions = Vec::new();
        for (i, (kind_a, conf_a, claims_a)) in claimants.iter().enumerate() {
            for (kind_b, conf_b, claims_b) in claimants.iter().skip(i + 1) {
                let disagreement = claims_a.iter().find_map(|(subject, polarity_a)| {
                    claims_b
                        .get(subject)
                        .filter(|polarity_b| *polarity_b != polarity_a)
                        .map(|_| (subject, *polarity_a))
                });
                let Some((subject, polarity_a)) = disagreement else {
                    continue;
                };

                let gap = (conf_a - conf_b).abs();
                if gap > self.config.contradiction_delta {
                    let (asserts, denies, conf_asserts, conf_denies) = if polarity_a {
                        (kind_a, kind_b, conf_a, conf_b)
                    } else {
                        (kind_b, kind_a, conf_b, conf_a)
                    };
                    contradictions.push(Contradiction {
                        source_kind_a: *kind_a,
                        source_kind_b: *kind_b,
                        subject: subject.clone(),
                        confidence_gap: gap,
                        description: format!(
                            "{} asserts '{}' ({:.2}) while {} denies it ({:.2})",
                            asserts, subject, conf_asserts, denies, conf_denies
                        ),
                    });
                } else {
                    debug!(
                        source_a = %kind_a,
                        source_b = %kind_b,
                        subject = %subject,
                        gap,
                        "Sources disagree within tolerance"
                    );
                }
            }
        }

        contradictions
    }

    /// Configured claim terms, extended with the vision label when it is not
    /// already part of the vocabulary.
    fn vocabulary(&self, signals: &[SourceSignal]) -> Vec<ClaimTerm> {
        let mut vocabulary = self.config.claim_terms.clone();

        let label = signals
            .iter()
            .find_map(|s| s.vision())
            .map(|finding| tokenize(&finding.label).join(" "))
            .filter(|label| !label.is_empty() && !label.contains(' '));

        if let Some(label) = label {
            let known = vocabulary.iter().any(|t| {
                t.term.eq_ignore_ascii_case(&label)
                    || t.opposite
                        .as_deref()
                        .is_some_and(|o| o.eq_ignore_ascii_case(&label))
            });
            if !known {
                vocabulary.push(ClaimTerm {
                    term: label,
                    opposite: None,
                });
            }
        }

        vocabulary
    }

    /// Claims made by one signal against the given vocabulary.
    pub fn claims(&self, signal: &SourceSignal, vocabulary: &[ClaimTerm]) -> Claims {
        let mut claims = Claims::new();
        let limit = self.config.claim_passages.max(1);

        match signal.payload() {
            Some(SignalPayload::Vision(finding)) => {
                self.extract(&finding.label, vocabulary, &mut claims)
            }
            Some(SignalPayload::Retrieval(passages)) => {
                for passage in passages.iter().take(limit) {
                    self.extract(&passage.text, vocabulary, &mut claims);
                }
            }
            Some(SignalPayload::WebSearch(results)) => {
                for result in results.iter().take(limit) {
                    self.extract(&format!("{}. {}", result.title, result.snippet), vocabulary, &mut claims);
                }
            }
            Some(SignalPayload::Generation(output)) => {
                self.extract(&output.text, vocabulary, &mut claims)
            }
            None => {}
        }

        claims
    }

    /// First mention of each subject decides its polarity.
    fn extract(&self, text: &str, vocabulary: &[ClaimTerm], claims: &mut Claims) {
        for clause in text.split(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | '\n')) {
            let tokens = tokenize(clause);
            for (i, token) in tokens.iter().enumerate() {
                for term in vocabulary {
                    let polarity = if term.term.eq_ignore_ascii_case(token) {
                        true
                    } else if term
                        .opposite
                        .as_deref()
                        .is_some_and(|o| o.eq_ignore_ascii_case(token))
                    {
                        false
                    } else {
                        continue;
                    };
                    let negated = self.is_negated(&tokens, i);
                    claims
                        .entry(term.term.to_lowercase())
                        .or_insert(polarity != negated);
                }
            }
        }
    }

    fn is_negated(&self, tokens: &[String], position: usize) -> bool {
        let start = position.saturating_sub(self.config.negation_window);
        tokens[start..position].iter().any(|t| {
            self.config
                .negation_cues
                .iter()
                .any(|cue| cue.eq_ignore_ascii_case(t))
        })
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
