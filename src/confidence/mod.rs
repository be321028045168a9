//! Confidence fusion
//!
//! Turns raw per-source signals into one calibrated [`ConfidenceProfile`].
//! Each successful source is normalized into a component in `[0, 1]`, then the
//! components are combined with modality weights chosen by the query shape.
//! Weights of sources without a component are dropped and the remainder
//! renormalized, so `overall` is always a convex combination of the components
//! that are actually present.

use crate::types::{QueryShape, SignalPayload, SourceKind, SourceSignal};
use crate::utils::toml_config::ConfidenceConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfidenceLevel::High => f.write_str("high"),
            ConfidenceLevel::Medium => f.write_str("medium"),
            ConfidenceLevel::Low => f.write_str("low"),
        }
    }
}

/// Level cut-offs. Both bounds are inclusive from below.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceThresholds {
    pub high: f64,
    pub medium: f64,
}

impl ConfidenceThresholds {
    pub fn level(&self, overall: f64) -> ConfidenceLevel {
        if overall >= self.high {
            ConfidenceLevel::High
        } else if overall >= self.medium {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self::from(&ConfidenceConfig::default())
    }
}

impl From<&ConfidenceConfig> for ConfidenceThresholds {
    fn from(config: &ConfidenceConfig) -> Self {
        Self {
            high: config.high_threshold,
            medium: config.medium_threshold,
        }
    }
}

/// One row of the modality weight table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModalityWeights {
    pub vision: f64,
    pub retrieval: f64,
    pub generation: f64,
}

impl ModalityWeights {
    pub fn for_shape(shape: QueryShape) -> Self {
        match shape {
            QueryShape::VisionAndText => Self {
                vision: 0.5,
                retrieval: 0.25,
                generation: 0.25,
            },
            QueryShape::TextOnly => Self {
                vision: 0.0,
                retrieval: 0.6,
                generation: 0.4,
            },
            QueryShape::VisionOnly => Self {
                vision: 0.8,
                retrieval: 0.0,
                generation: 0.2,
            },
        }
    }

    pub fn weight(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::Vision => self.vision,
            SourceKind::Retrieval => self.retrieval,
            // Web results carry no score; they inform the narrative only
            SourceKind::WebSearch => 0.0,
            SourceKind::Generation => self.generation,
        }
    }
}

/// Fused confidence for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceProfile {
    pub overall: f64,
    pub level: ConfidenceLevel,
    pub components: BTreeMap<SourceKind, f64>,
    pub active_modalities: BTreeSet<SourceKind>,
    /// Renormalized weights over the active modalities
    pub weights: BTreeMap<SourceKind, f64>,
    /// Score before any contradiction penalty
    pub fused: f64,
    #[serde(default)]
    pub penalty: f64,
}

impl ConfidenceProfile {
    /// Lower `overall` by `penalty` (measured from the unpenalized score) and
    /// recompute the level. Calling this again replaces the previous penalty.
    pub fn with_penalty(mut self, penalty: f64, thresholds: &ConfidenceThresholds) -> Self {
        let penalty = penalty.clamp(0.0, 1.0);
        self.penalty = penalty;
        self.overall = (self.fused - penalty).clamp(0.0, 1.0);
        self.level = thresholds.level(self.overall);
        self
    }

    pub fn component(&self, kind: SourceKind) -> Option<f64> {
        self.components.get(&kind).copied()
    }

    pub fn is_active(&self, kind: SourceKind) -> bool {
        self.active_modalities.contains(&kind)
    }
}

/// Builds profiles from signals using one configuration snapshot.
#[derive(Debug, Clone)]
pub struct ConfidenceBuilder {
    config: ConfidenceConfig,
}

impl ConfidenceBuilder {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    pub fn thresholds(&self) -> ConfidenceThresholds {
        ConfidenceThresholds::from(&self.config)
    }

    /// Normalized contribution of one signal, or `None` if it has no score.
    pub fn component(&self, signal: &SourceSignal) -> Option<f64> {
        if !signal.succeeded() {
            return None;
        }

        match signal.payload()? {
            SignalPayload::Vision(finding) => Some(clamp_unit(finding.confidence)),
            SignalPayload::Retrieval(passages) => {
                let scores: Vec<f64> = passages.iter().map(|p| p.score).collect();
                retrieval_confidence(&scores, &self.config)
            }
            SignalPayload::WebSearch(_) => None,
            SignalPayload::Generation(output) => Some(
                output
                    .per_token_logprobs
                    .as_deref()
                    .and_then(|lps| generation_confidence(lps, &self.config))
                    .unwrap_or_else(|| clamp_unit(self.config.missing_logprobs_confidence)),
            ),
        }
    }

    /// Build a profile from every signal gathered so far.
    ///
    /// Failed signals never contribute; when a kind appears more than once the
    /// first successful signal wins.
    pub fn build(&self, shape: QueryShape, signals: &[SourceSignal]) -> ConfidenceProfile {
        let mut components = BTreeMap::new();
        for signal in signals {
            if let Some(component) = self.component(signal) {
                components.entry(signal.source_kind()).or_insert(component);
            }
        }
        self.fuse(shape, components)
    }

    /// Weighted fusion of already-normalized components.
    pub fn fuse(
        &self,
        shape: QueryShape,
        components: BTreeMap<SourceKind, f64>,
    ) -> ConfidenceProfile {
        let row = ModalityWeights::for_shape(shape);
        let components: BTreeMap<SourceKind, f64> = components
            .into_iter()
            .map(|(kind, c)| (kind, clamp_unit(c)))
            .collect();

        let total: f64 = components.keys().map(|kind| row.weight(*kind)).sum();

        let (weights, overall) = if total > 0.0 {
            let weights: BTreeMap<SourceKind, f64> = components
                .keys()
                .map(|kind| (*kind, row.weight(*kind) / total))
                .collect();
            let overall = components
                .iter()
                .map(|(kind, c)| weights.get(kind).copied().unwrap_or(0.0) * c)
                .sum::<f64>();
            (weights, clamp_unit(overall))
        } else {
            (BTreeMap::new(), 0.0)
        };

        let thresholds = self.thresholds();
        ConfidenceProfile {
            overall,
            level: thresholds.level(overall),
            active_modalities: components.keys().copied().collect(),
            components,
            weights,
            fused: overall,
            penalty: 0.0,
        }
    }
}

/// Mean of the top-k scores, plus a flat boost when enough passages agree.
///
/// Returns `None` for an empty result list.
pub fn retrieval_confidence(scores: &[f64], config: &ConfidenceConfig) -> Option<f64> {
    let mut scores: Vec<f64> = scores
        .iter()
        .copied()
        .filter(|s| s.is_finite())
        .map(clamp_unit)
        .collect();
    if scores.is_empty() {
        return None;
    }

    scores.sort_by(|a, b| b.total_cmp(a));
    let top: &[f64] = &scores[..scores.len().min(config.retrieval_top_k.max(1))];
    let mean = top.iter().sum::<f64>() / top.len() as f64;

    let corroborating = scores
        .iter()
        .filter(|s| **s > config.consensus_score)
        .count();
    let boost = if corroborating >= config.consensus_count {
        config.consensus_boost
    } else {
        0.0
    };

    Some((mean + boost).min(1.0))
}

/// Map per-token log-likelihoods onto `[generation_floor, generation_ceiling]`.
///
/// Returns `None` if there is no finite logprob to work with.
pub fn generation_confidence(logprobs: &[f64], config: &ConfidenceConfig) -> Option<f64> {
    let probs: Vec<f64> = logprobs
        .iter()
        .filter(|lp| lp.is_finite())
        .map(|lp| lp.min(0.0).exp())
        .collect();
    if probs.is_empty() {
        return None;
    }

    let mean = probs.iter().sum::<f64>() / probs.len() as f64;
    let floor = config.logprob_floor;
    let log_mean = if mean > 0.0 { mean.ln() } else { floor };
    let position = (log_mean.clamp(floor, 0.0) - floor) / -floor;

    let span = config.generation_ceiling - config.generation_floor;
    Some(clamp_unit(config.generation_floor + span * position))
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorKind, GenerationOutput, Passage, VisionFinding};
    use rstest::rstest;

    fn builder() -> ConfidenceBuilder {
        ConfidenceBuilder::new(ConfidenceConfig::default())
    }

    fn retrieval(scores: &[f64]) -> SourceSignal {
        SourceSignal::success(SignalPayload::Retrieval(
            scores
                .iter()
                .enumerate()
                .map(|(i, s)| Passage {
                    text: format!("passage {}", i),
                    score: *s,
                    source_id: format!("doc-{}", i),
                })
                .collect(),
        ))
    }

    fn vision(confidence: f64) -> SourceSignal {
        SourceSignal::success(SignalPayload::Vision(VisionFinding {
            label: "PNEUMONIA".to_string(),
            confidence,
        }))
    }

    fn generation(logprobs: Option<Vec<f64>>) -> SourceSignal {
        SourceSignal::success(SignalPayload::Generation(GenerationOutput {
            text: "answer".to_string(),
            per_token_logprobs: logprobs,
        }))
    }

    #[rstest]
    #[case(0.85, ConfidenceLevel::High)]
    #[case(0.8499, ConfidenceLevel::Medium)]
    #[case(0.70, ConfidenceLevel::Medium)]
    #[case(0.6999, ConfidenceLevel::Low)]
    #[case(1.0, ConfidenceLevel::High)]
    #[case(0.0, ConfidenceLevel::Low)]
    fn test_level_boundaries(#[case] overall: f64, #[case] expected: ConfidenceLevel) {
        assert_eq!(ConfidenceThresholds::default().level(overall), expected);
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let config = ConfidenceConfig {
            high_threshold: 0.95,
            medium_threshold: 0.5,
            ..Default::default()
        };
        let thresholds = ConfidenceThresholds::from(&config);
        assert_eq!(thresholds.level(0.9), ConfidenceLevel::Medium);
        assert_eq!(thresholds.level(0.5), ConfidenceLevel::Medium);
        assert_eq!(thresholds.level(0.49), ConfidenceLevel::Low);
    }

    #[rstest]
    #[case(QueryShape::VisionAndText)]
    #[case(QueryShape::TextOnly)]
    #[case(QueryShape::VisionOnly)]
    fn test_weight_rows_sum_to_one(#[case] shape: QueryShape) {
        let row = ModalityWeights::for_shape(shape);
        assert!((row.vision + row.retrieval + row.generation - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_renormalized_weights_sum_to_one() {
        let b = builder();
        let signals = vec![
            vision(0.7),
            SourceSignal::failure(SourceKind::Retrieval, ErrorKind::Timeout),
            generation(None),
        ];
        let profile = b.build(QueryShape::VisionAndText, &signals);
        let sum: f64 = profile.weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&profile.overall));
    }

    #[test]
    fn test_scenario_retrieval_consensus_boost() {
        let b = builder();
        let component = b.component(&retrieval(&[0.8, 0.75, 0.72])).unwrap();
        // mean 0.7567 + 0.10 boost
        assert!(component >= 0.82, "component was {}", component);
        assert!((component - (0.8 + 0.75 + 0.72) / 3.0 - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_retrieval_without_consensus() {
        let config = ConfidenceConfig::default();
        let value = retrieval_confidence(&[0.9, 0.75, 0.7], &config).unwrap();
        // 0.7 does not exceed the consensus score, so only two corroborate
        assert!((value - (0.9 + 0.75 + 0.7) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_retrieval_boost_is_capped() {
        let config = ConfidenceConfig::default();
        let value = retrieval_confidence(&[0.98, 0.97, 0.99, 0.96], &config).unwrap();
        assert_eq!(value, 1.0);
    }

    #[test]
    fn test_retrieval_uses_top_k_only() {
        let config = ConfidenceConfig {
            retrieval_top_k: 2,
            ..Default::default()
        };
        let value = retrieval_confidence(&[0.1, 0.6, 0.4], &config).unwrap();
        assert!((value - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_retrieval_is_not_a_component() {
        let b = builder();
        assert_eq!(b.component(&retrieval(&[])), None);

        let profile = b.build(QueryShape::TextOnly, &[retrieval(&[]), generation(None)]);
        assert!(!profile.is_active(SourceKind::Retrieval));
        assert_eq!(profile.weights.get(&SourceKind::Generation), Some(&1.0));
    }

    #[test]
    fn test_scenario_vision_with_failed_retrieval() {
        let b = builder();
        let signals = vec![
            vision(0.91),
            SourceSignal::failure(SourceKind::Retrieval, ErrorKind::Transport("reset".into())),
            generation(Some(vec![-0.1, -0.2])),
        ];
        let profile = b.build(QueryShape::VisionAndText, &signals);

        assert_eq!(
            profile.active_modalities,
            [SourceKind::Vision, SourceKind::Generation]
                .into_iter()
                .collect()
        );
        let vision_weight = profile.weights[&SourceKind::Vision];
        let generation_weight = profile.weights[&SourceKind::Generation];
        assert!((vision_weight - 2.0 / 3.0).abs() < 1e-9);
        assert!((generation_weight - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_web_search_is_not_a_component() {
        let b = builder();
        let web = SourceSignal::success(SignalPayload::WebSearch(vec![]));
        assert_eq!(b.component(&web), None);
    }

    #[test]
    fn test_no_components_is_low() {
        let b = builder();
        let profile = b.build(
            QueryShape::TextOnly,
            &[SourceSignal::failure(SourceKind::Retrieval, ErrorKind::Timeout)],
        );
        assert_eq!(profile.overall, 0.0);
        assert_eq!(profile.level, ConfidenceLevel::Low);
        assert!(profile.active_modalities.is_empty());
    }

    #[test]
    fn test_monotonic_in_each_component() {
        let b = builder();
        let shapes = [
            QueryShape::VisionAndText,
            QueryShape::TextOnly,
            QueryShape::VisionOnly,
        ];
        let steps: Vec<f64> = (0..=20).map(|i| i as f64 / 20.0).collect();

        for shape in shapes {
            for kind in [SourceKind::Vision, SourceKind::Retrieval, SourceKind::Generation] {
                let mut previous = f64::MIN;
                for value in &steps {
                    let mut components = BTreeMap::from([
                        (SourceKind::Vision, 0.6),
                        (SourceKind::Retrieval, 0.5),
                        (SourceKind::Generation, 0.7),
                    ]);
                    components.insert(kind, *value);
                    let overall = b.fuse(shape, components).overall;
                    assert!(
                        overall >= previous - 1e-12,
                        "{:?}/{:?} decreased at {}",
                        shape,
                        kind,
                        value
                    );
                    previous = overall;
                }
            }
        }
    }

    #[test]
    fn test_missing_logprobs_uses_prior() {
        let b = builder();
        assert_eq!(b.component(&generation(None)), Some(0.75));
        assert_eq!(b.component(&generation(Some(vec![]))), Some(0.75));
    }

    #[test]
    fn test_generation_range() {
        let config = ConfidenceConfig::default();
        let certain = generation_confidence(&[0.0, 0.0], &config).unwrap();
        assert!((certain - 0.95).abs() < 1e-9);

        let hopeless = generation_confidence(&[-20.0, -30.0], &config).unwrap();
        assert!((hopeless - 0.4).abs() < 1e-9);

        let middling = generation_confidence(&[-1.0, -2.0], &config).unwrap();
        assert!(middling > 0.4 && middling < 0.95);

        let better = generation_confidence(&[-0.5, -1.0], &config).unwrap();
        assert!(better > middling);
    }

    #[test]
    fn test_penalty_applied_from_fused_score() {
        let b = builder();
        let thresholds = b.thresholds();
        let profile = b.fuse(
            QueryShape::TextOnly,
            BTreeMap::from([(SourceKind::Retrieval, 0.9), (SourceKind::Generation, 0.8)]),
        );
        assert_eq!(profile.level, ConfidenceLevel::High);

        let penalized = profile.with_penalty(0.15, &thresholds);
        assert!((penalized.overall - (0.86 - 0.15)).abs() < 1e-9);
        assert_eq!(penalized.level, ConfidenceLevel::Medium);

        let again = penalized.with_penalty(0.15, &thresholds);
        assert!((again.overall - 0.71).abs() < 1e-9);
    }
}
