//! Confidence-gated yes/no classifier.
//!
//! Epistemic foundation:
//! - K_i: The decision boundary lives in logit space:
//!   keep ⇔ logit(yes) − logit(no) ≥ ln(t / (1 − t))
//! - K_i: One sample per call; the input is consumed
//! - B_i: The model may not be ready to answer → extend the sequence with its
//!   top-1 token and ask again, at most `max_attempts` times
//! - I^B: The model never surfaces an answer → keep (defined fallback)

use crate::models::{ConfigError, Result, SieveError, validate_threshold};
use crate::provider::{AnswerTokens, EncodedInput, LanguageModel};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Inverse sigmoid of a confidence threshold (natural log).
///
/// Non-finite for thresholds outside (0, 1); callers validate first.
pub fn required_logit_diff(threshold: f64) -> f64 {
    (threshold / (1.0 - threshold)).ln()
}

/// Readiness gate configuration.
///
/// `early_stop` and `max_attempts` are independent: with the gate disabled the
/// classifier always scores the first forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    /// Only score once yes or no is among the top-k next tokens
    pub early_stop: bool,
    /// Forward passes allowed before falling back to keep
    pub max_attempts: usize,
    /// Breadth of the readiness check
    pub top_k: usize,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            early_stop: true,
            max_attempts: 10,
            top_k: 1,
        }
    }
}

impl Readiness {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.top_k == 0 {
            return Err(ConfigError::InvalidValue {
                field: "filter.top_k",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "filter.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Outcome of classifying one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// The model answered; `keep` compares the logit margin to the boundary.
    Scored {
        keep: bool,
        logit_difference: f32,
        forward_passes: usize,
    },
    /// The model never surfaced an answer within the attempt limit.
    AttemptLimitReached { forward_passes: usize },
}

impl Decision {
    /// Keep/discard verdict; the attempt limit falls back to keep.
    pub fn keep(&self) -> bool {
        match self {
            Self::Scored { keep, .. } => *keep,
            Self::AttemptLimitReached { .. } => true,
        }
    }

    pub fn forward_passes(&self) -> usize {
        match self {
            Self::Scored { forward_passes, .. } | Self::AttemptLimitReached { forward_passes } => {
                *forward_passes
            }
        }
    }

    /// Tokens appended to the input before the decision.
    pub fn appended_tokens(&self) -> usize {
        self.forward_passes().saturating_sub(1)
    }

    pub fn is_attempt_limit(&self) -> bool {
        matches!(self, Self::AttemptLimitReached { .. })
    }
}

/// Classifier with the run-wide boundary, answer ids and readiness gate.
#[derive(Debug, Clone)]
pub struct ConfidenceClassifier {
    /// Compared in f32, the precision logits are produced in
    required_logit_diff: f32,
    answers: AnswerTokens,
    readiness: Readiness,
}

impl ConfidenceClassifier {
    /// Create a classifier from a probability threshold.
    ///
    /// B_i(threshold in (0, 1)) → Result
    pub fn new(threshold: f64, answers: AnswerTokens, readiness: Readiness) -> Result<Self> {
        validate_threshold(threshold)?;
        Self::with_logit_diff(required_logit_diff(threshold), answers, readiness)
    }

    /// Create a classifier from a boundary already in logit space.
    pub fn with_logit_diff(
        required_logit_diff: f64,
        answers: AnswerTokens,
        readiness: Readiness,
    ) -> Result<Self> {
        readiness.validate()?;
        if !(required_logit_diff as f32).is_finite() {
            return Err(SieveError::InvalidInput(format!(
                "required logit difference must be finite, got {required_logit_diff}"
            )));
        }
        if answers.yes == answers.no {
            return Err(SieveError::AnswerToken {
                literal: AnswerTokens::NO_LITERAL,
                reason: "yes and no share a token id".to_string(),
            });
        }
        Ok(Self {
            required_logit_diff: required_logit_diff as f32,
            answers,
            readiness,
        })
    }

    pub fn required_logit_diff(&self) -> f32 {
        self.required_logit_diff
    }

    pub fn answers(&self) -> AnswerTokens {
        self.answers
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    /// Classify one sample.
    ///
    /// The input grows by the model's top-1 token for every attempt on which
    /// the model is not ready, except the last one.
    pub fn classify<M: LanguageModel + ?Sized>(
        &self,
        model: &mut M,
        mut input: EncodedInput,
    ) -> Result<Decision> {
        let attempts = if self.readiness.early_stop {
            self.readiness.max_attempts
        } else {
            1
        };

        for attempt in 1..=attempts {
            let logits = last_position_logits(&model.forward(&input)?)?;

            if self.readiness.early_stop {
                let top = top_k_ids(&logits, self.readiness.top_k);
                if !top.contains(&self.answers.yes) && !top.contains(&self.answers.no) {
                    if attempt == attempts {
                        break;
                    }
                    // top_k >= 1 and logits are non-empty, so top[0] exists
                    debug!(attempt, token = top[0], "Model not ready, extending sequence");
                    input.append_token(top[0])?;
                    continue;
                }
            }

            let yes = logit_at(&logits, self.answers.yes)?;
            let no = logit_at(&logits, self.answers.no)?;
            let logit_difference = yes - no;
            let keep = logit_difference >= self.required_logit_diff;

            debug!(attempt, logit_difference, keep, "Sample scored");
            return Ok(Decision::Scored {
                keep,
                logit_difference,
                forward_passes: attempt,
            });
        }

        warn!(
            max_attempts = attempts,
            "Reached classification attempt limit, keeping sample"
        );
        Ok(Decision::AttemptLimitReached {
            forward_passes: attempts,
        })
    }
}

fn logit_at(logits: &[f32], id: u32) -> Result<f32> {
    logits.get(id as usize).copied().ok_or_else(|| {
        SieveError::Shape(format!(
            "answer token {id} is outside the vocabulary of size {}",
            logits.len()
        ))
    })
}

/// Flatten `(1, vocab)` model output into host logits.
fn last_position_logits(logits: &Tensor) -> Result<Vec<f32>> {
    let (batch, vocab) = logits.dims2()?;
    if batch != 1 {
        return Err(SieveError::Shape(format!(
            "expected logits for a single sample, got batch size {batch}"
        )));
    }
    if vocab == 0 {
        return Err(SieveError::Shape("model returned an empty vocabulary".to_string()));
    }
    Ok(logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

/// Ids of the `k` largest logits, highest first; ties favour the lower id.
pub fn top_k_ids(logits: &[f32], k: usize) -> Vec<u32> {
    let k = k.min(logits.len());
    let mut top: Vec<(u32, f32)> = Vec::with_capacity(k + 1);

    for (id, &logit) in logits.iter().enumerate() {
        if top.len() == k && top.last().is_some_and(|&(_, min)| logit.total_cmp(&min).is_le()) {
            continue;
        }
        let pos = top.partition_point(|&(_, l)| l.total_cmp(&logit).is_ge());
        top.insert(pos, (id as u32, logit));
        top.truncate(k);
    }

    top.into_iter().map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    const YES: u32 = 1;
    const NO: u32 = 0;
    const VOCAB: usize = 8;

    fn answers() -> AnswerTokens {
        AnswerTokens { yes: YES, no: NO }
    }

    fn logits_with(values: &[(u32, f32)]) -> Vec<f32> {
        let mut row = vec![-10.0; VOCAB];
        for &(id, v) in values {
            row[id as usize] = v;
        }
        row
    }

    /// Replays scripted logits, repeating the last row, and records the
    /// sequence length seen by every forward pass.
    struct ScriptedModel {
        rows: Vec<Vec<f32>>,
        seen_lengths: Vec<usize>,
    }

    impl ScriptedModel {
        fn new(rows: Vec<Vec<f32>>) -> Self {
            Self {
                rows,
                seen_lengths: Vec::new(),
            }
        }
    }

    impl LanguageModel for ScriptedModel {
        fn forward(&mut self, input: &EncodedInput) -> Result<Tensor> {
            let step = self.seen_lengths.len().min(self.rows.len() - 1);
            self.seen_lengths.push(input.seq_len());
            let row = &self.rows[step];
            Ok(Tensor::from_slice(row.as_slice(), (1, row.len()), &Device::Cpu)?)
        }
    }

    fn input() -> EncodedInput {
        EncodedInput::from_ids(&[3, 4, 5], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_required_logit_diff_values() {
        assert_eq!(required_logit_diff(0.5), 0.0);
        assert!((required_logit_diff(0.9) - 9f64.ln()).abs() < 1e-12);
        assert!((required_logit_diff(0.1) + 9f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_required_logit_diff_strictly_increasing() {
        let mut prev = f64::NEG_INFINITY;
        for i in 1..1000 {
            let diff = required_logit_diff(i as f64 / 1000.0);
            assert!(diff > prev, "not increasing at {i}");
            prev = diff;
        }
    }

    #[test]
    fn test_equal_logits_at_half_threshold_keep() {
        let clf = ConfidenceClassifier::new(0.5, answers(), Readiness::default()).unwrap();
        let mut model = ScriptedModel::new(vec![logits_with(&[(YES, 2.0), (NO, 2.0)])]);
        let decision = clf.classify(&mut model, input()).unwrap();
        assert!(decision.keep());
        assert!(matches!(decision, Decision::Scored { logit_difference, .. } if logit_difference == 0.0));
    }

    #[test]
    fn test_margin_equal_to_boundary_in_f32_keeps() {
        // ln(1.5) is not representable in f32; the margin rounds below the f64 value
        let clf = ConfidenceClassifier::new(0.6, answers(), Readiness::default()).unwrap();
        let margin = 1.5f64.ln() as f32;
        assert!(f64::from(margin) < required_logit_diff(0.6));
        assert_eq!(clf.required_logit_diff(), margin);

        let mut model = ScriptedModel::new(vec![logits_with(&[(YES, margin), (NO, 0.0)])]);
        let decision = clf.classify(&mut model, input()).unwrap();
        assert!(decision.keep());
        assert!(!decision.is_attempt_limit());
    }

    #[test]
    fn test_margin_below_high_threshold_discards() {
        let clf = ConfidenceClassifier::new(0.9, answers(), Readiness::default()).unwrap();
        let mut model = ScriptedModel::new(vec![logits_with(&[(YES, 3.0), (NO, 1.0)])]);
        let decision = clf.classify(&mut model, input()).unwrap();
        assert!(!decision.keep());
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let clf = ConfidenceClassifier::with_logit_diff(1.5, answers(), Readiness::default()).unwrap();
        let mut model = ScriptedModel::new(vec![logits_with(&[(YES, 2.5), (NO, 1.0)])]);
        assert!(clf.classify(&mut model, input()).unwrap().keep());

        let mut model = ScriptedModel::new(vec![logits_with(&[(YES, 2.25), (NO, 1.0)])]);
        assert!(!clf.classify(&mut model, input()).unwrap().keep());
    }

    #[test]
    fn test_ready_on_first_pass_uses_one_forward() {
        let readiness = Readiness {
            early_stop: true,
            max_attempts: 50,
            top_k: 2,
        };
        let clf = ConfidenceClassifier::new(0.5, answers(), readiness).unwrap();
        // "no" is second best, so it is inside the top-2
        let mut model = ScriptedModel::new(vec![logits_with(&[(6, 9.0), (NO, 5.0), (YES, 1.0)])]);
        let decision = clf.classify(&mut model, input()).unwrap();

        assert_eq!(decision.forward_passes(), 1);
        assert_eq!(model.seen_lengths, vec![3]);
        assert!(!decision.keep());
    }

    #[test]
    fn test_not_ready_appends_top_token_then_scores() {
        let clf = ConfidenceClassifier::new(0.5, answers(), Readiness::default()).unwrap();
        let mut model = ScriptedModel::new(vec![
            logits_with(&[(6, 9.0), (YES, 1.0)]),
            logits_with(&[(7, 9.0)]),
            logits_with(&[(YES, 4.0), (NO, 3.0)]),
        ]);
        let decision = clf.classify(&mut model, input()).unwrap();

        assert!(decision.keep());
        assert_eq!(decision.forward_passes(), 3);
        assert_eq!(decision.appended_tokens(), 2);
        assert_eq!(model.seen_lengths, vec![3, 4, 5]);
    }

    #[test]
    fn test_attempt_limit_keeps_and_appends_one_less() {
        let readiness = Readiness {
            early_stop: true,
            max_attempts: 4,
            top_k: 1,
        };
        let clf = ConfidenceClassifier::new(0.99, answers(), readiness).unwrap();
        // yes/no never reach the top-1, and scoring would discard
        let mut model = ScriptedModel::new(vec![logits_with(&[(6, 9.0), (NO, 8.0)])]);
        let decision = clf.classify(&mut model, input()).unwrap();

        assert!(decision.is_attempt_limit());
        assert!(decision.keep());
        assert_eq!(decision.forward_passes(), 4);
        assert_eq!(decision.appended_tokens(), 3);
        assert_eq!(model.seen_lengths, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_early_stop_disabled_scores_first_pass() {
        let readiness = Readiness {
            early_stop: false,
            max_attempts: 10,
            top_k: 1,
        };
        let clf = ConfidenceClassifier::new(0.5, answers(), readiness).unwrap();
        // neither answer is in the top-1, but the gate is off
        let mut model = ScriptedModel::new(vec![logits_with(&[(6, 9.0), (YES, 0.5), (NO, 0.25)])]);
        let decision = clf.classify(&mut model, input()).unwrap();

        assert_eq!(model.seen_lengths, vec![3]);
        assert!(matches!(decision, Decision::Scored { keep: true, forward_passes: 1, .. }));
    }

    #[test]
    fn test_rejects_batched_logits() {
        struct Batched;
        impl LanguageModel for Batched {
            fn forward(&mut self, _input: &EncodedInput) -> Result<Tensor> {
                Ok(Tensor::zeros((2, VOCAB), DType::F32, &Device::Cpu)?)
            }
        }
        let clf = ConfidenceClassifier::new(0.5, answers(), Readiness::default()).unwrap();
        assert!(matches!(
            clf.classify(&mut Batched, input()),
            Err(SieveError::Shape(_))
        ));
    }

    #[test]
    fn test_answer_outside_vocab_is_error() {
        let readiness = Readiness {
            early_stop: false,
            ..Readiness::default()
        };
        let clf = ConfidenceClassifier::new(0.5, AnswerTokens { yes: 100, no: NO }, readiness).unwrap();
        let mut model = ScriptedModel::new(vec![logits_with(&[])]);
        assert!(clf.classify(&mut model, input()).is_err());
    }

    #[test]
    fn test_rejects_invalid_construction() {
        assert!(ConfidenceClassifier::new(1.0, answers(), Readiness::default()).is_err());
        assert!(ConfidenceClassifier::new(0.0, answers(), Readiness::default()).is_err());
        let zero_k = Readiness {
            top_k: 0,
            ..Readiness::default()
        };
        assert!(ConfidenceClassifier::new(0.5, answers(), zero_k).is_err());
        assert!(ConfidenceClassifier::new(0.5, AnswerTokens { yes: 3, no: 3 }, Readiness::default()).is_err());
    }

    #[test]
    fn test_top_k_ids_order_and_ties() {
        let logits = [0.5, 3.0, 3.0, -1.0, 2.0];
        assert_eq!(top_k_ids(&logits, 1), vec![1]);
        assert_eq!(top_k_ids(&logits, 3), vec![1, 2, 4]);
        assert_eq!(top_k_ids(&logits, 10), vec![1, 2, 4, 0, 3]);
    }
}
