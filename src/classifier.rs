//! Discriminative meta-classifier over per-class sequence scores.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bank::{BankError, SequenceScorer};
use crate::buffer::GestureBuffer;
use crate::config::ClassifierConfig;
use crate::features::FeatureVector;

// Standardised inputs are clamped to this many standard deviations.
const INPUT_CLIP: f64 = 8.0;
const MIN_SCALE: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("no training vectors")]
    EmptyTrainingSet,
    #[error("training data covers {found} class(es), at least 2 are needed")]
    TooFewClasses { found: usize },
    #[error("label '{0}' is not a known class")]
    UnknownLabel(String),
    #[error("score vector has {actual} entries, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("score vector contains a non-finite value")]
    NonFiniteScore,
    #[error("scorer classes {scorer:?} do not match classifier classes {classifier:?}")]
    LabelMismatch {
        scorer: Vec<String>,
        classifier: Vec<String>,
    },
    #[error("model field {field} has {actual} entries, expected {expected}")]
    Malformed {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("model field {0} holds a non-finite or non-positive value")]
    BadParameter(&'static str),
    #[error("gesture window is empty")]
    EmptyWindow,
    #[error(transparent)]
    Scoring(#[from] BankError),
}

/// Per-class log-likelihoods of one example together with its true class.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledScoreVector {
    pub scores: Vec<f64>,
    pub label: String,
}

/// Maps a score vector to a probability per class.
pub trait MetaClassifier {
    fn classes(&self) -> &[String];
    fn predict_proba(&self, scores: &[f64]) -> Result<Vec<f64>, ClassifierError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOptions {
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

impl From<&ClassifierConfig> for TrainOptions {
    fn from(c: &ClassifierConfig) -> Self {
        Self {
            learning_rate: c.learning_rate,
            epochs: c.epochs,
            l2: c.l2,
        }
    }
}

/// Multinomial logistic regression on standardised inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxRegression {
    classes: Vec<String>,
    mean: Vec<f64>,
    scale: Vec<f64>,
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

impl SoftmaxRegression {
    /// Fits by full-batch gradient descent. `classes` fixes the output order
    /// and may include classes absent from `samples`.
    pub fn fit(
        classes: &[String],
        samples: &[LabeledScoreVector],
        opts: &TrainOptions,
    ) -> Result<Self, ClassifierError> {
        if samples.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }
        let k = classes.len();
        let d = samples[0].scores.len();

        let mut targets = Vec::with_capacity(samples.len());
        let mut seen = vec![false; k];
        for s in samples {
            check_scores(&s.scores, d)?;
            let idx = classes
                .iter()
                .position(|c| *c == s.label)
                .ok_or_else(|| ClassifierError::UnknownLabel(s.label.clone()))?;
            seen[idx] = true;
            targets.push(idx);
        }
        let found = seen.iter().filter(|s| **s).count();
        if found < 2 {
            return Err(ClassifierError::TooFewClasses { found });
        }

        let n = samples.len() as f64;
        let mut mean = vec![0.0; d];
        for s in samples {
            for (m, v) in mean.iter_mut().zip(&s.scores) {
                *m += v / n;
            }
        }
        let mut scale = vec![0.0; d];
        for s in samples {
            for j in 0..d {
                scale[j] += (s.scores[j] - mean[j]).powi(2) / n;
            }
        }
        for v in scale.iter_mut() {
            *v = if v.sqrt() > MIN_SCALE { v.sqrt() } else { 1.0 };
        }

        let mut model = Self {
            classes: classes.to_vec(),
            mean,
            scale,
            weights: vec![vec![0.0; d]; k],
            bias: vec![0.0; k],
        };
        let xs: Vec<Vec<f64>> = samples.iter().map(|s| model.standardise(&s.scores)).collect();

        for _ in 0..opts.epochs {
            let mut gw = vec![vec![0.0; d]; k];
            let mut gb = vec![0.0; k];
            for (x, &y) in xs.iter().zip(&targets) {
                let p = model.softmax(x);
                for c in 0..k {
                    let err = p[c] - if c == y { 1.0 } else { 0.0 };
                    gb[c] += err;
                    for j in 0..d {
                        gw[c][j] += err * x[j];
                    }
                }
            }
            for c in 0..k {
                model.bias[c] -= opts.learning_rate * gb[c] / n;
                for j in 0..d {
                    let grad = gw[c][j] / n + opts.l2 * model.weights[c][j];
                    model.weights[c][j] -= opts.learning_rate * grad;
                }
            }
        }
        Ok(model)
    }

    /// Length of the score vectors this model accepts.
    pub fn input_len(&self) -> usize {
        self.mean.len()
    }

    /// Checks that weights, bias and standardisation agree with the class
    /// list and the input length.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let (k, d) = (self.classes.len(), self.mean.len());
        let shape = |field, expected, actual| {
            if expected == actual {
                Ok(())
            } else {
                Err(ClassifierError::Malformed {
                    field,
                    expected,
                    actual,
                })
            }
        };
        if k < 2 {
            return Err(ClassifierError::TooFewClasses { found: k });
        }
        if d == 0 {
            return Err(ClassifierError::BadParameter("mean"));
        }
        shape("scale", d, self.scale.len())?;
        shape("weights", k, self.weights.len())?;
        shape("bias", k, self.bias.len())?;
        for row in &self.weights {
            shape("weights row", d, row.len())?;
        }
        if self.scale.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ClassifierError::BadParameter("scale"));
        }
        let rest = self.mean.iter().chain(&self.bias).chain(self.weights.iter().flatten());
        if rest.copied().any(|v| !v.is_finite()) {
            return Err(ClassifierError::BadParameter("weights"));
        }
        Ok(())
    }

    fn standardise(&self, scores: &[f64]) -> Vec<f64> {
        scores
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(v, (m, s))| ((v - m) / s).clamp(-INPUT_CLIP, INPUT_CLIP))
            .collect()
    }

    fn softmax(&self, x: &[f64]) -> Vec<f64> {
        let logits: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(w, b)| b + w.iter().zip(x).map(|(a, b)| a * b).sum::<f64>())
            .collect();
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.into_iter().map(|e| e / total).collect()
    }
}

impl MetaClassifier for SoftmaxRegression {
    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn predict_proba(&self, scores: &[f64]) -> Result<Vec<f64>, ClassifierError> {
        check_scores(scores, self.mean.len())?;
        Ok(self.softmax(&self.standardise(scores)))
    }
}

fn check_scores(scores: &[f64], expected: usize) -> Result<(), ClassifierError> {
    if scores.len() != expected {
        return Err(ClassifierError::DimensionMismatch {
            expected,
            actual: scores.len(),
        });
    }
    if scores.iter().any(|v| !v.is_finite()) {
        return Err(ClassifierError::NonFiniteScore);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct GestureMatch {
    pub label: String,
    pub posterior: f64,
}

/// Outcome of classifying one window.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Committed(GestureMatch),
    /// Best guess did not clear the threshold; it must not be acted on.
    NoConfidentMatch { best: GestureMatch },
}

impl Decision {
    pub fn committed(&self) -> Option<&GestureMatch> {
        match self {
            Decision::Committed(m) => Some(m),
            Decision::NoConfidentMatch { .. } => None,
        }
    }

    pub fn into_committed(self) -> Option<GestureMatch> {
        match self {
            Decision::Committed(m) => Some(m),
            Decision::NoConfidentMatch { .. } => None,
        }
    }
}

/// Full distribution plus the arg-max class.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub best: GestureMatch,
    pub probabilities: Vec<(String, f64)>,
}

impl Prediction {
    pub fn probability_of(&self, label: &str) -> Option<f64> {
        self.probabilities
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, p)| *p)
    }
}

/// Meta-classifier plus the commit threshold.
#[derive(Debug, Clone)]
pub struct GestureClassifier<M: MetaClassifier = SoftmaxRegression> {
    model: M,
    threshold: f64,
}

impl<M: MetaClassifier> GestureClassifier<M> {
    pub fn new(model: M, threshold: f64) -> Self {
        Self { model, threshold }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn predict(&self, scores: &[f64]) -> Result<Prediction, ClassifierError> {
        let probs = self.model.predict_proba(scores)?;
        let classes = self.model.classes();
        let (idx, posterior) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, c| if c.1 > acc.1 { c } else { acc });
        let label = classes
            .get(idx)
            .cloned()
            .ok_or(ClassifierError::DimensionMismatch {
                expected: probs.len(),
                actual: classes.len(),
            })?;
        Ok(Prediction {
            best: GestureMatch { label, posterior },
            probabilities: classes.iter().cloned().zip(probs).collect(),
        })
    }

    /// Commits only when the posterior is strictly above the threshold.
    pub fn decide(&self, scores: &[f64]) -> Result<Decision, ClassifierError> {
        let best = self.predict(scores)?.best;
        if best.posterior > self.threshold {
            Ok(Decision::Committed(best))
        } else {
            Ok(Decision::NoConfidentMatch { best })
        }
    }

    pub fn classify_sequence<S: SequenceScorer>(
        &self,
        scorer: &S,
        sequence: &[FeatureVector],
    ) -> Result<Decision, ClassifierError> {
        if sequence.is_empty() {
            return Err(ClassifierError::EmptyWindow);
        }
        let labels = scorer.labels();
        if labels.as_slice() != self.model.classes() {
            return Err(ClassifierError::LabelMismatch {
                scorer: labels,
                classifier: self.model.classes().to_vec(),
            });
        }
        let scores = scorer.score_vector(sequence)?;
        self.decide(&scores)
    }

    /// Downsamples the live window and classifies it.
    pub fn classify<S: SequenceScorer>(
        &self,
        scorer: &S,
        window: &GestureBuffer,
    ) -> Result<Decision, ClassifierError> {
        self.classify_sequence(scorer, &window.downsample())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedMeta {
        classes: Vec<String>,
        probs: Vec<f64>,
    }

    impl MetaClassifier for FixedMeta {
        fn classes(&self) -> &[String] {
            &self.classes
        }
        fn predict_proba(&self, _scores: &[f64]) -> Result<Vec<f64>, ClassifierError> {
            Ok(self.probs.clone())
        }
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn fixed(probs: Vec<f64>, threshold: f64) -> GestureClassifier<FixedMeta> {
        GestureClassifier::new(
            FixedMeta {
                classes: names(&["A", "B"]),
                probs,
            },
            threshold,
        )
    }

    #[test]
    fn test_posterior_equal_to_threshold_is_not_committed() {
        let c = fixed(vec![0.8, 0.2], 0.8);
        match c.decide(&[0.0, 0.0]).unwrap() {
            Decision::NoConfidentMatch { best } => assert_eq!(best.label, "A"),
            other => panic!("committed at the boundary: {other:?}"),
        }
    }

    #[test]
    fn test_posterior_above_threshold_commits() {
        let c = fixed(vec![0.1, 0.9], 0.8);
        let d = c.decide(&[0.0, 0.0]).unwrap();
        assert_eq!(d.committed().unwrap().label, "B");
        assert_eq!(d.into_committed().unwrap().posterior, 0.9);
    }

    fn separable() -> (Vec<String>, Vec<LabeledScoreVector>) {
        let classes = names(&["A", "B", "C"]);
        let mut samples = Vec::new();
        for (i, label) in classes.iter().enumerate() {
            for k in 0..5 {
                let mut scores = vec![-500.0; 3];
                scores[i] = -20.0 - k as f64;
                samples.push(LabeledScoreVector {
                    scores,
                    label: label.clone(),
                });
            }
        }
        (classes, samples)
    }

    #[test]
    fn test_softmax_learns_separable_scores() {
        let (classes, samples) = separable();
        let opts = TrainOptions::from(&ClassifierConfig::default());
        let model = SoftmaxRegression::fit(&classes, &samples, &opts).unwrap();
        let c = GestureClassifier::new(model, 0.8);
        let p = c.predict(&[-700.0, -22.0, -480.0]).unwrap();
        assert_eq!(p.best.label, "B");
        assert!(p.best.posterior > 0.9, "{}", p.best.posterior);
        let total: f64 = p.probabilities.iter().map(|(_, v)| v).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_validation() {
        let (classes, samples) = separable();
        let opts = TrainOptions::from(&ClassifierConfig::default());
        assert!(matches!(
            SoftmaxRegression::fit(&classes, &[], &opts),
            Err(ClassifierError::EmptyTrainingSet)
        ));
        assert!(matches!(
            SoftmaxRegression::fit(&classes, &samples[..5], &opts),
            Err(ClassifierError::TooFewClasses { found: 1 })
        ));
        let mut bad = samples.clone();
        bad[0].label = "Z".into();
        assert!(matches!(
            SoftmaxRegression::fit(&classes, &bad, &opts),
            Err(ClassifierError::UnknownLabel(_))
        ));
        let mut nan = samples;
        nan[3].scores[1] = f64::NAN;
        assert!(matches!(
            SoftmaxRegression::fit(&classes, &nan, &opts),
            Err(ClassifierError::NonFiniteScore)
        ));
    }

    #[test]
    fn test_validate_checks_shapes() {
        let (classes, samples) = separable();
        let opts = TrainOptions::from(&ClassifierConfig::default());
        let model = SoftmaxRegression::fit(&classes, &samples, &opts).unwrap();
        model.validate().unwrap();
        assert_eq!(model.input_len(), 3);

        let mut short_bias = model.clone();
        short_bias.bias.pop();
        assert!(matches!(
            short_bias.validate(),
            Err(ClassifierError::Malformed { field: "bias", expected: 3, actual: 2 })
        ));

        let mut narrow = model.clone();
        narrow.weights[2].truncate(1);
        assert!(matches!(
            narrow.validate(),
            Err(ClassifierError::Malformed { field: "weights row", .. })
        ));

        let mut zero_scale = model;
        zero_scale.scale[0] = 0.0;
        assert!(matches!(
            zero_scale.validate(),
            Err(ClassifierError::BadParameter("scale"))
        ));
    }

    #[test]
    fn test_predict_checks_length() {
        let (classes, samples) = separable();
        let opts = TrainOptions::from(&ClassifierConfig::default());
        let model = SoftmaxRegression::fit(&classes, &samples, &opts).unwrap();
        assert!(matches!(
            model.predict_proba(&[1.0, 2.0]),
            Err(ClassifierError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }
}
