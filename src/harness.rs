//! Offline training and evaluation.
//!
//! dataset -> sequence model bank -> score vectors -> shuffled split ->
//! meta-classifier -> held-out evaluation -> model store.

use log::{info, warn};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::bank::{BankError, SequenceModelBank, SequenceScorer, TrainingExample};
use crate::classifier::{
    ClassifierError, GestureClassifier, LabeledScoreVector, SoftmaxRegression, TrainOptions,
};
use crate::config::{ClassifierConfig, Config, ModelConfig};
use crate::dataset::Dataset;
use crate::store::{ModelStore, StoreError};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Bank(#[from] BankError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{train} training vectors after the split, need at least 2")]
    SplitTooSmall { train: usize },
}

/// A held-out example whose correct-label posterior fell below the
/// diagnostic threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationException {
    pub label: String,
    pub posterior: f64,
    pub predicted: String,
    pub probabilities: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub classes: Vec<String>,
    pub per_class_counts: BTreeMap<String, usize>,
    pub seed: u64,
    pub train_len: usize,
    pub test_len: usize,
    /// Mean posterior of the correct label over the test split; `None` when
    /// the split left no test examples.
    pub average_correct_posterior: Option<f64>,
    pub accuracy: Option<f64>,
    pub exceptions: Vec<EvaluationException>,
}

#[derive(Debug, Clone)]
pub struct TrainedModels {
    pub bank: SequenceModelBank,
    pub model: SoftmaxRegression,
    pub report: TrainingReport,
}

#[derive(Debug, Clone)]
pub struct TrainingHarness {
    model: ModelConfig,
    classifier: ClassifierConfig,
    train_proportion: f64,
    stride: usize,
    seed: Option<u64>,
}

impl TrainingHarness {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            model: cfg.model.clone(),
            classifier: cfg.classifier.clone(),
            train_proportion: cfg.training.train_proportion,
            stride: cfg.window.stride,
            seed: cfg.training.seed,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        if seed.is_some() {
            self.seed = seed;
        }
        self
    }

    /// Trains on `dataset` and persists the result. Nothing is written when
    /// any stage fails.
    pub fn run(
        &self,
        dataset: &Dataset,
        store: &ModelStore,
    ) -> Result<TrainingReport, HarnessError> {
        let examples = dataset.training_examples(self.stride);
        let trained = self.train(&examples)?;
        store.save(&trained.bank, &trained.model)?;
        Ok(trained.report)
    }

    /// `examples` must already be downsampled.
    pub fn train(&self, examples: &[TrainingExample]) -> Result<TrainedModels, HarnessError> {
        let bank = SequenceModelBank::fit(examples, &self.model)?;
        let classes = bank.labels();

        let mut vectors = examples
            .iter()
            .map(|ex| {
                Ok(LabeledScoreVector {
                    scores: bank.score_vector(&ex.sequence)?,
                    label: ex.label.clone(),
                })
            })
            .collect::<Result<Vec<_>, BankError>>()?;

        let seed = self.seed.unwrap_or_else(rand::random::<u64>);
        let mut rng = StdRng::seed_from_u64(seed);
        vectors.shuffle(&mut rng);

        let train_len = (self.train_proportion * vectors.len() as f64) as usize;
        if train_len < 2 {
            return Err(HarnessError::SplitTooSmall { train: train_len });
        }
        let (train, test) = vectors.split_at(train_len);
        info!(
            "training meta-classifier on {} vectors, evaluating on {} (seed {seed})",
            train.len(),
            test.len()
        );

        let model = SoftmaxRegression::fit(&classes, train, &TrainOptions::from(&self.classifier))?;
        let evaluator = GestureClassifier::new(model, self.classifier.threshold);
        let (average, accuracy, exceptions) =
            evaluate(&evaluator, test, self.classifier.diagnostic_threshold)?;

        let mut per_class_counts = BTreeMap::new();
        for ex in examples {
            *per_class_counts.entry(ex.label.clone()).or_insert(0) += 1;
        }

        let report = TrainingReport {
            classes,
            per_class_counts,
            seed,
            train_len: train.len(),
            test_len: test.len(),
            average_correct_posterior: average,
            accuracy,
            exceptions,
        };
        Ok(TrainedModels {
            bank,
            model: evaluator.model().clone(),
            report,
        })
    }
}

type Evaluation = (Option<f64>, Option<f64>, Vec<EvaluationException>);

fn evaluate(
    classifier: &GestureClassifier,
    test: &[LabeledScoreVector],
    diagnostic_threshold: f64,
) -> Result<Evaluation, ClassifierError> {
    if test.is_empty() {
        warn!("test split is empty, skipping evaluation");
        return Ok((None, None, Vec::new()));
    }

    let mut total = 0.0;
    let mut correct = 0usize;
    let mut exceptions = Vec::new();
    for sample in test {
        let prediction = classifier.predict(&sample.scores)?;
        let posterior = prediction.probability_of(&sample.label).unwrap_or(0.0);
        total += posterior;
        if prediction.best.label == sample.label {
            correct += 1;
        }
        if posterior < diagnostic_threshold {
            warn!(
                "exception: '{}' scored {posterior:.3}, predicted '{}', probabilities {:?}",
                sample.label, prediction.best.label, prediction.probabilities
            );
            exceptions.push(EvaluationException {
                label: sample.label.clone(),
                posterior,
                predicted: prediction.best.label,
                probabilities: prediction.probabilities,
            });
        }
    }

    let n = test.len() as f64;
    let average = total / n;
    let accuracy = correct as f64 / n;
    info!("average correct-label posterior {average:.3}, accuracy {accuracy:.3}");
    Ok((Some(average), Some(accuracy), exceptions))
}
