//! One generative sequence model per gesture class.

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::ModelConfig;
use crate::features::FeatureVector;
use crate::hmm::{FitOptions, GaussianHmm, HmmError};

/// A downsampled feature sequence with its class.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub label: String,
    pub sequence: Vec<FeatureVector>,
}

#[derive(Debug, Error)]
pub enum BankError {
    #[error("no gesture classes to train")]
    NoClasses,
    #[error("class '{class}' has {found} examples, at least {required} are needed")]
    InsufficientExamples {
        class: String,
        found: usize,
        required: usize,
    },
    #[error("fitting class '{class}' failed: {source}")]
    Fit {
        class: String,
        #[source]
        source: HmmError,
    },
    #[error("model for class '{class}' is malformed: {source}")]
    Invalid {
        class: String,
        #[source]
        source: HmmError,
    },
    #[error("scoring against class '{class}' failed: {source}")]
    Score {
        class: String,
        #[source]
        source: HmmError,
    },
}

/// Per-class scoring capability consumed by the meta-classifier.
pub trait SequenceScorer {
    /// Class order of every score vector this scorer produces.
    fn labels(&self) -> Vec<String>;

    /// One log-likelihood per class, in `labels()` order.
    fn score_vector(&self, sequence: &[FeatureVector]) -> Result<Vec<f64>, BankError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceModelBank {
    hidden_states: usize,
    models: BTreeMap<String, GaussianHmm>,
}

/// Log-likelihood of a sequence under one class plus its Viterbi path.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassScore {
    pub log_likelihood: f64,
    pub path: Vec<usize>,
}

impl SequenceModelBank {
    /// Fits every class independently (in parallel); any failing class aborts the bank.
    pub fn fit(examples: &[TrainingExample], cfg: &ModelConfig) -> Result<Self, BankError> {
        let mut grouped: BTreeMap<&str, Vec<Vec<FeatureVector>>> = BTreeMap::new();
        for ex in examples {
            grouped
                .entry(ex.label.as_str())
                .or_default()
                .push(ex.sequence.clone());
        }
        if grouped.is_empty() {
            return Err(BankError::NoClasses);
        }

        let opts = FitOptions {
            n_states: cfg.hidden_states,
            max_iter: cfg.max_iter,
            tol: cfg.tol,
            min_covar: cfg.min_covar,
        };
        let required = cfg.min_examples.max(1);
        let jobs: Vec<(&str, Vec<Vec<FeatureVector>>)> = grouped.into_iter().collect();

        let fitted: Vec<(String, Result<GaussianHmm, BankError>)> = jobs
            .par_iter()
            .map(|(class, seqs)| {
                let class = class.to_string();
                let result = if seqs.len() < required {
                    Err(BankError::InsufficientExamples {
                        class: class.clone(),
                        found: seqs.len(),
                        required,
                    })
                } else {
                    GaussianHmm::fit(seqs, &opts).map_err(|source| BankError::Fit {
                        class: class.clone(),
                        source,
                    })
                };
                (class, result)
            })
            .collect();

        let mut models = BTreeMap::new();
        for (class, result) in fitted {
            let model = result?;
            info!("fitted sequence model for '{class}'");
            models.insert(class, model);
        }

        let bank = Self {
            hidden_states: cfg.hidden_states,
            models,
        };
        if log::log_enabled!(log::Level::Debug) {
            for (class, seqs) in &jobs {
                for seq in seqs {
                    if let Ok(s) = bank.score_class(class, seq) {
                        debug!("[{class}] {:.3}: {:?}", s.log_likelihood, s.path);
                    }
                }
            }
        }
        Ok(bank)
    }

    pub fn hidden_states(&self) -> usize {
        self.hidden_states
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn feature_len(&self) -> Option<usize> {
        self.models.values().next().map(GaussianHmm::n_features)
    }

    /// Checks every class model, and that all models agree on state count
    /// and observation length.
    pub fn validate(&self) -> Result<(), BankError> {
        let mut feature_len = None;
        for (class, model) in &self.models {
            let invalid = |source| BankError::Invalid {
                class: class.clone(),
                source,
            };
            model.validate().map_err(invalid)?;
            if model.n_states() != self.hidden_states {
                return Err(invalid(HmmError::Shape {
                    field: "n_states",
                    expected: self.hidden_states,
                    actual: model.n_states(),
                }));
            }
            let d = *feature_len.get_or_insert(model.n_features());
            if model.n_features() != d {
                return Err(invalid(HmmError::Shape {
                    field: "n_features",
                    expected: d,
                    actual: model.n_features(),
                }));
            }
        }
        Ok(())
    }

    /// Log-likelihood for every class.
    pub fn score(&self, sequence: &[FeatureVector]) -> Result<BTreeMap<String, f64>, BankError> {
        self.models
            .iter()
            .map(|(class, model)| {
                model
                    .log_likelihood(sequence)
                    .map(|ll| (class.clone(), ll))
                    .map_err(|source| BankError::Score {
                        class: class.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Like [`score`](Self::score) but also returns the most likely state path.
    pub fn score_with_paths(
        &self,
        sequence: &[FeatureVector],
    ) -> Result<BTreeMap<String, ClassScore>, BankError> {
        self.models
            .keys()
            .map(|class| Ok((class.clone(), self.score_class(class, sequence)?)))
            .collect()
    }

    fn score_class(
        &self,
        class: &str,
        sequence: &[FeatureVector],
    ) -> Result<ClassScore, BankError> {
        let wrap = |source| BankError::Score {
            class: class.to_string(),
            source,
        };
        let model = self.models.get(class).ok_or_else(|| wrap(HmmError::NoSequences))?;
        let log_likelihood = model.log_likelihood(sequence).map_err(wrap)?;
        let (_, path) = model.viterbi(sequence).map_err(wrap)?;
        Ok(ClassScore {
            log_likelihood,
            path,
        })
    }
}

impl SequenceScorer for SequenceModelBank {
    fn labels(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    fn score_vector(&self, sequence: &[FeatureVector]) -> Result<Vec<f64>, BankError> {
        Ok(self.score(sequence)?.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{GestureKind, example_of_len, synthetic_examples};
    use rand::{SeedableRng, rngs::StdRng};

    fn small_cfg() -> ModelConfig {
        ModelConfig {
            hidden_states: 3,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_each_class_scores_its_own_examples_highest() {
        let examples = synthetic_examples(11, 6);
        let bank = SequenceModelBank::fit(&examples, &small_cfg()).unwrap();
        assert_eq!(bank.labels(), vec!["Circle", "Swipe", "Tap"]);

        let held_out = synthetic_examples(99, 1);
        for ex in &held_out {
            let scores = bank.score(&ex.sequence).unwrap();
            let best = scores
                .iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(k, _)| k.clone())
                .unwrap();
            assert_eq!(best, ex.label);
        }
    }

    #[test]
    fn test_score_vector_follows_label_order() {
        let examples = synthetic_examples(5, 4);
        let bank = SequenceModelBank::fit(&examples, &small_cfg()).unwrap();
        let map = bank.score(&examples[0].sequence).unwrap();
        let vec = bank.score_vector(&examples[0].sequence).unwrap();
        let expected: Vec<f64> = bank.labels().iter().map(|l| map[l]).collect();
        assert_eq!(vec, expected);

        let paths = bank.score_with_paths(&examples[0].sequence).unwrap();
        assert_eq!(paths.len(), 3);
        assert!(paths.values().all(|s| s.path.len() == examples[0].sequence.len()));
    }

    #[test]
    fn test_insufficient_class_is_named() {
        let mut examples = synthetic_examples(3, 4);
        examples.retain(|e| e.label != "Tap");
        examples.extend(
            synthetic_examples(4, 1)
                .into_iter()
                .filter(|e| e.label == "Tap"),
        );
        match SequenceModelBank::fit(&examples, &small_cfg()) {
            Err(BankError::InsufficientExamples { class, found, .. }) => {
                assert_eq!(class, "Tap");
                assert_eq!(found, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_fits_examples_of_different_lengths() {
        let mut rng = StdRng::seed_from_u64(31);
        let mut examples = Vec::new();
        for kind in GestureKind::ALL {
            for len in [25, 40, 33, 37] {
                examples.push(example_of_len(kind, &mut rng, len));
            }
        }
        let lens: Vec<usize> = examples[..4].iter().map(|e| e.sequence.len()).collect();
        assert_eq!(lens, vec![6, 9, 8, 9]);

        let bank = SequenceModelBank::fit(&examples, &small_cfg()).unwrap();
        bank.validate().unwrap();
        for len in [22, 30, 40] {
            let held_out = example_of_len(GestureKind::Swipe, &mut rng, len);
            let scores = bank.score(&held_out.sequence).unwrap();
            assert!(scores.values().all(|s| s.is_finite()));
            let best = scores
                .iter()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(k, _)| k.as_str())
                .unwrap();
            assert_eq!(best, "Swipe", "length {len}: {scores:?}");
        }
    }

    #[test]
    fn test_validate_names_malformed_class() {
        let bank = SequenceModelBank::fit(&synthetic_examples(5, 4), &small_cfg()).unwrap();
        let mut mixed = bank.clone();
        mixed.hidden_states = 4;
        match mixed.validate() {
            Err(BankError::Invalid { class, .. }) => assert_eq!(class, "Circle"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(
            SequenceModelBank::fit(&[], &small_cfg()),
            Err(BankError::NoClasses)
        ));
    }

    #[test]
    fn test_fit_is_deterministic() {
        let examples = synthetic_examples(21, 4);
        let a = SequenceModelBank::fit(&examples, &small_cfg()).unwrap();
        let b = SequenceModelBank::fit(&examples, &small_cfg()).unwrap();
        assert_eq!(a, b);
    }
}
