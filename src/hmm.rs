//! Gaussian hidden Markov model with diagonal covariances.
//!
//! All recursions run in log space. Fitting is Baum-Welch over several
//! independent sequences of possibly different lengths.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

const PROB_FLOOR: f64 = 1e-10;

#[derive(Debug, Error, PartialEq)]
pub enum HmmError {
    #[error("no training sequences")]
    NoSequences,
    #[error("sequence {index} is empty")]
    EmptySequence { index: usize },
    #[error("observation has {actual} features, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("{observations} observations cannot support {states} hidden states")]
    TooFewObservations { observations: usize, states: usize },
    #[error("log-likelihood diverged")]
    NonFinite,
    #[error("{field} has {actual} entries, expected {expected}")]
    Shape {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{field} holds a non-finite or non-positive value")]
    BadParameter { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    pub n_states: usize,
    pub max_iter: usize,
    pub tol: f64,
    pub min_covar: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            n_states: 7,
            max_iter: 50,
            tol: 1e-3,
            min_covar: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianHmm {
    n_states: usize,
    n_features: usize,
    log_start: Vec<f64>,
    log_trans: Vec<Vec<f64>>,
    means: Vec<Vec<f64>>,
    vars: Vec<Vec<f64>>,
}

// Sufficient statistics gathered by one E-step.
struct Stats {
    start: Vec<f64>,
    trans: Vec<Vec<f64>>,
    gamma: Vec<f64>,
    x: Vec<Vec<f64>>,
    x2: Vec<Vec<f64>>,
    log_likelihood: f64,
}

impl Stats {
    fn new(n: usize, d: usize) -> Self {
        Self {
            start: vec![0.0; n],
            trans: vec![vec![0.0; n]; n],
            gamma: vec![0.0; n],
            x: vec![vec![0.0; d]; n],
            x2: vec![vec![0.0; d]; n],
            log_likelihood: 0.0,
        }
    }
}

impl GaussianHmm {
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Checks that every parameter has the declared shape and that the
    /// emission variances are finite and positive.
    pub fn validate(&self) -> Result<(), HmmError> {
        let (n, d) = (self.n_states, self.n_features);
        let shape = |field, expected, actual| {
            if expected == actual {
                Ok(())
            } else {
                Err(HmmError::Shape {
                    field,
                    expected,
                    actual,
                })
            }
        };
        if n == 0 {
            return Err(HmmError::BadParameter { field: "n_states" });
        }
        if d == 0 {
            return Err(HmmError::BadParameter { field: "n_features" });
        }
        shape("log_start", n, self.log_start.len())?;
        shape("log_trans", n, self.log_trans.len())?;
        shape("means", n, self.means.len())?;
        shape("vars", n, self.vars.len())?;
        for i in 0..n {
            shape("log_trans row", n, self.log_trans[i].len())?;
            shape("means row", d, self.means[i].len())?;
            shape("vars row", d, self.vars[i].len())?;
        }

        let log_probs = self.log_start.iter().chain(self.log_trans.iter().flatten());
        if log_probs.copied().any(|v| v.is_nan() || v == f64::INFINITY) {
            return Err(HmmError::BadParameter { field: "log probabilities" });
        }
        if self.means.iter().flatten().any(|v| !v.is_finite()) {
            return Err(HmmError::BadParameter { field: "means" });
        }
        if self.vars.iter().flatten().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(HmmError::BadParameter { field: "vars" });
        }
        Ok(())
    }

    pub fn fit<O: AsRef<[f64]>>(sequences: &[Vec<O>], opts: &FitOptions) -> Result<Self, HmmError> {
        let n_features = check_sequences(sequences)?;
        let observations: usize = sequences.iter().map(Vec::len).sum();
        if observations < opts.n_states {
            return Err(HmmError::TooFewObservations {
                observations,
                states: opts.n_states,
            });
        }

        let mut model = Self::initialise(sequences, n_features, opts);
        let mut prev = f64::NEG_INFINITY;
        for iter in 0..opts.max_iter {
            let stats = model.expectation(sequences)?;
            let ll = stats.log_likelihood;
            model.maximisation(&stats, sequences.len(), opts.min_covar);
            if iter > 0 && (ll - prev).abs() < opts.tol {
                break;
            }
            prev = ll;
        }

        let finite = model
            .means
            .iter()
            .chain(model.vars.iter())
            .flatten()
            .all(|v| v.is_finite());
        if !finite {
            return Err(HmmError::NonFinite);
        }
        Ok(model)
    }

    /// Segment-wise means, pooled variance, self-loop-biased transitions.
    fn initialise<O: AsRef<[f64]>>(sequences: &[Vec<O>], d: usize, opts: &FitOptions) -> Self {
        let n = opts.n_states;
        let mut sums = vec![vec![0.0; d]; n];
        let mut counts = vec![0usize; n];
        let mut global = vec![0.0; d];
        let mut global_sq = vec![0.0; d];
        let mut total = 0usize;

        for seq in sequences {
            let len = seq.len();
            for (t, obs) in seq.iter().enumerate() {
                let s = (t * n / len).min(n - 1);
                counts[s] += 1;
                for (k, v) in obs.as_ref().iter().enumerate() {
                    sums[s][k] += v;
                    global[k] += v;
                    global_sq[k] += v * v;
                }
                total += 1;
            }
        }

        let global_mean: Vec<f64> = global.iter().map(|v| v / total as f64).collect();
        let pooled_var: Vec<f64> = global_sq
            .iter()
            .zip(&global_mean)
            .map(|(sq, m)| (sq / total as f64 - m * m).max(0.0) + opts.min_covar)
            .collect();

        let means = sums
            .into_iter()
            .zip(&counts)
            .map(|(s, &c)| {
                if c == 0 {
                    global_mean.clone()
                } else {
                    s.into_iter().map(|v| v / c as f64).collect()
                }
            })
            .collect();

        let stay = if n == 1 { 1.0 } else { 0.5 };
        let leave = if n == 1 { 0.0 } else { 0.5 / (n - 1) as f64 };
        let log_trans = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| safe_ln(if i == j { stay } else { leave }))
                    .collect()
            })
            .collect();

        Self {
            n_states: n,
            n_features: d,
            log_start: vec![safe_ln(1.0 / n as f64); n],
            log_trans,
            means,
            vars: vec![pooled_var; n],
        }
    }

    fn expectation<O: AsRef<[f64]>>(&self, sequences: &[Vec<O>]) -> Result<Stats, HmmError> {
        let n = self.n_states;
        let mut stats = Stats::new(n, self.n_features);

        for seq in sequences {
            let b = self.log_emissions(seq);
            let alpha = self.forward(&b);
            let beta = self.backward(&b);
            let ll = log_sum_exp(&alpha[alpha.len() - 1]);
            if !ll.is_finite() {
                return Err(HmmError::NonFinite);
            }
            stats.log_likelihood += ll;

            for t in 0..seq.len() {
                let obs = seq[t].as_ref();
                for i in 0..n {
                    let g = (alpha[t][i] + beta[t][i] - ll).exp();
                    if t == 0 {
                        stats.start[i] += g;
                    }
                    stats.gamma[i] += g;
                    for (k, v) in obs.iter().enumerate() {
                        stats.x[i][k] += g * v;
                        stats.x2[i][k] += g * v * v;
                    }
                }
                if t + 1 < seq.len() {
                    for i in 0..n {
                        for j in 0..n {
                            stats.trans[i][j] += (alpha[t][i]
                                + self.log_trans[i][j]
                                + b[t + 1][j]
                                + beta[t + 1][j]
                                - ll)
                                .exp();
                        }
                    }
                }
            }
        }
        Ok(stats)
    }

    fn maximisation(&mut self, stats: &Stats, n_sequences: usize, min_covar: f64) {
        let n = self.n_states;
        for i in 0..n {
            self.log_start[i] = safe_ln(stats.start[i] / n_sequences as f64);

            let row: f64 = stats.trans[i].iter().sum();
            if row > PROB_FLOOR {
                for j in 0..n {
                    self.log_trans[i][j] = safe_ln(stats.trans[i][j] / row);
                }
            }

            let g = stats.gamma[i];
            if g > PROB_FLOOR {
                for k in 0..self.n_features {
                    let mean = stats.x[i][k] / g;
                    let var = (stats.x2[i][k] / g - mean * mean).max(0.0);
                    self.means[i][k] = mean;
                    self.vars[i][k] = var + min_covar;
                }
            }
        }
    }

    fn log_emissions<O: AsRef<[f64]>>(&self, seq: &[O]) -> Vec<Vec<f64>> {
        let norms: Vec<f64> = self
            .vars
            .iter()
            .map(|var| -0.5 * var.iter().map(|v| (2.0 * PI * v).ln()).sum::<f64>())
            .collect();
        seq.iter()
            .map(|obs| {
                let obs = obs.as_ref();
                (0..self.n_states)
                    .map(|i| {
                        let maha: f64 = obs
                            .iter()
                            .zip(&self.means[i])
                            .zip(&self.vars[i])
                            .map(|((x, m), v)| (x - m) * (x - m) / v)
                            .sum();
                        norms[i] - 0.5 * maha
                    })
                    .collect()
            })
            .collect()
    }

    fn forward(&self, b: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let n = self.n_states;
        let mut alpha = Vec::with_capacity(b.len());
        alpha.push((0..n).map(|i| self.log_start[i] + b[0][i]).collect::<Vec<_>>());
        let mut tmp = vec![0.0; n];
        for t in 1..b.len() {
            let prev = &alpha[t - 1];
            let row = (0..n)
                .map(|j| {
                    for i in 0..n {
                        tmp[i] = prev[i] + self.log_trans[i][j];
                    }
                    log_sum_exp(&tmp) + b[t][j]
                })
                .collect();
            alpha.push(row);
        }
        alpha
    }

    fn backward(&self, b: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let n = self.n_states;
        let len = b.len();
        let mut beta = vec![vec![0.0; n]; len];
        let mut tmp = vec![0.0; n];
        for t in (0..len.saturating_sub(1)).rev() {
            for i in 0..n {
                for j in 0..n {
                    tmp[j] = self.log_trans[i][j] + b[t + 1][j] + beta[t + 1][j];
                }
                beta[t][i] = log_sum_exp(&tmp);
            }
        }
        beta
    }

    fn check_observations<O: AsRef<[f64]>>(&self, seq: &[O]) -> Result<(), HmmError> {
        if seq.is_empty() {
            return Err(HmmError::EmptySequence { index: 0 });
        }
        for obs in seq {
            let actual = obs.as_ref().len();
            if actual != self.n_features {
                return Err(HmmError::DimensionMismatch {
                    expected: self.n_features,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Log-likelihood of `seq` under this model.
    pub fn log_likelihood<O: AsRef<[f64]>>(&self, seq: &[O]) -> Result<f64, HmmError> {
        self.check_observations(seq)?;
        let alpha = self.forward(&self.log_emissions(seq));
        let ll = log_sum_exp(&alpha[alpha.len() - 1]);
        if ll.is_nan() {
            return Err(HmmError::NonFinite);
        }
        Ok(ll)
    }

    /// Most likely hidden-state path and its joint log-probability.
    pub fn viterbi<O: AsRef<[f64]>>(&self, seq: &[O]) -> Result<(f64, Vec<usize>), HmmError> {
        self.check_observations(seq)?;
        let n = self.n_states;
        let b = self.log_emissions(seq);
        let mut delta: Vec<f64> = (0..n).map(|i| self.log_start[i] + b[0][i]).collect();
        let mut back = vec![vec![0usize; n]; seq.len()];

        for t in 1..seq.len() {
            let mut next = vec![f64::NEG_INFINITY; n];
            for j in 0..n {
                let (best_i, best) = (0..n)
                    .map(|i| (i, delta[i] + self.log_trans[i][j]))
                    .fold((0, f64::NEG_INFINITY), |acc, c| if c.1 > acc.1 { c } else { acc });
                next[j] = best + b[t][j];
                back[t][j] = best_i;
            }
            delta = next;
        }

        let (mut state, score) = delta
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, c| if c.1 > acc.1 { c } else { acc });
        let mut path = vec![0; seq.len()];
        for t in (0..seq.len()).rev() {
            path[t] = state;
            state = back[t][state];
        }
        Ok((score, path))
    }
}

fn check_sequences<O: AsRef<[f64]>>(sequences: &[Vec<O>]) -> Result<usize, HmmError> {
    let first = sequences.first().ok_or(HmmError::NoSequences)?;
    let expected = first
        .first()
        .map(|o| o.as_ref().len())
        .ok_or(HmmError::EmptySequence { index: 0 })?;
    for (index, seq) in sequences.iter().enumerate() {
        if seq.is_empty() {
            return Err(HmmError::EmptySequence { index });
        }
        for obs in seq {
            let actual = obs.as_ref().len();
            if actual != expected {
                return Err(HmmError::DimensionMismatch { expected, actual });
            }
        }
    }
    Ok(expected)
}

fn safe_ln(p: f64) -> f64 {
    p.max(PROB_FLOOR).ln()
}

pub(crate) fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}
