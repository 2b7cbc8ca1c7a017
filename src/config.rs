use anyhow::{Result, anyhow};
use directories::UserDirs;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub capacity: usize,
    pub short_lag: usize,
    pub long_lag: usize,
    pub stride: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 40,
            short_lag: 5,
            long_lag: 10,
            stride: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub hidden_states: usize,
    pub max_iter: usize,
    pub tol: f64,
    pub min_covar: f64,
    pub min_examples: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_states: 7,
            max_iter: 50,
            tol: 1e-3,
            min_covar: 1e-3,
            min_examples: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// A label is committed only when its posterior is strictly above this.
    pub threshold: f64,
    /// Evaluation flags test examples whose correct-label posterior is below this.
    pub diagnostic_threshold: f64,
    pub learning_rate: f64,
    pub epochs: usize,
    pub l2: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            diagnostic_threshold: 0.9,
            learning_rate: 0.5,
            epochs: 1000,
            l2: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub train_proportion: f64,
    pub seed: Option<u64>,
    pub data_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_proportion: 0.75,
            seed: None,
            data_dir: None,
            model_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub send_hand_state: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 7401,
            send_hand_state: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub latency_budget_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            latency_budget_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub model: ModelConfig,
    pub classifier: ClassifierConfig,
    pub training: TrainingConfig,
    pub transport: TransportConfig,
    pub runtime: RuntimeConfig,
}

pub fn config_dir() -> Result<PathBuf> {
    let dirs = UserDirs::new().ok_or_else(|| anyhow!("cannot resolve home directory"))?;
    Ok(dirs.home_dir().join(".config").join("gesturectl"))
}

fn default_config_text() -> &'static str {
    include_str!("../config/default.toml")
}

impl Config {
    /// Loads `~/.config/gesturectl/config.toml`, writing the bundled default first if absent.
    pub fn load_or_install_default() -> Result<(Self, PathBuf)> {
        let dir = config_dir()?;
        fs::create_dir_all(&dir)?;
        let path = dir.join("config.toml");
        if !path.exists() {
            fs::write(&path, default_config_text())?;
            info!("installed default config at {}", path.display());
        }
        let cfg = Self::load(&path)?;
        Ok((cfg, path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let txt = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
        let cfg = Self::parse(&txt).map_err(|e| anyhow!("{}: {e}", path.display()))?;
        Ok(cfg)
    }

    pub fn parse(txt: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(txt).map_err(|e| anyhow!("failed to parse config: {e}"))?;
        validate_config(&cfg)?;
        Ok(cfg)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.training.data_dir {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("data")),
        }
    }

    pub fn model_dir(&self) -> Result<PathBuf> {
        match &self.training.model_dir {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("models")),
        }
    }
}

fn validate_config(c: &Config) -> Result<()> {
    let w = &c.window;
    if w.capacity == 0 || w.stride == 0 {
        return Err(anyhow!("window.capacity and window.stride must be positive"));
    }
    if w.short_lag == 0 || w.short_lag > w.long_lag {
        return Err(anyhow!("window lags must satisfy 0 < short_lag <= long_lag"));
    }
    if w.long_lag >= w.capacity {
        return Err(anyhow!(
            "window.long_lag ({}) must be below window.capacity ({})",
            w.long_lag,
            w.capacity
        ));
    }

    let m = &c.model;
    if m.hidden_states == 0 || m.max_iter == 0 {
        return Err(anyhow!("model.hidden_states and model.max_iter must be positive"));
    }
    if !(m.min_covar > 0.0) || !(m.tol >= 0.0) {
        return Err(anyhow!("model.min_covar must be > 0 and model.tol >= 0"));
    }

    let k = &c.classifier;
    for (name, v) in [
        ("classifier.threshold", k.threshold),
        ("classifier.diagnostic_threshold", k.diagnostic_threshold),
        ("training.train_proportion", c.training.train_proportion),
    ] {
        if !(v > 0.0 && v < 1.0) {
            return Err(anyhow!("{name} must be in (0,1), got {v}"));
        }
    }
    if !(k.learning_rate > 0.0) || k.epochs == 0 || !(k.l2 >= 0.0) {
        return Err(anyhow!(
            "classifier.learning_rate and classifier.epochs must be positive, classifier.l2 non-negative"
        ));
    }

    if c.transport.enabled && c.transport.host.trim().is_empty() {
        return Err(anyhow!("transport.host is empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_default_matches_builtin_defaults() {
        let cfg = Config::parse(default_config_text()).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let cfg = Config::parse("[classifier]\nthreshold = 0.6\n").unwrap();
        assert_eq!(cfg.classifier.threshold, 0.6);
        assert_eq!(cfg.window.capacity, 40);
        assert_eq!(cfg.model.hidden_states, 7);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::parse("[window]\nlong_lag = 40\n").is_err());
        assert!(Config::parse("[window]\nshort_lag = 12\n").is_err());
        assert!(Config::parse("[classifier]\nthreshold = 1.0\n").is_err());
        assert!(Config::parse("[training]\ntrain_proportion = 0.0\n").is_err());
        assert!(Config::parse("[model]\nhidden_states = 0\n").is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("c.toml");
        fs::write(&p, "[window\n").unwrap();
        let err = Config::load(&p).unwrap_err().to_string();
        assert!(err.contains("c.toml"));
    }
}
