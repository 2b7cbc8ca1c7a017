//! Persistence of the trained (bank, meta-classifier) pair.
//!
//! Each artifact is a JSON envelope `{format, version, feature_len, pair_id,
//! payload}` stored under a fixed name in the model directory. Both artifacts
//! of one save carry the same pair id. Loading never falls back to an
//! untrained model.

use log::info;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::bank::{SequenceModelBank, SequenceScorer};
use crate::classifier::{MetaClassifier, SoftmaxRegression};
use crate::features::FEATURE_LEN;

pub const FORMAT_VERSION: u32 = 1;
pub const BANK_FILE: &str = "bank.json";
pub const CLASSIFIER_FILE: &str = "classifier.json";

const BANK_FORMAT: &str = "gesturectl/sequence-model-bank";
const CLASSIFIER_FORMAT: &str = "gesturectl/meta-classifier";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("model artifact {} is missing; run `gesturectl train` first", path.display())]
    Missing { path: PathBuf },
    #[error("model artifact {} is incompatible: {reason}", path.display())]
    Incompatible { path: PathBuf, reason: String },
    #[error("bank classes {bank:?} do not match classifier classes {classifier:?}")]
    ClassMismatch {
        bank: Vec<String>,
        classifier: Vec<String>,
    },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    format: String,
    version: u32,
    feature_len: usize,
    /// Shared by the two artifacts written by one `save`.
    #[serde(default)]
    pair_id: Option<String>,
    payload: T,
}

struct Artifact<T> {
    pair_id: Option<String>,
    payload: T,
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bank_path(&self) -> PathBuf {
        self.dir.join(BANK_FILE)
    }

    pub fn classifier_path(&self) -> PathBuf {
        self.dir.join(CLASSIFIER_FILE)
    }

    /// Writes both artifacts to temporary files and renames them into place
    /// only once both writes succeeded.
    pub fn save(
        &self,
        bank: &SequenceModelBank,
        model: &SoftmaxRegression,
    ) -> Result<(), StoreError> {
        check_classes(bank, model)?;
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let pair_id = format!("{:016x}", rand::random::<u64>());
        let bank_path = self.bank_path();
        let classifier_path = self.classifier_path();

        let bank_tmp = stage_artifact(&bank_path, BANK_FORMAT, &pair_id, bank)?;
        let classifier_tmp =
            match stage_artifact(&classifier_path, CLASSIFIER_FORMAT, &pair_id, model) {
                Ok(tmp) => tmp,
                Err(e) => {
                    let _ = fs::remove_file(&bank_tmp);
                    return Err(e);
                }
            };
        commit(&bank_tmp, &bank_path)?;
        commit(&classifier_tmp, &classifier_path)?;
        info!("saved models to {} (pair {pair_id})", self.dir.display());
        Ok(())
    }

    pub fn load(&self) -> Result<(SequenceModelBank, SoftmaxRegression), StoreError> {
        let bank_path = self.bank_path();
        let classifier_path = self.classifier_path();
        let bank: Artifact<SequenceModelBank> = read_artifact(&bank_path, BANK_FORMAT)?;
        let model: Artifact<SoftmaxRegression> =
            read_artifact(&classifier_path, CLASSIFIER_FORMAT)?;

        let incompatible = |path: &Path, reason: String| StoreError::Incompatible {
            path: path.to_path_buf(),
            reason,
        };
        if bank.pair_id.is_none() || bank.pair_id != model.pair_id {
            return Err(incompatible(
                &classifier_path,
                format!(
                    "saved with pair id {:?}, bank has {:?}",
                    model.pair_id, bank.pair_id
                ),
            ));
        }
        let (bank, model) = (bank.payload, model.payload);

        if bank.is_empty() {
            return Err(incompatible(&bank_path, "bank holds no class models".into()));
        }
        bank
            .validate()
            .map_err(|e| incompatible(&bank_path, e.to_string()))?;
        if let Some(d) = bank.feature_len().filter(|d| *d != FEATURE_LEN) {
            return Err(incompatible(
                &bank_path,
                format!("models expect {d} features, this build produces {FEATURE_LEN}"),
            ));
        }
        model
            .validate()
            .map_err(|e| incompatible(&classifier_path, e.to_string()))?;
        check_classes(&bank, &model)?;
        if model.input_len() != bank.len() {
            return Err(incompatible(
                &classifier_path,
                format!(
                    "classifier takes {} scores, bank produces {}",
                    model.input_len(),
                    bank.len()
                ),
            ));
        }
        info!(
            "loaded {} class models from {}",
            bank.len(),
            self.dir.display()
        );
        Ok((bank, model))
    }
}

fn check_classes(bank: &SequenceModelBank, model: &SoftmaxRegression) -> Result<(), StoreError> {
    let labels = bank.labels();
    if labels.as_slice() != model.classes() {
        return Err(StoreError::ClassMismatch {
            bank: labels,
            classifier: model.classes().to_vec(),
        });
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("json.tmp")
}

/// Writes the envelope next to `path` and returns the temporary file.
fn stage_artifact<T: Serialize>(
    path: &Path,
    format: &str,
    pair_id: &str,
    payload: &T,
) -> Result<PathBuf, StoreError> {
    let env = Envelope {
        format: format.to_string(),
        version: FORMAT_VERSION,
        feature_len: FEATURE_LEN,
        pair_id: Some(pair_id.to_string()),
        payload,
    };
    let txt = serde_json::to_string(&env).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = tmp_path(path);
    fs::write(&tmp, txt).map_err(|source| StoreError::Io { path: tmp.clone(), source })?;
    Ok(tmp)
}

fn commit(tmp: &Path, path: &Path) -> Result<(), StoreError> {
    fs::rename(tmp, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_artifact<T: DeserializeOwned>(path: &Path, format: &str) -> Result<Artifact<T>, StoreError> {
    let txt = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::Missing {
                path: path.to_path_buf(),
            });
        }
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let env: Envelope<serde_json::Value> =
        serde_json::from_str(&txt).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    let incompatible = |reason: String| StoreError::Incompatible {
        path: path.to_path_buf(),
        reason,
    };
    if env.format != format {
        return Err(incompatible(format!("format '{}', expected '{format}'", env.format)));
    }
    if env.version != FORMAT_VERSION {
        return Err(incompatible(format!(
            "version {}, this build reads version {FORMAT_VERSION}",
            env.version
        )));
    }
    if env.feature_len != FEATURE_LEN {
        return Err(incompatible(format!(
            "feature length {}, expected {FEATURE_LEN}",
            env.feature_len
        )));
    }
    let payload =
        serde_json::from_value(env.payload).map_err(|e| incompatible(format!("payload: {e}")))?;
    Ok(Artifact {
        pair_id: env.pair_id,
        payload,
    })
}
