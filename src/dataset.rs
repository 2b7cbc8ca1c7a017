//! Recorded gesture examples on disk.
//!
//! Layout: `<root>/<class>/<n>.gesture`, each file a JSON array of full
//! (pre-downsample) feature vectors.

use log::{info, warn};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::bank::TrainingExample;
use crate::buffer::downsample;
use crate::features::{FEATURE_LEN, FeatureVector};

pub const EXAMPLE_EXT: &str = "gesture";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} holds an empty sequence", path.display())]
    Empty { path: PathBuf },
    #[error("{}: vector {index} has {actual} values, expected {expected}", path.display())]
    BadVector {
        path: PathBuf,
        index: usize,
        actual: usize,
        expected: usize,
    },
    #[error("invalid class name '{0}'")]
    BadClassName(String),
    #[error("no gesture classes under {}", .0.display())]
    NoClasses(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> DatasetError + '_ {
    move |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExample {
    pub label: String,
    pub path: PathBuf,
    pub features: Vec<FeatureVector>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    classes: BTreeMap<String, Vec<RecordedExample>>,
}

impl Dataset {
    /// Loads every class directory under `root`. Examples shorter than
    /// `expected_len` are kept but reported.
    pub fn load(root: &Path, expected_len: usize) -> Result<Self, DatasetError> {
        let mut classes = BTreeMap::new();
        for entry in fs::read_dir(root).map_err(io_err(root))? {
            let entry = entry.map_err(io_err(root))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !path.is_dir() {
                continue;
            }
            let examples = load_class(&path, name, expected_len)?;
            info!("loaded {} examples of '{name}'", examples.len());
            classes.insert(name.to_string(), examples);
        }
        if classes.is_empty() {
            return Err(DatasetError::NoClasses(root.to_path_buf()));
        }
        Ok(Self { classes })
    }

    pub fn class_names(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.classes
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.classes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn examples(&self) -> impl Iterator<Item = &RecordedExample> {
        self.classes.values().flatten()
    }

    /// Downsampled model input for every example, class by class.
    pub fn training_examples(&self, stride: usize) -> Vec<TrainingExample> {
        self.examples()
            .map(|ex| TrainingExample {
                label: ex.label.clone(),
                sequence: downsample(&ex.features, stride),
            })
            .collect()
    }
}

fn load_class(
    dir: &Path,
    label: &str,
    expected_len: usize,
) -> Result<Vec<RecordedExample>, DatasetError> {
    let mut files: Vec<(u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXAMPLE_EXT) {
            continue;
        }
        match example_index(&path) {
            Some(n) => files.push((n, path)),
            None => warn!("skipping {}: name is not a number", path.display()),
        }
    }
    files.sort();

    files
        .into_iter()
        .map(|(_, path)| {
            let features = read_example(&path)?;
            if features.len() < expected_len {
                warn!(
                    "{} has {} frames, window holds {expected_len}",
                    path.display(),
                    features.len()
                );
            }
            Ok(RecordedExample {
                label: label.to_string(),
                path,
                features,
            })
        })
        .collect()
}

fn example_index(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

pub fn read_example(path: &Path) -> Result<Vec<FeatureVector>, DatasetError> {
    let txt = fs::read_to_string(path).map_err(io_err(path))?;
    let rows: Vec<Vec<f64>> = serde_json::from_str(&txt).map_err(|source| DatasetError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if rows.is_empty() {
        return Err(DatasetError::Empty {
            path: path.to_path_buf(),
        });
    }
    rows.into_iter()
        .enumerate()
        .map(|(index, row)| {
            FeatureVector::try_from(row.as_slice()).map_err(|_| DatasetError::BadVector {
                path: path.to_path_buf(),
                index,
                actual: row.len(),
                expected: FEATURE_LEN,
            })
        })
        .collect()
}

/// Writes `features` as the next numbered example of `class`.
pub fn save_example(
    root: &Path,
    class: &str,
    features: &[FeatureVector],
) -> Result<PathBuf, DatasetError> {
    if class.trim().is_empty() || class.starts_with('.') || class.contains(['/', '\\']) {
        return Err(DatasetError::BadClassName(class.to_string()));
    }
    if features.is_empty() {
        return Err(DatasetError::Empty {
            path: root.join(class),
        });
    }
    let dir = root.join(class);
    fs::create_dir_all(&dir).map_err(io_err(&dir))?;

    let mut next = 1;
    for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
        let path = entry.map_err(io_err(&dir))?.path();
        if let Some(n) = example_index(&path) {
            next = next.max(n + 1);
        }
    }

    let path = dir.join(format!("{next}.{EXAMPLE_EXT}"));
    let rows: Vec<&[f64]> = features.iter().map(|f| f.as_slice()).collect();
    let txt = serde_json::to_string(&rows).map_err(|source| DatasetError::Parse {
        path: path.clone(),
        source,
    })?;
    fs::write(&path, txt).map_err(io_err(&path))?;
    info!("saved recorded gesture at {}", path.display());
    Ok(path)
}
