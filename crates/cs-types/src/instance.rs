use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{CsResult, SelectionError};

/// Instance identifier: the file name of the problem without its `.mps` /
/// `.mps.gz` suffix.  Ordering is lexicographic and is used for tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the id from a problem file path (`air04.mps.gz` -> `air04`).
    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let stem = file_name
            .strip_suffix(".gz")
            .unwrap_or(file_name);
        let stem = stem.strip_suffix(".mps").or_else(|| stem.strip_suffix(".MPS"))?;
        if stem.is_empty() {
            return None;
        }
        Some(Self(stem.to_string()))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One concrete MIP problem registered for benchmarking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Path to the problem definition (MPS, optionally gzip-compressed).
    pub path: PathBuf,
    /// Optional reference solution handed to the solver.
    pub solution: Option<PathBuf>,
}

impl Instance {
    pub fn new(id: InstanceId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            solution: None,
        }
    }

    pub fn with_solution(mut self, solution: impl Into<PathBuf>) -> Self {
        self.solution = Some(solution.into());
        self
    }
}

/// Structural feature vector of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub instance_id: InstanceId,
    pub values: Vec<f64>,
}

impl Embedding {
    pub fn new(instance_id: InstanceId, values: Vec<f64>) -> Self {
        Self {
            instance_id,
            values,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Ordered, duplicate-free set of instance ids used as the fixed evaluation
/// workload of a search run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<InstanceId>", into = "Vec<InstanceId>")]
pub struct InstanceSubset {
    ids: Vec<InstanceId>,
}

impl InstanceSubset {
    pub fn new(ids: Vec<InstanceId>) -> Result<Self, SelectionError> {
        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id) {
                return Err(SelectionError::DuplicateInstance {
                    instance: id.to_string(),
                });
            }
        }
        Ok(Self { ids })
    }

    pub fn empty() -> Self {
        Self { ids: Vec::new() }
    }

    pub fn ids(&self) -> &[InstanceId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.ids.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceId> {
        self.ids.iter()
    }

    pub fn save(&self, path: &Path) -> CsResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> CsResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl TryFrom<Vec<InstanceId>> for InstanceSubset {
    type Error = SelectionError;

    fn try_from(ids: Vec<InstanceId>) -> Result<Self, Self::Error> {
        Self::new(ids)
    }
}

impl From<InstanceSubset> for Vec<InstanceId> {
    fn from(subset: InstanceSubset) -> Self {
        subset.ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_from_path() {
        assert_eq!(
            InstanceId::from_path(Path::new("/data/air04.mps.gz")),
            Some(InstanceId::new("air04"))
        );
        assert_eq!(
            InstanceId::from_path(Path::new("neos-1425699.mps")),
            Some(InstanceId::new("neos-1425699"))
        );
        assert_eq!(InstanceId::from_path(Path::new("notes.txt")), None);
        assert_eq!(InstanceId::from_path(Path::new(".mps")), None);
    }

    #[test]
    fn subset_rejects_duplicates() {
        let ids = vec![InstanceId::new("a"), InstanceId::new("b"), InstanceId::new("a")];
        let err = InstanceSubset::new(ids).unwrap_err();
        assert_eq!(
            err,
            SelectionError::DuplicateInstance {
                instance: "a".to_string()
            }
        );
    }

    #[test]
    fn subset_deserialization_enforces_uniqueness() {
        let ok: InstanceSubset = serde_json::from_str(r#"["b", "a"]"#).unwrap();
        assert_eq!(ok.ids(), &[InstanceId::new("b"), InstanceId::new("a")]);

        let dup: Result<InstanceSubset, _> = serde_json::from_str(r#"["a", "a"]"#);
        assert!(dup.is_err());
    }

    #[test]
    fn embedding_finiteness() {
        let good = Embedding::new(InstanceId::new("x"), vec![0.0, 1.5]);
        assert!(good.is_finite());
        assert_eq!(good.dimension(), 2);

        let bad = Embedding::new(InstanceId::new("y"), vec![f64::NAN]);
        assert!(!bad.is_finite());
    }
}
