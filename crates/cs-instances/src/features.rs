use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use cs_types::{Embedding, ExtractionError, Instance, InstanceId};

use crate::cache::{content_digest, EmbeddingCache};
use crate::mps::{read_mps_file, Constraint, MipModel, RowSense, VarKind};

/// Bumped whenever the meaning or order of the features changes, so cached
/// embeddings from older versions are recomputed.
const FEATURE_VERSION: u32 = 1;

/// Structural features, in embedding order.
pub const FEATURE_NAMES: [&str; 12] = [
    "ratio_binary",
    "ratio_integer",
    "ratio_continuous",
    "objective_density",
    "ratio_linear",
    "ratio_logicor",
    "ratio_knapsack",
    "ratio_setppc",
    "ratio_varbound",
    "ratio_equality",
    "average_row_density",
    "max_row_density",
];

/// Appended when `include_size_features` is set.
pub const SIZE_FEATURE_NAMES: [&str; 3] = ["log_rows", "log_columns", "log_nonzeros"];

/// Feature extractor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Largest accepted instance file, in bytes (compressed size for `.gz`).
    pub max_file_bytes: u64,
    /// Largest accepted number of constraint non-zeros.
    pub max_nonzeros: u64,
    /// Append log-scaled problem size features.
    pub include_size_features: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 512 * 1024 * 1024,
            max_nonzeros: 50_000_000,
            include_size_features: false,
        }
    }
}

impl ExtractorConfig {
    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_max_nonzeros(mut self, nonzeros: u64) -> Self {
        self.max_nonzeros = nonzeros;
        self
    }

    pub fn with_size_features(mut self, enabled: bool) -> Self {
        self.include_size_features = enabled;
        self
    }

    /// Embedding dimension produced under this configuration.
    pub fn dimension(&self) -> usize {
        FEATURE_NAMES.len()
            + if self.include_size_features {
                SIZE_FEATURE_NAMES.len()
            } else {
                0
            }
    }

    /// Ordered feature names, matching the embedding components.
    pub fn feature_names(&self) -> Vec<&'static str> {
        let mut names = FEATURE_NAMES.to_vec();
        if self.include_size_features {
            names.extend_from_slice(&SIZE_FEATURE_NAMES);
        }
        names
    }

    /// Stable digest of everything that decides a cached embedding.
    ///
    /// The non-zero limit is part of it since it can only be checked by
    /// parsing; the file-size limit is checked before every cache lookup.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(FEATURE_VERSION.to_le_bytes());
        hasher.update([self.include_size_features as u8]);
        hasher.update(self.max_nonzeros.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Embeddings plus the instances that could not be embedded.
#[derive(Debug, Default)]
pub struct ExtractionReport {
    /// Sorted by instance id.
    pub embeddings: Vec<Embedding>,
    pub failures: Vec<ExtractionError>,
    pub cache_hits: usize,
}

/// Converts MIP instances into fixed-length structural embeddings.
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    config: ExtractorConfig,
}

impl FeatureExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Read and embed one instance.
    pub fn embed(&self, instance: &Instance) -> Result<Embedding, ExtractionError> {
        self.check_file_size(instance)?;
        let model = read_mps_file(&instance.path, instance.id.as_str(), self.config.max_nonzeros)?;
        self.embed_model(&instance.id, &model)
    }

    fn check_file_size(&self, instance: &Instance) -> Result<(), ExtractionError> {
        let metadata = std::fs::metadata(&instance.path).map_err(|e| {
            ExtractionError::Unreadable {
                instance: instance.id.to_string(),
                path: instance.path.clone(),
                message: e.to_string(),
            }
        })?;
        if metadata.len() > self.config.max_file_bytes {
            return Err(ExtractionError::TooLarge {
                instance: instance.id.to_string(),
                what: "file size".to_string(),
                actual: metadata.len(),
                limit: self.config.max_file_bytes,
            });
        }
        Ok(())
    }

    /// Embed an already parsed model.
    pub fn embed_model(
        &self,
        instance_id: &InstanceId,
        model: &MipModel,
    ) -> Result<Embedding, ExtractionError> {
        let n = model.variables.len();
        let m = model.constraints.len();
        if n == 0 {
            return Err(ExtractionError::Empty {
                instance: instance_id.to_string(),
                what: "columns".to_string(),
            });
        }
        if m == 0 {
            return Err(ExtractionError::Empty {
                instance: instance_id.to_string(),
                what: "rows".to_string(),
            });
        }

        let cols = n as f64;
        let rows = m as f64;

        let mut class_counts = [0usize; 5];
        let mut equalities = 0usize;
        let mut max_row_len = 0usize;
        for row in &model.constraints {
            class_counts[classify_row(row, model) as usize] += 1;
            if row.sense == RowSense::Equal {
                equalities += 1;
            }
            max_row_len = max_row_len.max(row.entries.len());
        }
        let nonzeros = model.num_nonzeros();
        let with_objective = model.variables.iter().filter(|v| v.objective != 0.0).count();

        let mut values = vec![
            model.count_kind(VarKind::Binary) as f64 / cols,
            model.count_kind(VarKind::Integer) as f64 / cols,
            model.count_kind(VarKind::Continuous) as f64 / cols,
            with_objective as f64 / cols,
        ];
        values.extend(class_counts.iter().map(|&c| c as f64 / rows));
        values.push(equalities as f64 / rows);
        values.push(nonzeros as f64 / rows / cols);
        values.push(max_row_len as f64 / cols);

        if self.config.include_size_features {
            values.push((1.0 + rows).ln());
            values.push((1.0 + cols).ln());
            values.push((1.0 + nonzeros as f64).ln());
        }

        debug!(instance = %instance_id, rows = m, columns = n, nonzeros, "Embedded instance");
        Ok(Embedding::new(instance_id.clone(), values))
    }

    /// Embed many instances in parallel.
    ///
    /// Failing instances are logged and returned in the report; they never
    /// abort the batch. When a cache is given, entries whose content digest
    /// and configuration fingerprint match are reused.
    pub fn embed_all(
        &self,
        instances: &[Instance],
        cache: Option<&EmbeddingCache>,
    ) -> ExtractionReport {
        let fingerprint = self.config.fingerprint();

        let results: Vec<(Result<Embedding, ExtractionError>, bool)> = instances
            .par_iter()
            .map(|instance| self.embed_cached(instance, cache, &fingerprint))
            .collect();

        let mut report = ExtractionReport::default();
        for (result, hit) in results {
            match result {
                Ok(embedding) => {
                    if hit {
                        report.cache_hits += 1;
                    }
                    report.embeddings.push(embedding);
                }
                Err(error) => {
                    warn!(instance = %error.instance(), error = %error, "Excluding instance");
                    report.failures.push(error);
                }
            }
        }
        report
            .embeddings
            .sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        info!(
            embedded = report.embeddings.len(),
            excluded = report.failures.len(),
            cache_hits = report.cache_hits,
            "Feature extraction finished"
        );
        report
    }

    fn embed_cached(
        &self,
        instance: &Instance,
        cache: Option<&EmbeddingCache>,
        fingerprint: &str,
    ) -> (Result<Embedding, ExtractionError>, bool) {
        let Some(cache) = cache else {
            return (self.embed(instance), false);
        };
        if let Err(e) = self.check_file_size(instance) {
            return (Err(e), false);
        }

        let digest = match content_digest(&instance.path) {
            Ok(digest) => digest,
            Err(e) => {
                return (
                    Err(ExtractionError::Unreadable {
                        instance: instance.id.to_string(),
                        path: instance.path.clone(),
                        message: e.to_string(),
                    }),
                    false,
                )
            }
        };

        if let Some(embedding) = cache.get(&instance.id, &digest, fingerprint) {
            return (Ok(embedding), true);
        }

        let result = self.embed(instance);
        if let Ok(embedding) = &result {
            if let Err(e) = cache.store(embedding, &digest, fingerprint) {
                warn!(instance = %instance.id, error = %e, "Failed to cache embedding");
            }
        }
        (result, false)
    }
}

/// Structural row classes, in embedding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowClass {
    Linear = 0,
    Logicor = 1,
    Knapsack = 2,
    Setppc = 3,
    Varbound = 4,
}

/// Classify a row by the constraint type a MIP solver would upgrade it to.
///
/// - setppc: `sum x <= 1` or `sum x = 1` over binaries
/// - logicor: `sum x >= 1` over binaries
/// - knapsack: integral coefficients over binaries, inequality
/// - varbound: two variables, at least one of them integral
/// - linear: everything else
pub fn classify_row(row: &Constraint, model: &MipModel) -> RowClass {
    if row.entries.is_empty() || row.range.is_some() {
        return RowClass::Linear;
    }

    let all_binary = row
        .entries
        .iter()
        .all(|&(col, _)| model.variables[col].kind == VarKind::Binary);

    if all_binary {
        let unit = row.entries.iter().all(|&(_, a)| a == 1.0) && row.rhs == 1.0;
        if unit {
            return match row.sense {
                RowSense::GreaterEqual => RowClass::Logicor,
                RowSense::Equal | RowSense::LessEqual => RowClass::Setppc,
            };
        }
        let integral = row.entries.iter().all(|&(_, a)| a.fract() == 0.0) && row.rhs.fract() == 0.0;
        if integral && row.sense != RowSense::Equal {
            return RowClass::Knapsack;
        }
    }

    if row.entries.len() == 2
        && row
            .entries
            .iter()
            .any(|&(col, _)| model.variables[col].kind != VarKind::Continuous)
    {
        return RowClass::Varbound;
    }

    RowClass::Linear
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mps::parse_mps;
    use std::io::Cursor;
    use std::io::Write;

    const MODEL: &str = "\
NAME          features
ROWS
 N  obj
 L  pack
 G  cover
 L  knap
 L  vb
 E  bal
COLUMNS
    MARKER                 'MARKER'                 'INTORG'
    a         obj       1.0        pack      1.0
    a         cover     1.0        knap      3.0
    b         pack      1.0        cover     1.0
    b         knap      4.0
    n         vb        -10.0
    MARKER                 'MARKER'                 'INTEND'
    y         vb        1.0        bal       1.0
    z         bal       1.0        obj       2.0
RHS
    RHS       pack      1.0        cover     1.0
    RHS       knap      5.0        bal       7.0
BOUNDS
 UP BND       a         1
 UP BND       b         1
 UP BND       n         10
ENDATA
";

    fn model() -> MipModel {
        parse_mps(Cursor::new(MODEL), "features", u64::MAX).unwrap()
    }

    #[test]
    fn rows_are_classified() {
        let model = model();
        let classes: Vec<RowClass> = model
            .constraints
            .iter()
            .map(|row| classify_row(row, &model))
            .collect();
        assert_eq!(
            classes,
            vec![
                RowClass::Setppc,
                RowClass::Logicor,
                RowClass::Knapsack,
                RowClass::Varbound,
                RowClass::Linear,
            ]
        );
    }

    #[test]
    fn embedding_values() {
        let extractor = FeatureExtractor::default();
        let embedding = extractor
            .embed_model(&InstanceId::new("features"), &model())
            .unwrap();
        assert_eq!(embedding.dimension(), FEATURE_NAMES.len());
        assert!(embedding.is_finite());

        let v = &embedding.values;
        // a, b binary; n integer; y, z continuous
        assert!((v[0] - 2.0 / 5.0).abs() < 1e-12);
        assert!((v[1] - 1.0 / 5.0).abs() < 1e-12);
        assert!((v[2] - 2.0 / 5.0).abs() < 1e-12);
        assert!((v[3] - 2.0 / 5.0).abs() < 1e-12);
        // one row of each class
        for ratio in &v[4..9] {
            assert!((ratio - 0.2).abs() < 1e-12);
        }
        assert!((v[9] - 0.2).abs() < 1e-12);
        // 10 non-zeros over 5 rows and 5 columns
        assert!((v[10] - 10.0 / 25.0).abs() < 1e-12);
        assert!((v[11] - 2.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn size_features_extend_dimension() {
        let config = ExtractorConfig::default().with_size_features(true);
        assert_eq!(config.dimension(), 15);
        let embedding = FeatureExtractor::new(config)
            .embed_model(&InstanceId::new("features"), &model())
            .unwrap();
        assert_eq!(embedding.dimension(), 15);
        assert!((embedding.values[12] - 6.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn empty_model_is_an_error() {
        let empty = MipModel::default();
        let err = FeatureExtractor::default()
            .embed_model(&InstanceId::new("empty"), &empty)
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Empty { .. }));
    }

    #[test]
    fn fingerprint_tracks_layout_and_nonzero_limit() {
        let base = ExtractorConfig::default();
        assert_eq!(
            base.fingerprint(),
            base.clone().with_max_file_bytes(10).fingerprint()
        );
        assert_ne!(
            base.fingerprint(),
            base.clone().with_max_nonzeros(10).fingerprint()
        );
        assert_ne!(
            base.fingerprint(),
            base.clone().with_size_features(true).fingerprint()
        );
    }

    #[test]
    fn embed_all_excludes_failures() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.mps");
        std::fs::write(&good, MODEL).unwrap();
        let bad = dir.path().join("bad.mps");
        let mut file = std::fs::File::create(&bad).unwrap();
        writeln!(file, "NAME bad\nROWS\n N obj\nGARBAGE").unwrap();

        let instances = vec![
            Instance::new(InstanceId::new("good"), &good),
            Instance::new(InstanceId::new("bad"), &bad),
            Instance::new(InstanceId::new("missing"), dir.path().join("missing.mps")),
        ];
        let cache = EmbeddingCache::in_memory();
        let extractor = FeatureExtractor::default();

        let report = extractor.embed_all(&instances, Some(&cache));
        assert_eq!(report.embeddings.len(), 1);
        assert_eq!(report.embeddings[0].instance_id, InstanceId::new("good"));
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.cache_hits, 0);

        let again = extractor.embed_all(&instances, Some(&cache));
        assert_eq!(again.cache_hits, 1);
        assert_eq!(again.embeddings, report.embeddings);
    }

    #[test]
    fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.mps");
        std::fs::write(&path, MODEL).unwrap();
        let extractor = FeatureExtractor::new(ExtractorConfig::default().with_max_file_bytes(16));
        let err = extractor
            .embed(&Instance::new(InstanceId::new("big"), &path))
            .unwrap_err();
        assert!(matches!(err, ExtractionError::TooLarge { limit: 16, .. }));
    }

    #[test]
    fn tightened_limits_apply_to_cached_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cached.mps");
        std::fs::write(&path, MODEL).unwrap();
        let instances = vec![Instance::new(InstanceId::new("cached"), &path)];
        let cache = EmbeddingCache::in_memory();

        let loose = FeatureExtractor::default().embed_all(&instances, Some(&cache));
        assert_eq!(loose.embeddings.len(), 1);

        let small_files = FeatureExtractor::new(ExtractorConfig::default().with_max_file_bytes(16));
        let report = small_files.embed_all(&instances, Some(&cache));
        assert!(report.embeddings.is_empty());
        assert_eq!(report.cache_hits, 0);
        assert!(matches!(
            report.failures[0],
            ExtractionError::TooLarge { limit: 16, .. }
        ));

        let few_nonzeros = FeatureExtractor::new(ExtractorConfig::default().with_max_nonzeros(3));
        let report = few_nonzeros.embed_all(&instances, Some(&cache));
        assert!(report.embeddings.is_empty());
        assert_eq!(report.failures.len(), 1);
    }
}
