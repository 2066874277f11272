use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cs_types::{Embedding, InstanceId, InstanceSubset, SelectionError};

/// Distance used in embedding space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Manhattan,
    Chebyshev,
    Cosine,
}

impl DistanceMetric {
    pub fn distance(&self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            Self::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f64>()
                .sqrt(),
            Self::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
            Self::Chebyshev => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y).abs())
                .fold(0.0, f64::max),
            Self::Cosine => {
                let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
                let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
                if na == 0.0 && nb == 0.0 {
                    0.0
                } else if na == 0.0 || nb == 0.0 {
                    1.0
                } else {
                    (1.0 - dot / (na * nb)).max(0.0)
                }
            }
        }
    }
}

/// How the first point of the greedy selection is chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SeedPolicy {
    /// The instance nearest to the centroid of all embeddings.
    #[default]
    CentroidNearest,
    /// A fixed instance.
    Fixed { instance: InstanceId },
    /// A uniformly drawn instance from a seeded generator.
    Random { seed: u64 },
}

/// Diversity selector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub metric: DistanceMetric,
    pub seed: SeedPolicy,
    /// Min-max normalize every dimension before measuring distances.
    pub normalize: bool,
    /// Candidates within this distance of the best are treated as tied.
    pub tolerance: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::Euclidean,
            seed: SeedPolicy::CentroidNearest,
            normalize: false,
            tolerance: 1e-9,
        }
    }
}

impl SelectorConfig {
    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_seed(mut self, seed: SeedPolicy) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_normalization(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }
}

/// Greedy farthest-point (max-min distance) subset selection.
#[derive(Debug, Clone, Default)]
pub struct DiversitySelector {
    config: SelectorConfig,
}

impl DiversitySelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Select `k` instances that spread over the embedding space.
    ///
    /// `k == 0` yields an empty subset and `k == N` yields every id in
    /// ascending order. Otherwise the ids come in greedy order starting with
    /// the seed point. Ties go to the lowest instance id.
    pub fn select(
        &self,
        embeddings: &[Embedding],
        k: usize,
    ) -> Result<InstanceSubset, SelectionError> {
        if k > embeddings.len() {
            return Err(SelectionError::InsufficientData {
                requested: k,
                available: embeddings.len(),
            });
        }
        validate(embeddings)?;

        if k == 0 {
            return Ok(InstanceSubset::empty());
        }

        let mut sorted: Vec<&Embedding> = embeddings.iter().collect();
        sorted.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        if k == sorted.len() {
            return InstanceSubset::new(sorted.iter().map(|e| e.instance_id.clone()).collect());
        }

        let points = self.prepare(&sorted);
        let seed = self.seed_index(&sorted, &points)?;
        let order = self.farthest_point(&points, seed, k);

        let ids: Vec<InstanceId> = order
            .into_iter()
            .map(|idx| sorted[idx].instance_id.clone())
            .collect();
        info!(
            selected = ids.len(),
            pool = sorted.len(),
            metric = ?self.config.metric,
            "Selected diverse instance subset"
        );
        InstanceSubset::new(ids)
    }

    fn prepare(&self, sorted: &[&Embedding]) -> Vec<Vec<f64>> {
        let points: Vec<Vec<f64>> = sorted.iter().map(|e| e.values.clone()).collect();
        if self.config.normalize {
            min_max_normalize(points)
        } else {
            points
        }
    }

    fn seed_index(
        &self,
        sorted: &[&Embedding],
        points: &[Vec<f64>],
    ) -> Result<usize, SelectionError> {
        match &self.config.seed {
            SeedPolicy::Fixed { instance } => sorted
                .iter()
                .position(|e| &e.instance_id == instance)
                .ok_or_else(|| SelectionError::UnknownSeed {
                    instance: instance.to_string(),
                }),
            SeedPolicy::CentroidNearest => {
                let centroid = centroid(points);
                let distances: Vec<f64> = points
                    .iter()
                    .map(|p| self.config.metric.distance(p, &centroid))
                    .collect();
                let nearest = distances.iter().cloned().fold(f64::INFINITY, f64::min);
                Ok(distances
                    .iter()
                    .position(|&d| d <= nearest + self.config.tolerance)
                    .unwrap_or(0))
            }
            SeedPolicy::Random { seed } => {
                let mut rng = ChaCha8Rng::seed_from_u64(*seed);
                Ok(rng.gen_range(0..points.len()))
            }
        }
    }

    fn farthest_point(&self, points: &[Vec<f64>], seed: usize, k: usize) -> Vec<usize> {
        let metric = self.config.metric;
        let mut selected = vec![false; points.len()];
        let mut min_distance: Vec<f64> = points
            .iter()
            .map(|p| metric.distance(p, &points[seed]))
            .collect();
        selected[seed] = true;
        let mut order = vec![seed];

        while order.len() < k {
            let best = (0..points.len())
                .filter(|&i| !selected[i])
                .map(|i| min_distance[i])
                .fold(f64::NEG_INFINITY, f64::max);

            // Lowest index within tolerance wins; indices follow id order.
            let Some(next) = (0..points.len())
                .find(|&i| !selected[i] && min_distance[i] >= best - self.config.tolerance)
            else {
                break;
            };

            debug!(index = next, min_distance = min_distance[next], "Greedy pick");
            selected[next] = true;
            order.push(next);
            for (i, point) in points.iter().enumerate() {
                if !selected[i] {
                    let d = metric.distance(point, &points[next]);
                    if d < min_distance[i] {
                        min_distance[i] = d;
                    }
                }
            }
        }
        order
    }
}

fn validate(embeddings: &[Embedding]) -> Result<(), SelectionError> {
    let Some(first) = embeddings.first() else {
        return Ok(());
    };
    let expected = first.dimension();
    let mut seen = HashSet::with_capacity(embeddings.len());
    for embedding in embeddings {
        if !seen.insert(&embedding.instance_id) {
            return Err(SelectionError::DuplicateInstance {
                instance: embedding.instance_id.to_string(),
            });
        }
        if embedding.dimension() != expected {
            return Err(SelectionError::DimensionMismatch {
                instance: embedding.instance_id.to_string(),
                expected,
                actual: embedding.dimension(),
            });
        }
        if !embedding.is_finite() {
            return Err(SelectionError::NonFinite {
                instance: embedding.instance_id.to_string(),
            });
        }
    }
    Ok(())
}

fn centroid(points: &[Vec<f64>]) -> Vec<f64> {
    let dim = points.first().map(|p| p.len()).unwrap_or(0);
    let mut sum = vec![0.0; dim];
    for point in points {
        for (s, v) in sum.iter_mut().zip(point) {
            *s += v;
        }
    }
    let n = points.len().max(1) as f64;
    sum.into_iter().map(|s| s / n).collect()
}

/// Scale every dimension to [0, 1]; constant dimensions become 0.
pub fn min_max_normalize(mut points: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
    let dim = points.first().map(|p| p.len()).unwrap_or(0);
    for d in 0..dim {
        let (lo, hi) = points
            .iter()
            .map(|p| p[d])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        let span = hi - lo;
        for point in points.iter_mut() {
            point[d] = if span > 0.0 { (point[d] - lo) / span } else { 0.0 };
        }
    }
    points
}

/// Smallest pairwise distance among the selected embeddings.
pub fn min_pairwise_distance(
    embeddings: &[Embedding],
    subset: &InstanceSubset,
    metric: DistanceMetric,
) -> f64 {
    let chosen: Vec<&Embedding> = embeddings
        .iter()
        .filter(|e| subset.contains(&e.instance_id))
        .collect();
    let mut best = f64::INFINITY;
    for (i, a) in chosen.iter().enumerate() {
        for b in &chosen[i + 1..] {
            best = best.min(metric.distance(&a.values, &b.values));
        }
    }
    best
}
