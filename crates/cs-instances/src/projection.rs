use std::path::Path;

use serde::{Deserialize, Serialize};

use cs_types::{validation_error, CsResult, Embedding, InstanceId, InstanceSubset};

const POWER_ITERATIONS: usize = 1000;
const CONVERGENCE: f64 = 1e-12;

/// Low-dimensional coordinates of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedPoint {
    pub instance_id: InstanceId,
    pub coordinates: Vec<f64>,
}

/// Principal component projection of the embeddings onto `dims` (2 or 3)
/// axes, for plotting outside of CutSearch.
///
/// Components come from power iteration with deflation on the covariance
/// matrix. Each axis is oriented so its largest loading is positive, which
/// makes the output stable across runs.
pub fn project(embeddings: &[Embedding], dims: usize) -> CsResult<Vec<ProjectedPoint>> {
    if !(2..=3).contains(&dims) {
        return Err(validation_error!("Projection supports 2 or 3 dimensions, got {}", dims));
    }
    let Some(first) = embeddings.first() else {
        return Ok(Vec::new());
    };
    let d = first.dimension();
    if embeddings.iter().any(|e| e.dimension() != d || !e.is_finite()) {
        return Err(validation_error!(
            "Projection needs finite embeddings of a single dimension"
        ));
    }

    let n = embeddings.len() as f64;
    let mut mean = vec![0.0; d];
    for e in embeddings {
        for (m, v) in mean.iter_mut().zip(&e.values) {
            *m += v / n;
        }
    }
    let centered: Vec<Vec<f64>> = embeddings
        .iter()
        .map(|e| e.values.iter().zip(&mean).map(|(v, m)| v - m).collect())
        .collect();

    let mut covariance = vec![vec![0.0; d]; d];
    for row in &centered {
        for i in 0..d {
            for j in 0..d {
                covariance[i][j] += row[i] * row[j] / n;
            }
        }
    }

    // Variance below this share of the total is numerical residue.
    let trace: f64 = (0..d).map(|i| covariance[i][i]).sum();
    let floor = trace * 1e-10;

    let mut axes: Vec<Vec<f64>> = Vec::with_capacity(dims);
    for _ in 0..dims.min(d) {
        let (eigenvalue, axis) = dominant_eigenvector(&covariance, &axes, floor);
        for i in 0..d {
            for j in 0..d {
                covariance[i][j] -= eigenvalue * axis[i] * axis[j];
            }
        }
        axes.push(axis);
    }

    Ok(embeddings
        .iter()
        .zip(&centered)
        .map(|(e, row)| {
            let mut coordinates: Vec<f64> = axes.iter().map(|axis| dot(row, axis)).collect();
            coordinates.resize(dims, 0.0);
            ProjectedPoint {
                instance_id: e.instance_id.clone(),
                coordinates,
            }
        })
        .collect())
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn orthogonalize(v: &mut [f64], axes: &[Vec<f64>]) {
    for axis in axes {
        let overlap = dot(v, axis);
        v.iter_mut().zip(axis).for_each(|(x, a)| *x -= overlap * a);
    }
}

fn normalize(v: &mut [f64]) -> f64 {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    norm
}

fn dominant_eigenvector(matrix: &[Vec<f64>], previous: &[Vec<f64>], floor: f64) -> (f64, Vec<f64>) {
    let d = matrix.len();
    // Uneven start so no axis is orthogonal to it by construction.
    let mut v: Vec<f64> = (0..d).map(|i| 1.0 + i as f64).collect();
    orthogonalize(&mut v, previous);
    normalize(&mut v);

    let mut eigenvalue = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let mut next: Vec<f64> = matrix.iter().map(|row| dot(row, &v)).collect();
        orthogonalize(&mut next, previous);
        let norm = normalize(&mut next);
        if norm <= floor {
            return (0.0, vec![0.0; d]);
        }
        let delta: f64 = next.iter().zip(&v).map(|(a, b)| (a - b).abs()).sum();
        v = next;
        eigenvalue = norm;
        if delta < CONVERGENCE {
            break;
        }
    }

    let pivot = v
        .iter()
        .cloned()
        .fold(0.0_f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
    if pivot < 0.0 {
        v.iter_mut().for_each(|x| *x = -*x);
    }
    (eigenvalue, v)
}

/// Write projected points as CSV: `instance_id,pc1,pc2[,pc3],selected`.
pub fn write_projection_csv(
    path: &Path,
    points: &[ProjectedPoint],
    selected: Option<&InstanceSubset>,
) -> CsResult<()> {
    let dims = points.first().map(|p| p.coordinates.len()).unwrap_or(2);
    let mut writer = csv::Writer::from_path(path).map_err(std::io::Error::from)?;

    let mut header = vec!["instance_id".to_string()];
    header.extend((1..=dims).map(|i| format!("pc{i}")));
    header.push("selected".to_string());
    writer.write_record(&header).map_err(std::io::Error::from)?;

    for point in points {
        let mut record = vec![point.instance_id.to_string()];
        record.extend(point.coordinates.iter().map(|c| c.to_string()));
        let is_selected = selected.map(|s| s.contains(&point.instance_id)).unwrap_or(false);
        record.push(is_selected.to_string());
        writer.write_record(&record).map_err(std::io::Error::from)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line() -> Vec<Embedding> {
        (0..6)
            .map(|i| {
                let t = i as f64;
                Embedding::new(InstanceId::new(format!("e{i}")), vec![t, 2.0 * t, 0.0])
            })
            .collect()
    }

    #[test]
    fn first_component_captures_a_line() {
        let points = project(&line(), 2).unwrap();
        assert_eq!(points.len(), 6);
        for (i, p) in points.iter().enumerate() {
            let expected = (i as f64 - 2.5) * 5.0_f64.sqrt();
            assert!((p.coordinates[0] - expected).abs() < 1e-6);
            assert!(p.coordinates[1].abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_unsupported_dimension() {
        assert!(project(&line(), 4).is_err());
    }

    #[test]
    fn csv_marks_selected_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projection.csv");
        let points = project(&line(), 3).unwrap();
        let subset = InstanceSubset::new(vec![InstanceId::new("e0")]).unwrap();
        write_projection_csv(&path, &points, Some(&subset)).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["instance_id", "pc1", "pc2", "pc3", "selected"]
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 6);
        assert_eq!(&rows[0][4], "true");
        assert_eq!(&rows[1][4], "false");
    }
}
