use serde::{Deserialize, Serialize};
use std::fmt;

/// How similarity between two vectors is scored.
///
/// Both metrics produce scores where larger means closer, so search results
/// are always ordered by descending score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Cosine similarity in `[-1, 1]`. Vectors are normalised on insert, so
    /// scoring is an inner product.
    #[default]
    Cosine,
    /// Inverse Euclidean distance, `1 / (1 + d)`, in `(0, 1]`.
    Euclidean,
}

impl Metric {
    /// Transform a vector into its stored form.
    pub(crate) fn prepare(self, vector: &[f32]) -> Vec<f32> {
        match self {
            Self::Cosine => normalize(vector),
            Self::Euclidean => vector.to_vec(),
        }
    }

    /// Score a prepared stored vector against a prepared query.
    pub(crate) fn score(self, stored: &[f32], query: &[f32]) -> f32 {
        match self {
            Self::Cosine => dot(stored, query),
            Self::Euclidean => {
                let distance = stored
                    .iter()
                    .zip(query)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + distance)
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cosine => f.write_str("cosine"),
            Self::Euclidean => f.write_str("euclidean"),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scale to unit length. The zero vector stays zero and scores 0 against
/// everything.
///
/// Components are first divided by the largest magnitude so the squared
/// norm can neither overflow nor underflow.
fn normalize(vector: &[f32]) -> Vec<f32> {
    let largest = vector.iter().fold(0.0_f32, |m, x| m.max(x.abs()));
    if largest == 0.0 {
        return vector.to_vec();
    }
    let scaled: Vec<f32> = vector.iter().map(|x| x / largest).collect();
    let norm = dot(&scaled, &scaled).sqrt();
    scaled.into_iter().map(|x| x / norm).collect()
}
