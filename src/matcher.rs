use serde::{Deserialize, Serialize};

/// Threshold applied when neither the request nor the config supplies one.
pub const DEFAULT_THRESHOLD: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatchError {
    #[error("new_embedding is empty")]
    EmptyQuery,

    #[error("existing_embeddings[{index}] has {found} dimensions, new_embedding has {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("{field} contains a non-finite value")]
    NonFinite { field: String },
}

/// Body of a compare request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompareRequest {
    pub new_embedding: Vec<f64>,
    pub existing_embeddings: Vec<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl CompareRequest {
    pub fn evaluate(&self, default_threshold: f64) -> Result<MatchResult, MatchError> {
        find_best_match(
            &self.new_embedding,
            &self.existing_embeddings,
            self.threshold.unwrap_or(default_threshold),
        )
    }
}

/// Outcome of a nearest-match lookup.
///
/// An empty candidate list yields `best_index == -1` and an infinite score.
/// JSON has no infinity, so that score serializes as `null` rather than the
/// non-standard `Infinity` token some encoders emit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchResult {
    #[serde(rename = "match")]
    pub matched: bool,
    pub best_score: f64,
    #[serde(rename = "best_idx")]
    pub best_index: i64,
}

pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x - y;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

fn check_finite(v: &[f64], field: impl FnOnce() -> String) -> Result<(), MatchError> {
    if v.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(MatchError::NonFinite { field: field() })
    }
}

/// Linear scan for the candidate closest to `query`.
///
/// Only a strictly smaller distance replaces the current best, so ties keep
/// the earliest candidate. `matched` is `best_score < threshold`.
pub fn find_best_match(
    query: &[f64],
    candidates: &[Vec<f64>],
    threshold: f64,
) -> Result<MatchResult, MatchError> {
    if query.is_empty() {
        return Err(MatchError::EmptyQuery);
    }
    check_finite(query, || "new_embedding".to_string())?;

    let mut best_score = f64::INFINITY;
    let mut best_index = -1i64;

    for (index, candidate) in candidates.iter().enumerate() {
        if candidate.len() != query.len() {
            return Err(MatchError::DimensionMismatch {
                index,
                expected: query.len(),
                found: candidate.len(),
            });
        }
        check_finite(candidate, || format!("existing_embeddings[{index}]"))?;

        let dist = euclidean_distance(query, candidate);
        if dist < best_score {
            best_score = dist;
            best_index = index as i64;
        }
    }

    Ok(MatchResult {
        matched: best_score < threshold,
        best_score,
        best_index,
    })
}
