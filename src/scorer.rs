use anyhow::Result;
use tracing::info;

use crate::error::RunError;
use crate::ir::ScoredMethod;

/// Minimum share of covered branches for a method to be a protection target.
const MIN_BRANCH_RATIO: f64 = 0.7;

/// Score of a candidate: covered instructions, or zero when filtered out.
pub(crate) fn score(method: &ScoredMethod) -> u64 {
    if method.method.is_initializer() {
        return 0;
    }
    let covered = method.branches_covered as f64;
    let total = covered + method.branches_missed as f64;
    // 0/0 is NaN, so branch-free methods score zero.
    let ratio = covered / total;
    if ratio.is_nan() || ratio < MIN_BRANCH_RATIO {
        return 0;
    }
    method.instructions_covered
}

/// The chosen protection target and its score.
#[derive(Clone, Debug)]
pub(crate) struct Selection {
    pub(crate) method: ScoredMethod,
    pub(crate) score: u64,
}

/// Pick the highest-scoring method; ties keep input order.
pub(crate) fn select_target(candidates: &[ScoredMethod]) -> Result<Selection> {
    let mut ranked: Vec<(u64, &ScoredMethod)> = candidates
        .iter()
        .map(|candidate| (score(candidate), candidate))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));
    let Some((best_score, best)) = ranked.first() else {
        return Err(RunError::InsufficientCoverage {
            method: "<none>".to_string(),
            score: 0,
        }
        .into());
    };
    if *best_score == 0 {
        return Err(RunError::InsufficientCoverage {
            method: best.method.to_string(),
            score: 0,
        }
        .into());
    }
    info!(method = %best.method, score = *best_score, "selected target method");
    Ok(Selection {
        method: (*best).clone(),
        score: *best_score,
    })
}
