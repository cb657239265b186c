use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::error::{Error, Result};

/// Sampling knobs for one generation session.
///
/// The default is the drivers' greedy configuration: `top_k == 1` makes every
/// draw a deterministic argmax.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 1,
            top_p: 1.0,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) {
            return Err(Error::InvalidParameter {
                reason: format!("temperature must be positive, got {}", self.temperature),
            });
        }
        if self.top_k == 0 {
            return Err(Error::InvalidParameter {
                reason: "top_k must be at least 1".to_string(),
            });
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidParameter {
                reason: format!("top_p must be in (0, 1], got {}", self.top_p),
            });
        }
        Ok(())
    }
}

/// Draws one token id from the filtered, renormalized distribution.
///
/// Filtering order is fixed: top-k truncation first, then nucleus (top-p)
/// filtering on the renormalized top-k set. `top_k == 1` short-circuits to
/// argmax, which equals what the full pipeline would produce.
pub fn sample(logits: &[f32], params: &SamplingParams, rng: &mut StdRng) -> Result<usize> {
    params.validate()?;
    if logits.is_empty() {
        return Err(Error::SamplingDegenerate);
    }
    if params.top_k == 1 {
        return Ok(argmax(logits));
    }

    let max = logits
        .iter()
        .map(|l| l / params.temperature)
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Err(Error::SamplingDegenerate);
    }

    let mut candidates: Vec<(usize, f32)> = logits
        .iter()
        .enumerate()
        .map(|(id, l)| (id, (l / params.temperature - max).exp()))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    candidates.truncate(params.top_k);

    let kept_mass: f32 = candidates.iter().map(|(_, w)| w).sum();
    if !kept_mass.is_finite() || kept_mass <= 0.0 {
        return Err(Error::SamplingDegenerate);
    }

    if params.top_p < 1.0 {
        // smallest prefix of the sorted candidates whose cumulative
        // (renormalized) mass reaches top_p
        let mut cumulative = 0.0;
        let mut keep = candidates.len();
        for (i, (_, weight)) in candidates.iter().enumerate() {
            cumulative += weight / kept_mass;
            if cumulative >= params.top_p {
                keep = i + 1;
                break;
            }
        }
        candidates.truncate(keep);
    }

    let weights: Vec<f32> = candidates.iter().map(|(_, w)| *w).collect();
    let distribution = WeightedIndex::new(&weights).map_err(|_| Error::SamplingDegenerate)?;
    Ok(candidates[distribution.sample(rng)].0)
}

fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (id, &logit) in logits.iter().enumerate() {
        if logit > logits[best] {
            best = id;
        }
    }
    best
}
