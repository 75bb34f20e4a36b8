//! Exploration engine: turns per-action scores into a probability distribution and samples an
//! action from it deterministically.
//!
//! All generators write into a caller-provided `pdf` slice. When a generator takes a parallel
//! `scores` input of a different length, both are truncated to the shorter of the two and the
//! remaining pdf slots are zeroed.
use crate::{prng, Error, Result};

/// Fill `pdf` with an epsilon-greedy distribution over `pdf.len()` actions.
///
/// Every action receives `epsilon / n`; `top_action` (clamped to `n - 1` if out of range)
/// additionally receives `1 - epsilon`.
pub fn epsilon_greedy(epsilon: f64, top_action: usize, pdf: &mut [f64]) -> Result<()> {
    if pdf.is_empty() {
        return Err(Error::BadRange("pdf must not be empty"));
    }
    if !(0.0..=1.0).contains(&epsilon) {
        return Err(Error::BadRange("epsilon must be within [0, 1]"));
    }

    let n = pdf.len();
    let top_action = top_action.min(n - 1);
    let explore = epsilon / n as f64;

    for p in pdf.iter_mut() {
        *p = explore;
    }
    pdf[top_action] += 1.0 - epsilon;

    Ok(())
}

/// Fill `pdf` with a softmax distribution over `scores`.
///
/// The maximum score is subtracted before exponentiating for numeric stability.
pub fn softmax(lambda: f64, scores: &[f64], pdf: &mut [f64]) -> Result<()> {
    if scores.is_empty() || pdf.is_empty() {
        return Err(Error::BadRange("scores and pdf must not be empty"));
    }

    let n = scores.len().min(pdf.len());
    let max_score = scores[..n]
        .iter()
        .fold(f64::NEG_INFINITY, |max, &score| max.max(score));

    let mut total = 0.0;
    for i in 0..n {
        let value = (lambda * (scores[i] - max_score)).exp();
        pdf[i] = value;
        total += value;
    }
    for p in &mut pdf[n..] {
        *p = 0.0;
    }

    if total > 0.0 {
        for p in &mut pdf[..n] {
            *p /= total;
        }
    }

    Ok(())
}

/// Fill `pdf` with each policy's share of `votes`.
///
/// Zero total votes produce a one-hot distribution on index 0 rather than NaN.
pub fn bag(votes: &[u32], pdf: &mut [f64]) -> Result<()> {
    if votes.is_empty() || pdf.is_empty() {
        return Err(Error::BadRange("votes and pdf must not be empty"));
    }

    let n = votes.len().min(pdf.len());
    let total: u32 = votes[..n].iter().sum();

    if total == 0 {
        pdf.fill(0.0);
        pdf[0] = 1.0;
        return Ok(());
    }

    for i in 0..n {
        pdf[i] = votes[i] as f64 / total as f64;
    }
    for p in &mut pdf[n..] {
        *p = 0.0;
    }

    Ok(())
}

/// Raise every entry of `pdf` to at least `min_uniform / support` while keeping the total at 1.
///
/// When `update_zero_elements` is false, zero entries are considered outside the support and are
/// left at zero. `min_uniform > 0.999` short-circuits to a fully uniform distribution over the
/// support.
pub fn enforce_minimum_probability(
    min_uniform: f64,
    update_zero_elements: bool,
    pdf: &mut [f64],
) -> Result<()> {
    if pdf.is_empty() {
        return Err(Error::BadRange("pdf must not be empty"));
    }
    if !(0.0..=1.0).contains(&min_uniform) {
        return Err(Error::BadRange("min_uniform must be within [0, 1]"));
    }

    let support = if update_zero_elements {
        pdf.len()
    } else {
        pdf.iter().filter(|&&p| p > 0.0).count()
    };
    if support == 0 {
        // Empty support with update_zero_elements=false. Nothing to raise.
        return Ok(());
    }

    if min_uniform > 0.999 {
        let uniform = 1.0 / support as f64;
        for p in pdf.iter_mut() {
            if update_zero_elements || *p > 0.0 {
                *p = uniform;
            }
        }
        return Ok(());
    }

    let minimum = min_uniform / support as f64;

    let mut touched_mass = 0.0;
    let mut untouched_mass = 0.0;
    let mut touched_count = 0usize;
    for p in pdf.iter_mut() {
        let in_support = *p > 0.0 || (update_zero_elements && *p == 0.0);
        if in_support && *p <= minimum {
            touched_mass += minimum;
            touched_count += 1;
            *p = minimum;
        } else {
            untouched_mass += *p;
        }
    }

    if touched_mass > 0.0 {
        if touched_mass > 0.999 {
            // The floor consumed almost all mass. Recompute it over just the touched entries so
            // they absorb exactly the mass the untouched entries leave behind.
            let floor = (1.0 - untouched_mass) / touched_count as f64;
            for p in pdf.iter_mut() {
                let in_support = *p > 0.0 || (update_zero_elements && *p == 0.0);
                if in_support && *p <= minimum {
                    *p = floor;
                }
            }
        } else if untouched_mass > 0.0 {
            let ratio = (1.0 - touched_mass) / untouched_mass;
            for p in pdf.iter_mut() {
                if *p > minimum {
                    *p *= ratio;
                }
            }
        }
    }

    Ok(())
}

/// Sample an index from `pdf`, normalizing on the fly.
///
/// Negative entries are treated as zero. A pdf with zero total mass deterministically yields
/// index 0. The draw is seeded, so identical `(seed, pdf)` inputs always produce the same index,
/// across calls and across processes.
pub fn sample_after_normalizing(seed: u64, pdf: &[f64]) -> Result<usize> {
    if pdf.is_empty() {
        return Err(Error::BadRange("pdf must not be empty"));
    }

    let total: f64 = pdf.iter().map(|&p| p.max(0.0)).sum();
    if total == 0.0 {
        return Ok(0);
    }

    // Clamp the draw so floating rounding cannot push it past the cumulative total.
    let draw = (prng::uniform_draw(seed) * total).min(total);

    let mut sum = 0.0;
    for (index, &p) in pdf.iter().enumerate() {
        sum += p.max(0.0);
        if sum > draw {
            return Ok(index);
        }
    }

    Ok(pdf.len() - 1)
}

/// Sample an index from `pdf` and return a full ranking of candidate indices.
///
/// Indices are ordered by `scores` descending (stable), then the chosen index is swapped into
/// position 0. A single swap, not a re-sort, so the relative order of the remaining candidates is
/// preserved.
pub fn sample_ranking(seed: u64, pdf: &[f64], scores: &[f64]) -> Result<Vec<usize>> {
    if pdf.len() != scores.len() {
        return Err(Error::SizeMismatch {
            expected: pdf.len(),
            actual: scores.len(),
        });
    }

    let chosen = sample_after_normalizing(seed, pdf)?;

    let mut ranking: Vec<usize> = (0..pdf.len()).collect();
    ranking.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let position = ranking
        .iter()
        .position(|&index| index == chosen)
        .expect("sampled index is always present in the ranking");
    ranking.swap(0, position);

    Ok(ranking)
}
