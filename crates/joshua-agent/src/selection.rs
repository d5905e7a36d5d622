//! Weighted random ensemble selection.
//!
//! Each eligible candidate is chosen with probability proportional to
//! its effective priority. Candidates with non-positive weight are
//! ineligible; when every weight is equal the choice is uniform, and the
//! cumulative scan walks candidates in natural id order so tests with a
//! seeded generator are deterministic.

use joshua_model::EnsembleId;
use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub id: EnsembleId,
    pub weight: i64,
}

pub fn choose_weighted<R: Rng>(rng: &mut R, candidates: &[Candidate]) -> Option<EnsembleId> {
    let mut eligible: Vec<Candidate> = candidates
        .iter()
        .copied()
        .filter(|candidate| candidate.weight > 0)
        .collect();
    if eligible.is_empty() {
        return None;
    }
    eligible.sort_by_key(|candidate| candidate.id);

    let total: u64 = eligible.iter().map(|c| c.weight as u64).sum();
    let mut pick = rng.gen_range(0..total);
    for candidate in &eligible {
        let weight = candidate.weight as u64;
        if pick < weight {
            return Some(candidate.id);
        }
        pick -= weight;
    }
    unreachable!("cumulative weights cover the sampled range")
}
