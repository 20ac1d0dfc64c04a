//! Monte Carlo guess-number estimation ("delamico random walk")
//!
//! The guess number of a password with probability `p` is `N(p) = |{s : P(s) ≥ p}|`.
//! Enumerating everything above `p` is infeasible for strong passwords, so `N(p)`
//! is estimated by importance sampling:
//!
//! ```text
//! s_1 .. s_n   ancestral samples from the (re-leveled) model, P(s_i) = p_i
//! c_i        = 1/p_i  if p_i ≥ p, else 0
//! N̂(p)       = (1/n) Σ c_i                       E[c_i] = Σ_{P(s) ≥ p} P(s)/P(s) = N(p)
//! ```
//!
//! The walks are drawn once and stored in a [`WalkTable`] sorted by probability,
//! with running log-sums of `1/p_i` and `1/p_i²`; each test password is then one
//! binary search.
//!
//! When the alphabet is reduced, every sampled working symbol is also expanded to
//! an original character drawn from its corpus share, so walks and targets live in
//! the same (original) string space.

use crate::alphabet::{AlphabetReducer, Symbol};
use crate::oracle::{Oracle, OracleAdapter};
use crate::{ALICEGuessError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Log-space tolerance when comparing a walk against a target
pub const TIE_TOLERANCE: f64 = 1e-9;

/// z-score of a two-sided 95% interval
const Z_95: f64 = 1.96;

/// Rank written for targets without an estimate
pub const RANK_SENTINEL: i64 = -1;

/// Estimated guess number of one target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuessNumberEstimate {
    pub estimate: f64,
    pub std_error: f64,
    /// Walks drawn (n), including truncated ones
    pub walks: usize,
    /// Half-width of the 95% confidence interval
    pub ci95: f64,
    /// Walks at least as probable as the target
    pub contributing: usize,
}

/// Why a target got the rank sentinel instead of an estimate
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum TargetFailure {
    #[error("no sampled walk is as probable as the target")]
    Divergent,

    #[error("model assigns zero probability")]
    ZeroProbability,

    #[error("character {0:?} is not in the character bag")]
    UnknownSymbol(char),

    #[error("length {0} outside the guessing range")]
    LengthOutOfRange(usize),
}

/// Result for one test password
#[derive(Debug, Clone, PartialEq)]
pub struct TargetOutcome {
    pub password: String,
    /// Natural log of the model probability, `-inf` when unknown
    pub log_prob: f64,
    pub result: std::result::Result<GuessNumberEstimate, TargetFailure>,
}

impl TargetOutcome {
    pub fn probability(&self) -> f64 {
        self.log_prob.exp()
    }

    fn failed(password: &str, failure: TargetFailure) -> Self {
        Self {
            password: password.to_string(),
            log_prob: f64::NEG_INFINITY,
            result: Err(failure),
        }
    }
}

#[inline]
fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Completed walks sorted by probability with log-space prefix sums
#[derive(Debug, Clone, PartialEq)]
pub struct WalkTable {
    /// Descending
    log_probs: Vec<f64>,
    /// `ln Σ_{j ≤ i} 1/p_j`
    log_inv: Vec<f64>,
    /// `ln Σ_{j ≤ i} 1/p_j²`
    log_inv_sq: Vec<f64>,
    walks: usize,
}

impl WalkTable {
    /// Build from the log-probabilities of completed walks out of `walks` drawn
    pub fn from_log_probs(mut completed: Vec<f64>, walks: usize) -> Self {
        completed.retain(|lp| lp.is_finite());
        completed.sort_by(|a, b| b.total_cmp(a));

        let mut log_inv = Vec::with_capacity(completed.len());
        let mut log_inv_sq = Vec::with_capacity(completed.len());
        let (mut acc, mut acc_sq) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &lp in &completed {
            acc = log_add_exp(acc, -lp);
            acc_sq = log_add_exp(acc_sq, -2.0 * lp);
            log_inv.push(acc);
            log_inv_sq.push(acc_sq);
        }

        Self {
            log_probs: completed,
            log_inv,
            log_inv_sq,
            walks: walks.max(1),
        }
    }

    pub fn walks(&self) -> usize {
        self.walks
    }

    /// Walks that ended inside the length range
    pub fn completed(&self) -> usize {
        self.log_probs.len()
    }

    /// Estimate `N(p)` for `ln p = target_log_prob`
    pub fn estimate(
        &self,
        target_log_prob: f64,
    ) -> std::result::Result<GuessNumberEstimate, TargetFailure> {
        if target_log_prob == f64::NEG_INFINITY {
            return Err(TargetFailure::ZeroProbability);
        }

        let k = self
            .log_probs
            .partition_point(|&lp| lp >= target_log_prob - TIE_TOLERANCE);
        if k == 0 {
            return Err(TargetFailure::Divergent);
        }

        let n = self.walks as f64;
        let log_mean = self.log_inv[k - 1] - n.ln();
        let log_second = self.log_inv_sq[k - 1] - n.ln();
        let estimate = log_mean.exp();

        // Var = E[c²] (1 - E[c]² / E[c²]), kept in log space until the end
        let spread = -(2.0 * log_mean - log_second).exp_m1();
        let std_error = if self.walks > 1 && spread > 0.0 {
            let log_var = log_second + spread.ln() + (n / (n - 1.0)).ln();
            (0.5 * (log_var - n.ln())).exp()
        } else {
            0.0
        };

        Ok(GuessNumberEstimate {
            estimate,
            std_error,
            walks: self.walks,
            ci95: Z_95 * std_error,
            contributing: k,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkState {
    Running,
    Complete,
    Dead,
}

struct Walk {
    prefix: Vec<Symbol>,
    log_prob: f64,
    state: WalkState,
}

impl Walk {
    fn new() -> Self {
        Self {
            prefix: Vec::new(),
            log_prob: 0.0,
            state: WalkState::Running,
        }
    }
}

/// Index drawn from unnormalized weights, `None` when all are zero
fn draw_index<I>(weights: I, u: f64) -> Option<usize>
where
    I: Iterator<Item = f64> + Clone,
{
    let total: f64 = weights.clone().sum();
    if total <= 0.0 {
        return None;
    }
    let target = u * total;
    let mut acc = 0.0;
    let mut last = None;
    for (i, w) in weights.enumerate() {
        if w <= 0.0 {
            continue;
        }
        acc += w;
        last = Some(i);
        if target < acc {
            return Some(i);
        }
    }
    last
}

/// Samples walks from an oracle and scores test passwords against them
pub struct RandomWalkEstimator<'a, O: Oracle + ?Sized> {
    adapter: &'a OracleAdapter<'a, O>,
    reducer: &'a AlphabetReducer,
    seeds: usize,
    max_depth: usize,
    rng_seed: u64,
    parallel: bool,
}

impl<'a, O: Oracle + ?Sized> RandomWalkEstimator<'a, O> {
    pub fn new(
        adapter: &'a OracleAdapter<'a, O>,
        reducer: &'a AlphabetReducer,
        seeds: usize,
        max_depth: usize,
    ) -> Self {
        Self {
            adapter,
            reducer,
            seeds,
            max_depth,
            rng_seed: 0,
            parallel: false,
        }
    }

    pub fn with_rng_seed(mut self, rng_seed: u64) -> Self {
        self.rng_seed = rng_seed;
        self
    }

    /// Spread walk batches over the rayon pool
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Draw `seeds` walks.
    ///
    /// Batch `k` uses its own RNG seeded with `rng_seed + k`, so the table does not
    /// depend on scheduling.
    pub fn sample(&self, cancel: &AtomicBool) -> Result<WalkTable> {
        let batch = self.adapter.settings().max_batch;
        let batches: Vec<(usize, usize)> = (0..self.seeds.div_ceil(batch))
            .map(|k| (k, batch.min(self.seeds - k * batch)))
            .collect();

        log::info!(
            "Sampling {} random walks in {} batches (max depth {})",
            self.seeds,
            batches.len(),
            self.max_depth
        );

        let run = |&(k, size): &(usize, usize)| -> Result<Vec<f64>> {
            if cancel.load(Ordering::Relaxed) {
                return Err(ALICEGuessError::Cancelled);
            }
            self.walk_batch(k, size)
        };
        let results: Vec<Vec<f64>> = if self.parallel {
            batches.par_iter().map(run).collect::<Result<_>>()?
        } else {
            batches.iter().map(run).collect::<Result<_>>()?
        };

        let completed: Vec<f64> = results.into_iter().flatten().collect();
        let table = WalkTable::from_log_probs(completed, self.seeds);
        if table.completed() < self.seeds {
            log::warn!(
                "{} of {} walks were truncated or left the length range",
                self.seeds - table.completed(),
                self.seeds
            );
        }
        Ok(table)
    }

    /// Log-probabilities of the completed walks of batch `k`
    fn walk_batch(&self, k: usize, size: usize) -> Result<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(self.rng_seed.wrapping_add(k as u64));
        let mut walks: Vec<Walk> = (0..size).map(|_| Walk::new()).collect();

        for _ in 0..self.max_depth {
            let active: Vec<usize> = (0..walks.len())
                .filter(|&i| walks[i].state == WalkState::Running)
                .collect();
            if active.is_empty() {
                break;
            }

            let prefixes: Vec<&[Symbol]> =
                active.iter().map(|&i| walks[i].prefix.as_slice()).collect();
            let dists = self.adapter.predict(&prefixes)?;

            for (&i, dist) in active.iter().zip(dists.iter()) {
                self.step(&mut walks[i], dist, &mut rng);
            }
        }

        log::debug!(
            "Walk batch {}: {} of {} completed",
            k,
            walks.iter().filter(|w| w.state == WalkState::Complete).count(),
            size
        );

        Ok(walks
            .into_iter()
            .filter(|w| w.state == WalkState::Complete)
            .map(|w| w.log_prob)
            .collect())
    }

    fn step(&self, walk: &mut Walk, dist: &[f64], rng: &mut StdRng) {
        let Some(symbol) = draw_index(dist.iter().copied(), rng.random::<f64>()) else {
            walk.state = WalkState::Dead;
            return;
        };
        walk.log_prob += dist[symbol].ln();

        if symbol == self.adapter.end_symbol() as usize {
            walk.state = if self.adapter.length_in_range(walk.prefix.len()) {
                WalkState::Complete
            } else {
                WalkState::Dead
            };
            return;
        }

        let symbol = symbol as Symbol;
        let expansions = self.reducer.expansions(symbol);
        if expansions.len() > 1 {
            let shares = expansions.iter().map(|&(_, share)| share.exp());
            if let Some(j) = draw_index(shares, rng.random::<f64>()) {
                walk.log_prob += expansions[j].1;
            }
        }
        walk.prefix.push(symbol);
    }

    /// Model probability and guess-number estimate for each password
    pub fn estimate_targets(
        &self,
        table: &WalkTable,
        passwords: &[String],
    ) -> Result<Vec<TargetOutcome>> {
        let scored = score_passwords(self.adapter, self.reducer, passwords)?;

        let mut outcomes = Vec::with_capacity(passwords.len());
        for (password, scored) in passwords.iter().zip(scored) {
            let outcome = match scored {
                Err(failure) => TargetOutcome::failed(password, failure),
                Ok(log_prob) => TargetOutcome {
                    password: password.clone(),
                    log_prob,
                    result: table.estimate(log_prob),
                },
            };
            if let Err(failure) = &outcome.result {
                log::warn!("No guess number for {:?}: {}", password, failure);
            }
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}

/// Reduced symbols (oracle order) and summed expansion log-share of a password
fn reduce_target<O: Oracle + ?Sized>(
    adapter: &OracleAdapter<'_, O>,
    reducer: &AlphabetReducer,
    password: &str,
) -> std::result::Result<(Vec<Symbol>, f64), TargetFailure> {
    let len = password.chars().count();
    if !adapter.length_in_range(len) {
        return Err(TargetFailure::LengthOutOfRange(len));
    }

    let mut symbols = Vec::with_capacity(len);
    let mut log_share = 0.0;
    for c in password.chars() {
        let reduced = reducer
            .reduce(c)
            .map_err(|_| TargetFailure::UnknownSymbol(c))?;
        log_share += reducer
            .expansions(reduced.symbol)
            .iter()
            .find(|&&(orig, _)| orig == c)
            .map_or(0.0, |&(_, share)| share);
        symbols.push(reduced.symbol);
    }

    Ok((adapter.to_oracle_order(symbols), log_share))
}

/// Natural-log model probability of each password in the original alphabet.
///
/// Passwords the model cannot score get a [`TargetFailure`]; oracle faults abort.
pub fn score_passwords<O: Oracle + ?Sized>(
    adapter: &OracleAdapter<'_, O>,
    reducer: &AlphabetReducer,
    passwords: &[String],
) -> Result<Vec<std::result::Result<f64, TargetFailure>>> {
    let reduced: Vec<_> = passwords
        .iter()
        .map(|p| reduce_target(adapter, reducer, p))
        .collect();

    let scorable: Vec<Vec<Symbol>> = reduced
        .iter()
        .filter_map(|r| r.as_ref().ok().map(|(symbols, _)| symbols.clone()))
        .collect();
    let mut model_log_probs = adapter.log_probs(&scorable)?.into_iter();

    Ok(reduced
        .into_iter()
        .map(|r| {
            let (_, log_share) = r?;
            let log_prob = model_log_probs.next().unwrap_or(f64::NEG_INFINITY) + log_share;
            if log_prob == f64::NEG_INFINITY {
                Err(TargetFailure::ZeroProbability)
            } else {
                Ok(log_prob)
            }
        })
        .collect())
}
