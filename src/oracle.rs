//! Next-symbol oracle interface for ALICE-Guess
//!
//! The trained sequence model is consumed only through [`Oracle`]: given a batch of
//! fixed-length context windows it returns one probability distribution per window
//! over the working alphabet plus end-of-string.
//!
//! [`OracleAdapter`] sits between the model and the search code:
//! - builds left-padded context windows from prefixes
//! - slices requests into batches of at most `max_gpu_prediction_size`
//! - rejects distributions whose mass is off by more than [`MASS_TOLERANCE`]
//! - re-levels distributions so only lengths in `[min_len, max_len]` can end
//! - handles models trained on reversed passwords

use crate::alphabet::{AlphabetReducer, Symbol, PAD_SYMBOL};
use crate::{ALICEGuessError, Result};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

/// Probability vector over the working alphabet, end-of-string last
pub type Distribution = Vec<f64>;

/// Largest accepted deviation of a distribution's total mass from 1
pub const MASS_TOLERANCE: f64 = 1e-5;

/// Last `context_length` symbols of a prefix, left-padded with [`PAD_SYMBOL`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextWindow {
    symbols: SmallVec<[Symbol; 16]>,
}

impl ContextWindow {
    pub fn from_prefix(prefix: &[Symbol], context_length: usize) -> Self {
        let mut symbols = SmallVec::with_capacity(context_length);
        let take = prefix.len().min(context_length);
        symbols.extend(std::iter::repeat(PAD_SYMBOL).take(context_length - take));
        symbols.extend_from_slice(&prefix[prefix.len() - take..]);
        Self { symbols }
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Symbols without the padding
    pub fn unpadded(&self) -> &[Symbol] {
        let start = self
            .symbols
            .iter()
            .position(|&s| s != PAD_SYMBOL)
            .unwrap_or(self.symbols.len());
        &self.symbols[start..]
    }
}

/// A trained next-symbol model.
///
/// Implementations must be safe to share across guessing workers; weights are
/// read-only while guessing.
pub trait Oracle: Send + Sync {
    /// Number of working-alphabet characters, excluding end-of-string
    fn alphabet_size(&self) -> usize;

    /// Length of the context windows the model expects
    fn context_length(&self) -> usize;

    /// One distribution of length `alphabet_size() + 1` per context
    fn predict(&self, contexts: &[ContextWindow]) -> Result<Vec<Distribution>>;
}

/// Context-independent oracle: every window gets the same distribution
#[derive(Debug, Clone)]
pub struct StaticOracle {
    distribution: Distribution,
    context_length: usize,
}

impl StaticOracle {
    pub fn new(distribution: Distribution, context_length: usize) -> Self {
        Self {
            distribution,
            context_length,
        }
    }
}

impl Oracle for StaticOracle {
    fn alphabet_size(&self) -> usize {
        self.distribution.len().saturating_sub(1)
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn predict(&self, contexts: &[ContextWindow]) -> Result<Vec<Distribution>> {
        Ok(vec![self.distribution.clone(); contexts.len()])
    }
}

/// Oracle backed by a closure over the unpadded context
pub struct FnOracle<F> {
    alphabet_size: usize,
    context_length: usize,
    predict_fn: F,
}

impl<F> FnOracle<F>
where
    F: Fn(&[Symbol]) -> Distribution + Send + Sync,
{
    pub fn new(alphabet_size: usize, context_length: usize, predict_fn: F) -> Self {
        Self {
            alphabet_size,
            context_length,
            predict_fn,
        }
    }
}

impl<F> Oracle for FnOracle<F>
where
    F: Fn(&[Symbol]) -> Distribution + Send + Sync,
{
    fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn predict(&self, contexts: &[ContextWindow]) -> Result<Vec<Distribution>> {
        Ok(contexts
            .iter()
            .map(|ctx| (self.predict_fn)(ctx.unpadded()))
            .collect())
    }
}

/// Adapter switches, usually taken from the guessing configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdapterSettings {
    pub min_len: usize,
    pub max_len: usize,
    pub max_batch: usize,
    pub relevel: bool,
    pub backwards: bool,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            min_len: 4,
            max_len: 40,
            max_batch: 1024,
            relevel: true,
            backwards: false,
        }
    }
}

/// Validating, batching front end to an [`Oracle`]
pub struct OracleAdapter<'a, O: Oracle + ?Sized> {
    oracle: &'a O,
    settings: AdapterSettings,
    end: Symbol,
    distribution_len: usize,
    context_length: usize,
    oracle_calls: AtomicU64,
    predictions: AtomicU64,
}

impl<'a, O: Oracle + ?Sized> OracleAdapter<'a, O> {
    /// Wrap `oracle`, checking that it predicts over the reducer's alphabet
    pub fn new(oracle: &'a O, reducer: &AlphabetReducer, settings: AdapterSettings) -> Result<Self> {
        let alphabet = reducer.alphabet();
        if oracle.alphabet_size() != alphabet.len() {
            return Err(ALICEGuessError::AlphabetMismatch {
                reducer: alphabet.len(),
                oracle: oracle.alphabet_size(),
            });
        }
        if settings.max_batch == 0 {
            return Err(ALICEGuessError::Config(
                "max_gpu_prediction_size must be positive".to_string(),
            ));
        }

        Ok(Self {
            oracle,
            settings,
            end: alphabet.end_symbol(),
            distribution_len: alphabet.distribution_len(),
            context_length: oracle.context_length(),
            oracle_calls: AtomicU64::new(0),
            predictions: AtomicU64::new(0),
        })
    }

    /// Next-symbol distributions for a batch of prefixes (oracle order)
    pub fn predict(&self, prefixes: &[&[Symbol]]) -> Result<Vec<Distribution>> {
        let mut out = Vec::with_capacity(prefixes.len());

        for batch in prefixes.chunks(self.settings.max_batch) {
            let contexts: Vec<ContextWindow> = batch
                .iter()
                .map(|p| ContextWindow::from_prefix(p, self.context_length))
                .collect();

            let predicted = self.oracle.predict(&contexts)?;
            self.oracle_calls.fetch_add(1, Ordering::Relaxed);
            self.predictions.fetch_add(batch.len() as u64, Ordering::Relaxed);

            if predicted.len() != batch.len() {
                return Err(ALICEGuessError::OracleFault {
                    index: predicted.len().min(batch.len()),
                    sum: f64::NAN,
                });
            }

            let base = out.len();
            for (i, (mut dist, prefix)) in predicted.into_iter().zip(batch.iter()).enumerate() {
                self.validate(&dist, base + i)?;
                if self.settings.relevel {
                    self.relevel(&mut dist, prefix.len());
                }
                out.push(dist);
            }
        }

        Ok(out)
    }

    /// Log-probability of complete strings (oracle order, end-of-string implied)
    ///
    /// Strings are scored step by step so every oracle batch mixes all targets.
    pub fn log_probs(&self, sequences: &[Vec<Symbol>]) -> Result<Vec<f64>> {
        let mut log_probs = vec![0.0f64; sequences.len()];
        let longest = sequences.iter().map(Vec::len).max().unwrap_or(0);

        for step in 0..=longest {
            let active: Vec<usize> = (0..sequences.len())
                .filter(|&i| sequences[i].len() >= step && log_probs[i].is_finite())
                .collect();
            if active.is_empty() {
                break;
            }

            let prefixes: Vec<&[Symbol]> = active.iter().map(|&i| &sequences[i][..step]).collect();
            let dists = self.predict(&prefixes)?;

            for (&i, dist) in active.iter().zip(dists.iter()) {
                let next = sequences[i].get(step).copied().unwrap_or(self.end);
                log_probs[i] += dist[next as usize].ln();
            }
        }

        Ok(log_probs)
    }

    fn validate(&self, dist: &Distribution, index: usize) -> Result<()> {
        if dist.len() != self.distribution_len {
            return Err(ALICEGuessError::AlphabetMismatch {
                reducer: self.distribution_len - 1,
                oracle: dist.len().saturating_sub(1),
            });
        }

        let sum: f64 = dist.iter().sum();
        let malformed = dist.iter().any(|p| !p.is_finite() || *p < 0.0);
        if malformed || (sum - 1.0).abs() > MASS_TOLERANCE {
            return Err(ALICEGuessError::OracleFault { index, sum });
        }

        Ok(())
    }

    /// Only lengths in `[min_len, max_len]` may end; nothing may grow past `max_len`
    fn relevel(&self, dist: &mut Distribution, prefix_len: usize) {
        let end = self.end as usize;

        if prefix_len >= self.settings.max_len {
            dist.iter_mut().for_each(|p| *p = 0.0);
            dist[end] = 1.0;
            return;
        }
        if prefix_len < self.settings.min_len {
            dist[end] = 0.0;
        }

        let sum: f64 = dist.iter().sum();
        if sum > 0.0 {
            dist.iter_mut().for_each(|p| *p /= sum);
        }
    }

    /// Generated (oracle-order) symbols into output order
    pub fn to_output_order(&self, mut seq: Vec<Symbol>) -> Vec<Symbol> {
        if self.settings.backwards {
            seq.reverse();
        }
        seq
    }

    /// Output-order symbols into the order the oracle was trained on
    pub fn to_oracle_order(&self, seq: Vec<Symbol>) -> Vec<Symbol> {
        self.to_output_order(seq)
    }

    pub fn end_symbol(&self) -> Symbol {
        self.end
    }

    pub fn distribution_len(&self) -> usize {
        self.distribution_len
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    /// Does a string of this length fall inside `[min_len, max_len]`?
    pub fn length_in_range(&self, len: usize) -> bool {
        len >= self.settings.min_len && len <= self.settings.max_len
    }

    /// (oracle batches, individual predictions) served so far
    pub fn usage(&self) -> (u64, u64) {
        (
            self.oracle_calls.load(Ordering::Relaxed),
            self.predictions.load(Ordering::Relaxed),
        )
    }
}
