//! Guess output
//!
//! Records are tab-separated lines:
//!
//! ```text
//! enumeration:  guess  probability  rank
//! estimation:   guess  probability  estimate  std_error  walks  ci95
//! ```
//!
//! Reduced guesses are expanded back to the character bag right before writing.
//! An expansion is never more probable than its reduced guess, so expansions wait
//! in a pending heap until the next reduced guess is no more probable than they
//! are. The written file stays in descending probability order.
//!
//! Output is flushed every `chunk_size_guesser` records; a resumed run skips the
//! records an earlier run already flushed.

use crate::alphabet::{AlphabetReducer, Symbol};
use crate::enumerator::{order_key, GuessChunk, ReducedGuess};
use crate::random_walk::{GuessNumberEstimate, TargetOutcome, RANK_SENTINEL};
use crate::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::Write;

/// Probabilities below this print in exponent form
const EXPONENT_BELOW: f64 = 1e-4;

/// Counts above this print in exponent form
const EXPONENT_ABOVE: f64 = 1e15;

fn fmt_probability(p: f64) -> String {
    if p != 0.0 && p < EXPONENT_BELOW {
        format!("{:e}", p)
    } else {
        format!("{}", p)
    }
}

fn fmt_count(x: f64) -> String {
    if x >= EXPONENT_ABOVE {
        format!("{:.6e}", x)
    } else {
        format!("{:.2}", x)
    }
}

/// One enumerated guess
#[derive(Debug, Clone, PartialEq)]
pub struct GuessRecord {
    pub guess: String,
    pub probability: f64,
    /// 1-based position in the output stream
    pub rank: u64,
}

impl GuessRecord {
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\n",
            self.guess,
            fmt_probability(self.probability),
            self.rank
        )
    }
}

/// One test password with its estimated guess number
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateRecord {
    pub guess: String,
    pub probability: f64,
    /// `None` is written as the rank sentinel
    pub estimate: Option<GuessNumberEstimate>,
}

impl EstimateRecord {
    pub fn from_outcome(outcome: &TargetOutcome) -> Self {
        Self {
            guess: outcome.password.clone(),
            probability: outcome.probability(),
            estimate: outcome.result.ok(),
        }
    }

    pub fn to_line(&self) -> String {
        match &self.estimate {
            Some(est) => format!(
                "{}\t{}\t{}\t{}\t{}\t{}\n",
                self.guess,
                fmt_probability(self.probability),
                fmt_count(est.estimate),
                fmt_count(est.std_error),
                est.walks,
                fmt_count(est.ci95)
            ),
            None => format!(
                "{}\t{}\t{}\t0\t0\t0\n",
                self.guess,
                fmt_probability(self.probability),
                RANK_SENTINEL
            ),
        }
    }
}

/// Partial expansion: index into each position's expansion list
#[derive(Debug)]
struct ExpansionNode {
    picks: Vec<usize>,
    log_prob: f64,
    text: String,
}

impl PartialEq for ExpansionNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ExpansionNode {}

impl PartialOrd for ExpansionNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExpansionNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.log_prob
            .total_cmp(&other.log_prob)
            .then_with(|| other.text.cmp(&self.text))
    }
}

/// Expanded string waiting for its turn in the output
#[derive(Debug)]
struct PendingGuess {
    text: String,
    log_prob: f64,
    key: i64,
    /// Arrival order, breaks ties
    arrival: u64,
}

impl PartialEq for PendingGuess {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingGuess {}

impl PartialOrd for PendingGuess {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingGuess {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

/// Original-alphabet strings behind a reduced guess with log P ≥ `log_threshold`,
/// most probable first.
pub fn expand_guess(
    reducer: &AlphabetReducer,
    symbols: &[Symbol],
    log_prob: f64,
    log_threshold: f64,
) -> Vec<(String, f64)> {
    let options: Vec<&[(char, f64)]> = symbols.iter().map(|&s| reducer.expansions(s)).collect();
    if options.iter().any(|o| o.is_empty()) {
        return Vec::new();
    }

    let make = |picks: Vec<usize>| {
        let mut lp = log_prob;
        let mut text = String::with_capacity(picks.len());
        for (opts, &j) in options.iter().zip(&picks) {
            text.push(opts[j].0);
            lp += opts[j].1;
        }
        ExpansionNode {
            picks,
            log_prob: lp,
            text,
        }
    };

    let mut out = Vec::new();
    let mut heap = BinaryHeap::new();
    let first = make(vec![0; symbols.len()]);
    if first.log_prob >= log_threshold {
        heap.push(first);
    }

    while let Some(node) = heap.pop() {
        // Advance only at or after the last advanced position so each pick vector
        // is reached once
        let from = node.picks.iter().rposition(|&j| j > 0).unwrap_or(0);
        for pos in from..node.picks.len() {
            if node.picks[pos] + 1 < options[pos].len() {
                let mut picks = node.picks.clone();
                picks[pos] += 1;
                let child = make(picks);
                if child.log_prob >= log_threshold {
                    heap.push(child);
                }
            }
        }
        out.push((node.text, node.log_prob));
    }

    out
}

/// Chunked TSV writer for guesses and estimates
pub struct GuessSerializer<'a, W: Write> {
    out: W,
    reducer: &'a AlphabetReducer,
    log_threshold: f64,
    chunk_size: u64,
    print_interval: u64,
    records_written: u64,
    bytes_written: u64,
    chunks_flushed: u64,
    durable_records: u64,
    durable_bytes: u64,
    skip: u64,
    pending: BinaryHeap<PendingGuess>,
    arrivals: u64,
}

impl<'a, W: Write> GuessSerializer<'a, W> {
    pub fn new(
        out: W,
        reducer: &'a AlphabetReducer,
        threshold: f64,
        chunk_size: usize,
        print_interval: usize,
    ) -> Self {
        Self {
            out,
            reducer,
            log_threshold: threshold.ln(),
            chunk_size: chunk_size.max(1) as u64,
            print_interval: print_interval as u64,
            records_written: 0,
            bytes_written: 0,
            chunks_flushed: 0,
            durable_records: 0,
            durable_bytes: 0,
            skip: 0,
            pending: BinaryHeap::new(),
            arrivals: 0,
        }
    }

    /// Treat the first `records` records as already on disk
    pub fn resume_after(mut self, records: u64) -> Self {
        self.skip = records;
        self
    }

    /// Expand and write every guess of a chunk
    pub fn write_chunk(&mut self, chunk: &GuessChunk) -> Result<()> {
        for guess in &chunk.guesses {
            self.write_guess(guess)?;
        }
        Ok(())
    }

    /// Queue the expansions of a reduced guess.
    ///
    /// Reduced guesses must arrive in emission order. Everything queued earlier that
    /// is at least as probable as `guess` is written first.
    pub fn write_guess(&mut self, guess: &ReducedGuess) -> Result<()> {
        self.release(order_key(guess.log_prob))?;

        let expanded = expand_guess(
            self.reducer,
            &guess.symbols,
            guess.log_prob,
            self.log_threshold,
        );
        for (text, log_prob) in expanded {
            self.pending.push(PendingGuess {
                text,
                log_prob,
                key: order_key(log_prob),
                arrival: self.arrivals,
            });
            self.arrivals += 1;
        }
        Ok(())
    }

    /// Write every queued guess; call once the reduced stream has ended
    pub fn drain_pending(&mut self) -> Result<()> {
        self.release(i64::MIN)
    }

    /// Queued guesses not yet written
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn release(&mut self, floor: i64) -> Result<()> {
        while self.pending.peek().is_some_and(|top| top.key >= floor) {
            if let Some(next) = self.pending.pop() {
                let record = GuessRecord {
                    guess: next.text,
                    probability: next.log_prob.exp(),
                    rank: self.records_written + 1,
                };
                self.emit(&record.to_line(), record.probability)?;
            }
        }
        Ok(())
    }

    pub fn write_estimate(&mut self, outcome: &TargetOutcome) -> Result<()> {
        let record = EstimateRecord::from_outcome(outcome);
        self.emit(&record.to_line(), record.probability)
    }

    fn emit(&mut self, line: &str, probability: f64) -> Result<()> {
        if self.skip > 0 {
            self.skip -= 1;
        } else {
            self.out.write_all(line.as_bytes())?;
            self.bytes_written += line.len() as u64;
        }
        self.records_written += 1;

        if self.records_written % self.chunk_size == 0 {
            self.flush()?;
            self.chunks_flushed += 1;
        }
        if self.print_interval > 0 && self.records_written % self.print_interval == 0 {
            log::info!(
                "Serialized {} records (last probability {})",
                self.records_written,
                fmt_probability(probability)
            );
        }
        Ok(())
    }

    /// Records written so far, including skipped ones
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn chunks_flushed(&self) -> u64 {
        self.chunks_flushed
    }

    /// Push everything written so far to the underlying writer
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        self.durable_records = self.records_written;
        self.durable_bytes = self.bytes_written;
        Ok(())
    }

    /// Records known to be on disk
    pub fn durable_records(&self) -> u64 {
        self.durable_records
    }

    /// Bytes this serializer has flushed (skipped records excluded)
    pub fn durable_bytes(&self) -> u64 {
        self.durable_bytes
    }

    /// Write the queued guesses, flush the tail and hand back the writer
    pub fn finish(mut self) -> Result<W> {
        self.drain_pending()?;
        self.flush()?;
        Ok(self.out)
    }
}
