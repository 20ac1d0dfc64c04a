//! Probability-tree enumeration for ALICE-Guess
//!
//! Best-first branch-and-bound over the tree of prefixes:
//!
//! ```text
//! frontier = { root }
//! loop:
//!     top terminal?      → emit (nothing left in the tree can be more probable)
//!     top non-terminal?  → pop a batch of non-terminals, one oracle call,
//!                          push children with P ≥ lower_probability_threshold
//! ```
//!
//! Children are never more probable than their parent, so terminals leave the
//! frontier in non-increasing probability order. Equal probabilities (at
//! [`LOG_PROB_RESOLUTION`]) are broken by the decoded string, which makes every run
//! over the same oracle produce the same output.
//!
//! With `parallel_guessing` the tree is first expanded to `fork_length`; each fork
//! point becomes a partition searched by its own worker. Workers tag their chunks
//! with (partition, sequence). [`MergedEnumeration`] pulls chunks from the
//! partitions as the output needs them and k-way merges them back into the global
//! order; [`merge_partitions`] does the same for fully collected partitions.

use crate::alphabet::Symbol;
use crate::oracle::{Oracle, OracleAdapter};
use crate::{ALICEGuessError, Result};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

/// Log-probabilities closer than this are ordered as equal
pub const LOG_PROB_RESOLUTION: f64 = 1e-9;

/// Integer ordering key of a log-probability at [`LOG_PROB_RESOLUTION`]
#[inline]
pub(crate) fn order_key(log_prob: f64) -> i64 {
    (log_prob / LOG_PROB_RESOLUTION).round() as i64
}

/// A complete guess in the working alphabet, symbols in output order
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedGuess {
    pub symbols: Vec<Symbol>,
    pub log_prob: f64,
}

impl ReducedGuess {
    pub fn probability(&self) -> f64 {
        self.log_prob.exp()
    }

    /// Emission order: more probable first, then lexicographic
    pub fn emission_cmp(&self, other: &Self) -> Ordering {
        order_key(other.log_prob)
            .cmp(&order_key(self.log_prob))
            .then_with(|| self.symbols.cmp(&other.symbols))
    }
}

/// Consecutive guesses of one partition
#[derive(Debug, Clone, PartialEq)]
pub struct GuessChunk {
    pub partition: u32,
    pub sequence: u64,
    pub guesses: Vec<ReducedGuess>,
}

/// Why an enumeration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationStop {
    /// No prefix above the probability floor is left
    FrontierExhausted,
    /// `guess_budget` guesses were emitted
    BudgetReached,
}

/// Anything that yields guesses chunk by chunk in emission order
pub trait GuessSource {
    /// Next chunk, `None` once stopped
    fn next_chunk(&mut self) -> Result<Option<GuessChunk>>;

    fn stop_reason(&self) -> Option<EnumerationStop>;
}

#[derive(Debug, Clone)]
struct FrontierNode {
    /// Oracle order
    prefix: Vec<Symbol>,
    log_prob: f64,
    key: i64,
    terminal: bool,
    backwards: bool,
}

impl FrontierNode {
    fn new(prefix: Vec<Symbol>, log_prob: f64, terminal: bool, backwards: bool) -> Self {
        Self {
            prefix,
            log_prob,
            key: order_key(log_prob),
            terminal,
            backwards,
        }
    }

    fn output_cmp(&self, other: &Self) -> Ordering {
        if self.backwards {
            self.prefix.iter().rev().cmp(other.prefix.iter().rev())
        } else {
            self.prefix.cmp(&other.prefix)
        }
    }
}

impl PartialEq for FrontierNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierNode {}

impl PartialOrd for FrontierNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierNode {
    // Max-heap: most probable, then prefixes before terminals, then smallest string.
    // Expanding equal-key prefixes first keeps ties in string order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.terminal.cmp(&self.terminal))
            .then_with(|| other.output_cmp(self))
    }
}

/// Children of `node` above the floor, given its next-symbol distribution
fn expand_node<O: Oracle + ?Sized>(
    adapter: &OracleAdapter<'_, O>,
    node: &FrontierNode,
    dist: &[f64],
    log_threshold: f64,
) -> Vec<FrontierNode> {
    let end = adapter.end_symbol() as usize;
    let max_len = adapter.settings().max_len;
    let backwards = adapter.settings().backwards;
    let mut children = Vec::new();

    for (symbol, &p) in dist.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        let log_prob = node.log_prob + p.ln();
        if log_prob < log_threshold {
            continue;
        }

        if symbol == end {
            if adapter.length_in_range(node.prefix.len()) {
                children.push(FrontierNode::new(node.prefix.clone(), log_prob, true, backwards));
            }
        } else if node.prefix.len() < max_len {
            let mut prefix = Vec::with_capacity(node.prefix.len() + 1);
            prefix.extend_from_slice(&node.prefix);
            prefix.push(symbol as Symbol);
            children.push(FrontierNode::new(prefix, log_prob, false, backwards));
        }
    }

    children
}

/// Best-first enumerator over one (sub)tree
pub struct Enumerator<'a, O: Oracle + ?Sized> {
    adapter: &'a OracleAdapter<'a, O>,
    frontier: BinaryHeap<FrontierNode>,
    log_threshold: f64,
    chunk_size: usize,
    budget: Option<u64>,
    partition: u32,
    emitted: u64,
    sequence: u64,
    expanded: u64,
    stop: Option<EnumerationStop>,
}

impl<'a, O: Oracle + ?Sized> Enumerator<'a, O> {
    /// Enumerate the whole tree from the empty prefix
    pub fn new(
        adapter: &'a OracleAdapter<'a, O>,
        threshold: f64,
        chunk_size: usize,
        budget: Option<u64>,
    ) -> Self {
        let root = FrontierNode::new(Vec::new(), 0.0, false, adapter.settings().backwards);
        Self::with_frontier(adapter, vec![root], threshold, chunk_size, budget, 0)
    }

    fn with_frontier(
        adapter: &'a OracleAdapter<'a, O>,
        nodes: Vec<FrontierNode>,
        threshold: f64,
        chunk_size: usize,
        budget: Option<u64>,
        partition: u32,
    ) -> Self {
        Self {
            adapter,
            frontier: nodes.into_iter().collect(),
            log_threshold: threshold.ln(),
            chunk_size: chunk_size.max(1),
            budget,
            partition,
            emitted: 0,
            sequence: 0,
            expanded: 0,
            stop: None,
        }
    }

    /// Next chunk of at most `chunk_size` guesses, `None` once stopped
    pub fn next_chunk(&mut self) -> Result<Option<GuessChunk>> {
        let mut guesses = Vec::with_capacity(self.chunk_size);

        while guesses.len() < self.chunk_size && self.stop.is_none() {
            if self.budget.is_some_and(|b| self.emitted >= b) {
                self.stop = Some(EnumerationStop::BudgetReached);
                break;
            }

            match self.frontier.peek() {
                None => self.stop = Some(EnumerationStop::FrontierExhausted),
                Some(node) if node.terminal => {
                    if let Some(node) = self.frontier.pop() {
                        self.emitted += 1;
                        guesses.push(ReducedGuess {
                            symbols: self.adapter.to_output_order(node.prefix),
                            log_prob: node.log_prob,
                        });
                    }
                }
                Some(_) => self.expand_batch()?,
            }
        }

        if guesses.is_empty() {
            return Ok(None);
        }

        let chunk = GuessChunk {
            partition: self.partition,
            sequence: self.sequence,
            guesses,
        };
        self.sequence += 1;
        Ok(Some(chunk))
    }

    /// Pop the leading non-terminals and expand them with one oracle batch
    fn expand_batch(&mut self) -> Result<()> {
        let max_batch = self.adapter.settings().max_batch;
        let mut batch = Vec::new();
        while batch.len() < max_batch {
            match self.frontier.peek() {
                Some(node) if !node.terminal => {
                    if let Some(node) = self.frontier.pop() {
                        batch.push(node);
                    }
                }
                _ => break,
            }
        }

        let prefixes: Vec<&[Symbol]> = batch.iter().map(|n| n.prefix.as_slice()).collect();
        let dists = self.adapter.predict(&prefixes)?;
        self.expanded += batch.len() as u64;

        for (node, dist) in batch.iter().zip(dists.iter()) {
            self.frontier
                .extend(expand_node(self.adapter, node, dist, self.log_threshold));
        }

        log::debug!(
            "Expanded {} prefixes, frontier now {}",
            batch.len(),
            self.frontier.len()
        );
        Ok(())
    }

    /// Drain every chunk into `sink`
    pub fn run<F>(&mut self, mut sink: F) -> Result<EnumerationStop>
    where
        F: FnMut(GuessChunk) -> Result<()>,
    {
        while let Some(chunk) = self.next_chunk()? {
            sink(chunk)?;
        }
        Ok(self.stop.unwrap_or(EnumerationStop::FrontierExhausted))
    }

    pub fn stop_reason(&self) -> Option<EnumerationStop> {
        self.stop
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Prefixes sent to the oracle so far
    pub fn expanded(&self) -> u64 {
        self.expanded
    }

    pub fn frontier_len(&self) -> usize {
        self.frontier.len()
    }
}

impl<O: Oracle + ?Sized> GuessSource for Enumerator<'_, O> {
    fn next_chunk(&mut self) -> Result<Option<GuessChunk>> {
        Enumerator::next_chunk(self)
    }

    fn stop_reason(&self) -> Option<EnumerationStop> {
        self.stop
    }
}

/// Enumerator that splits the tree at `fork_length` and searches subtrees in parallel
pub struct ParallelEnumerator<'a, O: Oracle + ?Sized> {
    adapter: &'a OracleAdapter<'a, O>,
    threshold: f64,
    chunk_size: usize,
    fork_length: usize,
    budget: Option<u64>,
}

impl<'a, O: Oracle + ?Sized> ParallelEnumerator<'a, O> {
    pub fn new(
        adapter: &'a OracleAdapter<'a, O>,
        threshold: f64,
        chunk_size: usize,
        fork_length: usize,
    ) -> Self {
        Self {
            adapter,
            threshold,
            chunk_size,
            fork_length,
            budget: None,
        }
    }

    /// Stop after `budget` guesses overall. No partition searches past it either.
    pub fn with_budget(mut self, budget: Option<u64>) -> Self {
        self.budget = budget;
        self
    }

    /// Expand level by level up to `fork_length`.
    ///
    /// Returns the terminals found on the way and the fork points.
    fn fork_points(&self) -> Result<(Vec<FrontierNode>, Vec<FrontierNode>)> {
        let log_threshold = self.threshold.ln();
        let backwards = self.adapter.settings().backwards;
        let mut terminals = Vec::new();
        let mut level = vec![FrontierNode::new(Vec::new(), 0.0, false, backwards)];

        for _ in 0..self.fork_length {
            let prefixes: Vec<&[Symbol]> = level.iter().map(|n| n.prefix.as_slice()).collect();
            let dists = self.adapter.predict(&prefixes)?;

            let mut next = Vec::new();
            for (node, dist) in level.iter().zip(dists.iter()) {
                for child in expand_node(self.adapter, node, dist, log_threshold) {
                    if child.terminal {
                        terminals.push(child);
                    } else {
                        next.push(child);
                    }
                }
            }
            level = next;
        }

        Ok((terminals, level))
    }

    /// One enumerator per partition; partition 0 holds the terminals above the fork depth
    fn partitions(&self) -> Result<Vec<Enumerator<'a, O>>> {
        let (terminals, roots) = self.fork_points()?;
        log::info!(
            "Forked {} subtrees at depth {} ({} early guesses)",
            roots.len(),
            self.fork_length,
            terminals.len()
        );

        let mut partitions = Vec::with_capacity(roots.len() + 1);
        partitions.push(Enumerator::with_frontier(
            self.adapter,
            terminals,
            self.threshold,
            self.chunk_size,
            self.budget,
            0,
        ));
        for (i, root) in roots.into_iter().enumerate() {
            partitions.push(Enumerator::with_frontier(
                self.adapter,
                vec![root],
                self.threshold,
                self.chunk_size,
                self.budget,
                i as u32 + 1,
            ));
        }
        Ok(partitions)
    }

    /// Search every partition to the end and return their chunks
    pub fn run(&self, cancel: &AtomicBool) -> Result<Vec<Vec<GuessChunk>>> {
        self.partitions()?
            .into_par_iter()
            .map(|mut enumerator| collect_chunks(&mut enumerator, cancel))
            .collect()
    }

    /// Merged stream that searches partitions only as far as the output needs
    pub fn merged(&self) -> Result<MergedEnumeration<'a, O>> {
        let partitions = self
            .partitions()?
            .into_iter()
            .map(|enumerator| Partition {
                enumerator,
                pending: VecDeque::new(),
                queued: false,
                done: false,
            })
            .collect();

        Ok(MergedEnumeration {
            partitions,
            heads: BinaryHeap::new(),
            chunk_size: self.chunk_size.max(1),
            budget: self.budget,
            emitted: 0,
            sequence: 0,
            starved: true,
            stop: None,
        })
    }
}

fn collect_chunks<O: Oracle + ?Sized>(
    enumerator: &mut Enumerator<'_, O>,
    cancel: &AtomicBool,
) -> Result<Vec<GuessChunk>> {
    let mut chunks = Vec::new();
    while let Some(chunk) = enumerator.next_chunk()? {
        if cancel.load(AtomicOrdering::Relaxed) {
            return Err(ALICEGuessError::Cancelled);
        }
        chunks.push(chunk);
    }
    Ok(chunks)
}

struct MergeHead {
    guess: ReducedGuess,
    partition: usize,
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHead {}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .guess
            .emission_cmp(&self.guess)
            .then_with(|| other.partition.cmp(&self.partition))
    }
}

struct Partition<'a, O: Oracle + ?Sized> {
    enumerator: Enumerator<'a, O>,
    /// Guesses pulled but not yet merged, behind the queued head
    pending: VecDeque<ReducedGuess>,
    /// The partition's best unmerged guess sits in the merge heap
    queued: bool,
    done: bool,
}

impl<O: Oracle + ?Sized> Partition<'_, O> {
    fn wants_chunk(&self, chunk_size: usize) -> bool {
        !self.done && self.pending.len() < chunk_size
    }

    fn pull(&mut self) -> Result<()> {
        match self.enumerator.next_chunk()? {
            Some(chunk) => self.pending.extend(chunk.guesses),
            None => self.done = true,
        }
        Ok(())
    }
}

/// Lazy k-way merge over the partitions of a [`ParallelEnumerator`].
///
/// A guess is merged only while every unfinished partition has its head in the
/// merge heap. When one runs dry, all partitions holding less than a chunk pull
/// their next chunk in parallel. Memory stays within about two chunks per
/// partition and the search stops once the budget is met.
pub struct MergedEnumeration<'a, O: Oracle + ?Sized> {
    partitions: Vec<Partition<'a, O>>,
    heads: BinaryHeap<MergeHead>,
    chunk_size: usize,
    budget: Option<u64>,
    emitted: u64,
    sequence: u64,
    /// Some unfinished partition has no head queued
    starved: bool,
    stop: Option<EnumerationStop>,
}

impl<O: Oracle + ?Sized> MergedEnumeration<'_, O> {
    fn refill(&mut self) -> Result<()> {
        let chunk_size = self.chunk_size;
        self.partitions
            .par_iter_mut()
            .filter(|p| p.wants_chunk(chunk_size))
            .try_for_each(|p| p.pull())?;

        for (partition, p) in self.partitions.iter_mut().enumerate() {
            if !p.queued {
                if let Some(guess) = p.pending.pop_front() {
                    self.heads.push(MergeHead { guess, partition });
                    p.queued = true;
                }
            }
        }
        self.starved = false;
        Ok(())
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

impl<O: Oracle + ?Sized> GuessSource for MergedEnumeration<'_, O> {
    fn next_chunk(&mut self) -> Result<Option<GuessChunk>> {
        let mut guesses = Vec::with_capacity(self.chunk_size);

        while guesses.len() < self.chunk_size && self.stop.is_none() {
            if self.budget.is_some_and(|b| self.emitted >= b) {
                self.stop = Some(EnumerationStop::BudgetReached);
                break;
            }
            if self.starved {
                self.refill()?;
            }

            let Some(MergeHead { guess, partition }) = self.heads.pop() else {
                self.stop = Some(EnumerationStop::FrontierExhausted);
                break;
            };
            let p = &mut self.partitions[partition];
            match p.pending.pop_front() {
                Some(next) => self.heads.push(MergeHead {
                    guess: next,
                    partition,
                }),
                None => {
                    p.queued = false;
                    self.starved = !p.done;
                }
            }
            self.emitted += 1;
            guesses.push(guess);
        }

        if guesses.is_empty() {
            return Ok(None);
        }
        let chunk = GuessChunk {
            partition: 0,
            sequence: self.sequence,
            guesses,
        };
        self.sequence += 1;
        Ok(Some(chunk))
    }

    fn stop_reason(&self) -> Option<EnumerationStop> {
        self.stop
    }
}

/// Merge per-partition chunk lists into one stream in emission order.
///
/// Chunks are ordered by sequence number within each partition first, so the
/// result does not depend on the order workers finished in.
pub fn merge_partitions(partitions: Vec<Vec<GuessChunk>>) -> Vec<ReducedGuess> {
    let mut streams: Vec<std::vec::IntoIter<ReducedGuess>> = partitions
        .into_iter()
        .map(|mut chunks| {
            chunks.sort_by_key(|c| c.sequence);
            chunks
                .into_iter()
                .flat_map(|c| c.guesses)
                .collect::<Vec<_>>()
                .into_iter()
        })
        .collect();

    let mut heap = BinaryHeap::new();
    for (partition, stream) in streams.iter_mut().enumerate() {
        if let Some(guess) = stream.next() {
            heap.push(MergeHead { guess, partition });
        }
    }

    let mut merged = Vec::new();
    while let Some(MergeHead { guess, partition }) = heap.pop() {
        merged.push(guess);
        if let Some(next) = streams[partition].next() {
            heap.push(MergeHead {
                guess: next,
                partition,
            });
        }
    }

    merged
}
