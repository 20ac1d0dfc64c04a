//! Run orchestration
//!
//! [`Guesser`] owns the oracle adapter for one configuration and drives the
//! selected [`GuessStrategy`] end to end: search or sampling, serialization,
//! checkpointing and the final summary.

use crate::alphabet::AlphabetReducer;
use crate::checkpoint::{model_fingerprint, IntermediateStore, RunCursor, RunId};
use crate::config::{GuessConfig, GuessStrategy, RunArgs};
use crate::enumerator::{EnumerationStop, Enumerator, GuessSource, ParallelEnumerator};
use crate::oracle::{Oracle, OracleAdapter};
use crate::password_list::PasswordList;
use crate::random_walk::{score_passwords, RandomWalkEstimator, TargetFailure};
use crate::serializer::GuessSerializer;
use crate::{ALICEGuessError, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Output path meaning stdout
pub const STDOUT_PATH: &str = "-";

/// What a run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Records in the output, including ones a resumed run skipped
    pub records_written: u64,
    /// Guesses produced by the enumerator before expansion
    pub reduced_guesses: u64,
    pub stop: Option<EnumerationStop>,
    pub targets: usize,
    pub failed_targets: usize,
    /// Records skipped because an earlier run already wrote them
    pub resumed_from: u64,
    pub oracle_calls: u64,
    pub predictions: u64,
    pub elapsed_secs: f64,
}

impl RunSummary {
    fn log(&self) {
        log::info!(
            "Wrote {} records in {:.2}s ({} oracle calls, {} predictions)",
            self.records_written,
            self.elapsed_secs,
            self.oracle_calls,
            self.predictions
        );
        if let Some(stop) = self.stop {
            log::info!(
                "Enumeration stopped: {:?} after {} guesses",
                stop,
                self.reduced_guesses
            );
        }
        if self.targets > 0 {
            log::info!(
                "Estimated {} targets, {} without a guess number",
                self.targets - self.failed_targets,
                self.failed_targets
            );
        }
    }
}

fn report<W, P>(serializer: &GuessSerializer<'_, W>, progress: &mut P) -> Result<()>
where
    W: Write,
    P: FnMut(RunCursor) -> Result<()>,
{
    progress(RunCursor::new(
        serializer.durable_records(),
        serializer.chunks_flushed(),
        serializer.durable_bytes(),
        false,
    ))
}

/// Guessing front end for one oracle, reducer and configuration
pub struct Guesser<'a, O: Oracle + ?Sized> {
    adapter: OracleAdapter<'a, O>,
    reducer: &'a AlphabetReducer,
    config: &'a GuessConfig,
    strategy: GuessStrategy,
}

impl<'a, O: Oracle + ?Sized> Guesser<'a, O> {
    pub fn new(oracle: &'a O, reducer: &'a AlphabetReducer, config: &'a GuessConfig) -> Result<Self> {
        config.validate()?;
        config.log_passthrough();
        let strategy = config.strategy()?;

        if oracle.context_length() != config.context_length {
            log::warn!(
                "Model context length {} differs from configured context_length {}",
                oracle.context_length(),
                config.context_length
            );
        }

        let adapter = OracleAdapter::new(oracle, reducer, config.adapter_settings())?;
        log::info!(
            "Working alphabet: {} symbols (character bag: {})",
            reducer.alphabet().len(),
            reducer.original_chars().len()
        );

        Ok(Self {
            adapter,
            reducer,
            config,
            strategy,
        })
    }

    pub fn strategy(&self) -> &GuessStrategy {
        &self.strategy
    }

    pub fn adapter(&self) -> &OracleAdapter<'a, O> {
        &self.adapter
    }

    /// Model probability of each password, per-password failures kept
    pub fn score(&self, passwords: &[String]) -> Result<Vec<std::result::Result<f64, TargetFailure>>> {
        score_passwords(&self.adapter, self.reducer, passwords)
    }

    /// Enumerate into `out` without checkpointing
    pub fn enumerate_to<W: Write>(&self, out: W) -> Result<RunSummary> {
        let never = AtomicBool::new(false);
        self.enumerate(out, 0, &never, &mut |_: RunCursor| Ok(()))
    }

    /// Estimate guess numbers of `passwords` into `out` without checkpointing
    pub fn estimate_to<W: Write>(&self, passwords: &[String], out: W) -> Result<RunSummary> {
        let never = AtomicBool::new(false);
        self.estimate(passwords, out, 0, &never, &mut |_: RunCursor| Ok(()))
    }

    /// Checkpoint identity of a run writing `output` with the model files in `args`
    pub fn run_id(&self, args: &RunArgs, output: &Path) -> Result<RunId> {
        let model = model_fingerprint(&[args.arch_file.as_deref(), args.weight_file.as_deref()])?;
        RunId::derive(&self.strategy, self.config, output, model)
    }

    /// Run the configured strategy against the output named in `args`.
    ///
    /// Resumes an unfinished run with the same id from the intermediate store,
    /// unless the output file no longer holds what the cursor says was flushed.
    pub fn run(&self, args: &RunArgs, cancel: &AtomicBool) -> Result<RunSummary> {
        let output = args
            .enumerate_ofile
            .clone()
            .unwrap_or_else(|| PathBuf::from(STDOUT_PATH));
        let to_stdout = output == Path::new(STDOUT_PATH);

        let mut store = match self.config.intermediate_path() {
            Some(_) if to_stdout => {
                log::warn!("Output goes to stdout; intermediate_fname ignored");
                IntermediateStore::in_memory()
            }
            path => IntermediateStore::from_option(path)?,
        };
        let id = self.run_id(args, &output)?;
        let resume = match store.resume_point(&id) {
            Some(cursor) if output_len(&output, to_stdout) < cursor.bytes_flushed => {
                log::warn!(
                    "Run {} has {} bytes checkpointed but {} holds fewer; starting over",
                    id,
                    cursor.bytes_flushed,
                    output.display()
                );
                None
            }
            cursor => cursor.cloned(),
        };

        log::info!("Run {} writing to {}", id, output.display());
        let writer: Box<dyn Write> = if to_stdout {
            Box::new(BufWriter::new(io::stdout().lock()))
        } else {
            Box::new(BufWriter::new(open_output(&output, resume.as_ref())?))
        };

        let (skip, base_bytes) = match &resume {
            Some(cursor) => {
                log::info!(
                    "Resuming run {} after {} records ({} chunks)",
                    id,
                    cursor.records_written,
                    cursor.chunks_flushed
                );
                (cursor.records_written, cursor.bytes_flushed)
            }
            None => (0, 0),
        };

        let mut progress = |mut cursor: RunCursor| {
            cursor.bytes_flushed += base_bytes;
            store.record(&id, cursor)
        };

        let mut summary = match &self.strategy {
            GuessStrategy::Enumerate { .. } => self.enumerate(writer, skip, cancel, &mut progress)?,
            GuessStrategy::RandomWalk { test_file, .. } => {
                let passwords: Vec<String> = PasswordList::read(test_file, args.pwd_format)?
                    .passwords()
                    .map(str::to_string)
                    .collect();
                self.estimate(&passwords, writer, skip, cancel, &mut progress)?
            }
        };
        summary.resumed_from = skip;

        let chunks = summary.records_written / self.config.chunk_size_guesser as u64;
        let bytes = output_len(&output, to_stdout);
        store.record(
            &id,
            RunCursor::new(summary.records_written, chunks, bytes, true),
        )?;
        summary.log();
        Ok(summary)
    }

    fn enumerate<W, P>(
        &self,
        out: W,
        skip: u64,
        cancel: &AtomicBool,
        progress: &mut P,
    ) -> Result<RunSummary>
    where
        W: Write,
        P: FnMut(RunCursor) -> Result<()>,
    {
        let (threshold, budget, fork_length) = match &self.strategy {
            GuessStrategy::Enumerate {
                threshold,
                budget,
                fork_length,
            } => (*threshold, *budget, *fork_length),
            GuessStrategy::RandomWalk { .. } => {
                return Err(ALICEGuessError::Config(
                    "configured strategy is delamico_random_walk, not enumeration".to_string(),
                ))
            }
        };

        let started = Instant::now();
        log::info!(
            "Enumerating guesses above {} (lengths {}..={}, {})",
            threshold,
            self.config.min_len,
            self.config.max_len,
            if fork_length.is_some() { "parallel" } else { "serial" }
        );

        let chunk_size = self.config.chunk_size_guesser;
        let mut serializer = GuessSerializer::new(
            out,
            self.reducer,
            threshold,
            chunk_size,
            self.config.chunk_print_interval,
        )
        .resume_after(skip);
        let mut reported = serializer.durable_records();
        let mut summary = RunSummary::default();

        let mut source: Box<dyn GuessSource + '_> = match fork_length {
            None => Box::new(Enumerator::new(&self.adapter, threshold, chunk_size, budget)),
            Some(fork_length) => {
                let merged = ParallelEnumerator::new(&self.adapter, threshold, chunk_size, fork_length)
                    .with_budget(budget)
                    .merged()?;
                log::debug!("Merging {} partitions", merged.partition_count());
                Box::new(merged)
            }
        };

        while let Some(chunk) = source.next_chunk()? {
            if cancel.load(Ordering::Relaxed) {
                serializer.flush()?;
                report(&serializer, progress)?;
                return Err(ALICEGuessError::Cancelled);
            }
            summary.reduced_guesses += chunk.guesses.len() as u64;
            serializer.write_chunk(&chunk)?;
            if serializer.durable_records() != reported {
                reported = serializer.durable_records();
                report(&serializer, progress)?;
            }
        }
        summary.stop = source.stop_reason();

        serializer.drain_pending()?;
        summary.records_written = serializer.records_written();
        serializer.finish()?;
        self.finish_summary(&mut summary, started);
        Ok(summary)
    }

    fn estimate<W, P>(
        &self,
        passwords: &[String],
        out: W,
        skip: u64,
        cancel: &AtomicBool,
        progress: &mut P,
    ) -> Result<RunSummary>
    where
        W: Write,
        P: FnMut(RunCursor) -> Result<()>,
    {
        let (seeds, max_depth, rng_seed, parallel) = match &self.strategy {
            GuessStrategy::RandomWalk {
                seeds,
                max_depth,
                rng_seed,
                parallel,
                ..
            } => (*seeds, *max_depth, *rng_seed, *parallel),
            GuessStrategy::Enumerate { .. } => {
                return Err(ALICEGuessError::Config(
                    "configured strategy is enumeration, not delamico_random_walk".to_string(),
                ))
            }
        };

        let started = Instant::now();
        let estimator = RandomWalkEstimator::new(&self.adapter, self.reducer, seeds, max_depth)
            .with_rng_seed(rng_seed)
            .parallel(parallel);
        let table = estimator.sample(cancel)?;
        log::info!(
            "{} of {} walks completed; scoring {} test passwords",
            table.completed(),
            table.walks(),
            passwords.len()
        );

        let mut serializer = GuessSerializer::new(
            out,
            self.reducer,
            self.config.lower_probability_threshold,
            self.config.chunk_size_guesser,
            self.config.chunk_print_interval,
        )
        .resume_after(skip);
        let mut reported = serializer.durable_records();
        let mut summary = RunSummary {
            targets: passwords.len(),
            ..RunSummary::default()
        };

        for batch in passwords.chunks(self.config.chunk_size_guesser) {
            if cancel.load(Ordering::Relaxed) {
                serializer.flush()?;
                report(&serializer, progress)?;
                return Err(ALICEGuessError::Cancelled);
            }
            for outcome in estimator.estimate_targets(&table, batch)? {
                if outcome.result.is_err() {
                    summary.failed_targets += 1;
                }
                serializer.write_estimate(&outcome)?;
            }
            if serializer.durable_records() != reported {
                reported = serializer.durable_records();
                report(&serializer, progress)?;
            }
        }

        serializer.drain_pending()?;
        summary.records_written = serializer.records_written();
        serializer.finish()?;
        self.finish_summary(&mut summary, started);
        Ok(summary)
    }

    fn finish_summary(&self, summary: &mut RunSummary, started: Instant) {
        let (calls, predictions) = self.adapter.usage();
        summary.oracle_calls = calls;
        summary.predictions = predictions;
        summary.elapsed_secs = started.elapsed().as_secs_f64();
    }
}

/// Fresh file, or the existing one cut back to the last durable byte
fn open_output(path: &Path, resume: Option<&RunCursor>) -> Result<File> {
    match resume {
        Some(cursor) => {
            let mut file = OpenOptions::new().create(true).write(true).truncate(false).open(path)?;
            file.set_len(cursor.bytes_flushed)?;
            file.seek(SeekFrom::End(0))?;
            Ok(file)
        }
        None => Ok(File::create(path)?),
    }
}

fn output_len(path: &Path, to_stdout: bool) -> u64 {
    if to_stdout {
        return 0;
    }
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet::{CharacterCounter, ReducerSettings};
    use crate::config::SerializationMethod;
    use crate::oracle::StaticOracle;
    use std::fs;
    use tempfile::TempDir;

    fn scenario_config() -> GuessConfig {
        GuessConfig {
            char_bag: "ab".to_string(),
            min_len: 1,
            max_len: 2,
            context_length: 2,
            lower_probability_threshold: 0.05,
            chunk_size_guesser: 2,
            ..GuessConfig::default()
        }
    }

    fn guesses_of(text: &str) -> Vec<String> {
        text.lines()
            .map(|l| l.split('\t').next().unwrap_or_default().to_string())
            .collect()
    }

    fn probabilities_of(text: &str) -> Vec<f64> {
        text.lines()
            .map(|l| l.split('\t').nth(1).unwrap().parse().unwrap())
            .collect()
    }

    /// "abA" with 'A' folded onto 'a': shares 2/3 lower, 1/3 upper
    fn folded_reducer() -> AlphabetReducer {
        let mut counter = CharacterCounter::new("abA", 1, 8);
        counter.observe("aaa", 1);
        counter.observe("A", 1);
        AlphabetReducer::build(
            "abA",
            &ReducerSettings {
                uppercase_character_optimization: true,
                ..ReducerSettings::default()
            },
            &counter,
        )
    }

    fn folded_config() -> GuessConfig {
        GuessConfig {
            char_bag: "abA".to_string(),
            uppercase_character_optimization: true,
            lower_probability_threshold: 0.001,
            ..scenario_config()
        }
    }

    /// Uninterrupted output of `guesser`
    fn full_output<O: Oracle + ?Sized>(guesser: &Guesser<'_, O>) -> String {
        let mut full = Vec::new();
        guesser.enumerate_to(&mut full).unwrap();
        String::from_utf8(full).unwrap()
    }

    #[test]
    fn test_enumerate_scenario() {
        let reducer = AlphabetReducer::identity("ab");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = scenario_config();
        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();

        let mut out = Vec::new();
        let summary = guesser.enumerate_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(guesses_of(&text), vec!["aa", "ab", "ba", "bb", "a"]);
        assert_eq!(summary.records_written, 5);
        assert_eq!(summary.stop, Some(EnumerationStop::FrontierExhausted));
        assert!(summary.oracle_calls > 0);
        let ranks: Vec<&str> = text.lines().map(|l| l.rsplit('\t').next().unwrap()).collect();
        assert_eq!(ranks, vec!["1", "2", "3", "4", "5"]);
    }

    #[test]
    fn test_parallel_run_matches_serial() {
        let reducer = AlphabetReducer::identity("abc");
        let oracle = StaticOracle::new(vec![0.5, 0.3, 0.15, 0.05], 2);
        let serial_config = GuessConfig {
            char_bag: "abc".to_string(),
            min_len: 2,
            max_len: 4,
            context_length: 2,
            lower_probability_threshold: 1e-3,
            chunk_size_guesser: 7,
            ..GuessConfig::default()
        };
        let parallel_config = GuessConfig {
            parallel_guessing: true,
            fork_length: 1,
            ..serial_config.clone()
        };

        let mut serial = Vec::new();
        Guesser::new(&oracle, &reducer, &serial_config)
            .unwrap()
            .enumerate_to(&mut serial)
            .unwrap();
        let mut parallel = Vec::new();
        Guesser::new(&oracle, &reducer, &parallel_config)
            .unwrap()
            .enumerate_to(&mut parallel)
            .unwrap();

        assert!(!serial.is_empty());
        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_folded_alphabet_output_is_monotone() {
        let reducer = folded_reducer();
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = folded_config();
        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();

        let text = full_output(&guesser);
        let guesses = guesses_of(&text);
        let probabilities = probabilities_of(&text);

        // Reduced "aa" (0.4) expands to "AA" (0.4 / 9), which must wait for the
        // expansions of "ab", "ba" and "bb"
        assert_eq!(&guesses[..4], &["aa", "ab", "ba", "bb"]);
        assert_eq!(guesses.len(), 12);
        assert_eq!(guesses.last().map(String::as_str), Some("A"));
        for g in ["aA", "Aa", "AA", "Ab", "bA", "a", "b"] {
            assert!(guesses.iter().any(|x| x == g), "missing {}", g);
        }
        for pair in probabilities.windows(2) {
            assert!(pair[0] >= pair[1] * (1.0 - 1e-9), "{:?}", pair);
        }
        assert!((probabilities[0] - 1.6 / 9.0).abs() < 1e-12);
        let ranks: Vec<u64> = text.lines().map(|l| l.rsplit('\t').next().unwrap().parse().unwrap()).collect();
        assert_eq!(ranks, (1..=12).collect::<Vec<_>>());
    }

    #[test]
    fn test_folded_alphabet_parallel_matches_serial() {
        let reducer = folded_reducer();
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let serial_config = GuessConfig {
            min_len: 2,
            max_len: 3,
            ..folded_config()
        };
        let parallel_config = GuessConfig {
            parallel_guessing: true,
            fork_length: 1,
            ..serial_config.clone()
        };

        let serial = full_output(&Guesser::new(&oracle, &reducer, &serial_config).unwrap());
        let parallel = full_output(&Guesser::new(&oracle, &reducer, &parallel_config).unwrap());
        assert!(guesses_of(&serial).iter().any(|g| g == "AAA"));
        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_parallel_budget_matches_serial() {
        let reducer = AlphabetReducer::identity("abc");
        let oracle = StaticOracle::new(vec![0.3, 0.2, 0.1, 0.4], 2);
        let serial_config = GuessConfig {
            char_bag: "abc".to_string(),
            min_len: 2,
            max_len: 8,
            context_length: 2,
            lower_probability_threshold: 1e-6,
            chunk_size_guesser: 2,
            guess_budget: Some(5),
            ..GuessConfig::default()
        };
        let parallel_config = GuessConfig {
            parallel_guessing: true,
            fork_length: 1,
            ..serial_config.clone()
        };

        let serial = full_output(&Guesser::new(&oracle, &reducer, &serial_config).unwrap());
        let guesser = Guesser::new(&oracle, &reducer, &parallel_config).unwrap();
        let mut out = Vec::new();
        let summary = guesser.enumerate_to(&mut out).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), serial);
        assert_eq!(summary.records_written, 5);
        assert_eq!(summary.stop, Some(EnumerationStop::BudgetReached));
        // Without the budget this tree needs thousands of predictions
        assert!(summary.predictions < 200, "{} predictions", summary.predictions);
    }

    #[test]
    fn test_parallel_run_reports_progress_while_running() {
        let reducer = AlphabetReducer::identity("abc");
        let oracle = StaticOracle::new(vec![0.5, 0.3, 0.15, 0.05], 2);
        let config = GuessConfig {
            char_bag: "abc".to_string(),
            min_len: 2,
            max_len: 4,
            context_length: 2,
            lower_probability_threshold: 1e-3,
            chunk_size_guesser: 2,
            parallel_guessing: true,
            fork_length: 1,
            ..GuessConfig::default()
        };
        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();

        let mut durable = Vec::new();
        let never = AtomicBool::new(false);
        let summary = guesser
            .enumerate(Vec::new(), 0, &never, &mut |cursor: RunCursor| {
                durable.push(cursor.records_written);
                Ok(())
            })
            .unwrap();

        assert!(durable.len() > 1);
        assert_eq!(durable[0], 2);
        assert!(durable.windows(2).all(|w| w[0] < w[1]));
        assert!(*durable.last().unwrap() <= summary.records_written);
    }

    #[test]
    fn test_budget_limits_output() {
        let reducer = AlphabetReducer::identity("ab");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = GuessConfig {
            guess_budget: Some(3),
            ..scenario_config()
        };
        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();

        let mut out = Vec::new();
        let summary = guesser.enumerate_to(&mut out).unwrap();
        assert_eq!(summary.stop, Some(EnumerationStop::BudgetReached));
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_run_writes_file_and_finishes_cursor() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("guesses.tsv");
        let state = dir.path().join("state.json");

        let reducer = AlphabetReducer::identity("ab");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = GuessConfig {
            intermediate_fname: state.to_string_lossy().into_owned(),
            ..scenario_config()
        };
        let args = RunArgs {
            enumerate_ofile: Some(output.clone()),
            ..RunArgs::default()
        };

        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();
        let summary = guesser.run(&args, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.records_written, 5);

        let text = fs::read_to_string(&output).unwrap();
        assert_eq!(text.lines().count(), 5);

        let store = IntermediateStore::open(&state).unwrap();
        let id = guesser.run_id(&args, &output).unwrap();
        let cursor = store.cursor(&id).unwrap();
        assert!(cursor.finished);
        assert_eq!(cursor.records_written, 5);
        assert_eq!(cursor.bytes_flushed, text.len() as u64);
    }

    #[test]
    fn test_resume_continues_after_durable_records() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("guesses.tsv");
        let state = dir.path().join("state.json");

        let reducer = AlphabetReducer::identity("ab");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = GuessConfig {
            intermediate_fname: state.to_string_lossy().into_owned(),
            ..scenario_config()
        };
        let args = RunArgs {
            enumerate_ofile: Some(output.clone()),
            ..RunArgs::default()
        };
        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();

        // Reference output of an uninterrupted run
        let mut full = Vec::new();
        guesser.enumerate_to(&mut full).unwrap();
        let full = String::from_utf8(full).unwrap();

        // Simulate an interrupted run: two records durable, a torn third line after them
        let durable: String = full.lines().take(2).map(|l| format!("{}\n", l)).collect();
        fs::write(&output, format!("{}ba\t0.", durable)).unwrap();
        let id = guesser.run_id(&args, &output).unwrap();
        let mut store = IntermediateStore::open(&state).unwrap();
        store
            .record(&id, RunCursor::new(2, 1, durable.len() as u64, false))
            .unwrap();

        let summary = guesser.run(&args, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.resumed_from, 2);
        assert_eq!(summary.records_written, 5);
        assert_eq!(fs::read_to_string(&output).unwrap(), full);
    }

    #[test]
    fn test_changed_weights_start_a_fresh_run() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("guesses.tsv");
        let state = dir.path().join("state.json");
        let arch = dir.path().join("arch.json");
        let weights = dir.path().join("weights.bin");
        fs::write(&arch, r#"{"order": 2}"#).unwrap();
        fs::write(&weights, [1u8; 16]).unwrap();

        let reducer = AlphabetReducer::identity("ab");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = GuessConfig {
            intermediate_fname: state.to_string_lossy().into_owned(),
            ..scenario_config()
        };
        let args = RunArgs {
            arch_file: Some(arch),
            weight_file: Some(weights.clone()),
            enumerate_ofile: Some(output.clone()),
            ..RunArgs::default()
        };
        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();
        let full = full_output(&guesser);

        // An interrupted run on the old weights left two records behind
        let durable: String = full.lines().take(2).map(|l| format!("{}\n", l)).collect();
        fs::write(&output, &durable).unwrap();
        let stale = guesser.run_id(&args, &output).unwrap();
        let mut store = IntermediateStore::open(&state).unwrap();
        store
            .record(&stale, RunCursor::new(2, 1, durable.len() as u64, false))
            .unwrap();

        fs::write(&weights, [2u8; 16]).unwrap();
        assert_ne!(guesser.run_id(&args, &output).unwrap(), stale);

        let summary = guesser.run(&args, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.resumed_from, 0);
        assert_eq!(fs::read_to_string(&output).unwrap(), full);
    }

    #[test]
    fn test_cursor_past_end_of_output_starts_over() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("guesses.tsv");
        let state = dir.path().join("state.json");

        let reducer = AlphabetReducer::identity("ab");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = GuessConfig {
            intermediate_fname: state.to_string_lossy().into_owned(),
            ..scenario_config()
        };
        let args = RunArgs {
            enumerate_ofile: Some(output.clone()),
            ..RunArgs::default()
        };
        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();
        let full = full_output(&guesser);

        // Cursor survived but the output file did not
        let id = guesser.run_id(&args, &output).unwrap();
        let mut store = IntermediateStore::open(&state).unwrap();
        store.record(&id, RunCursor::new(4, 2, 40, false)).unwrap();

        let summary = guesser.run(&args, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.resumed_from, 0);
        assert_eq!(fs::read_to_string(&output).unwrap(), full);

        // Output shorter than the checkpointed offset
        store = IntermediateStore::open(&state).unwrap();
        store.record(&id, RunCursor::new(4, 2, 10_000, false)).unwrap();
        fs::write(&output, "aa\t").unwrap();

        let summary = guesser.run(&args, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.resumed_from, 0);
        assert_eq!(summary.records_written, 5);
        assert_eq!(fs::read_to_string(&output).unwrap(), full);
    }

    #[test]
    fn test_cancelled_run_keeps_cursor() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("guesses.tsv");
        let state = dir.path().join("state.json");

        let reducer = AlphabetReducer::identity("ab");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = GuessConfig {
            intermediate_fname: state.to_string_lossy().into_owned(),
            ..scenario_config()
        };
        let args = RunArgs {
            enumerate_ofile: Some(output.clone()),
            ..RunArgs::default()
        };
        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();

        let result = guesser.run(&args, &AtomicBool::new(true));
        assert!(matches!(result, Err(ALICEGuessError::Cancelled)));

        let store = IntermediateStore::open(&state).unwrap();
        let id = guesser.run_id(&args, &output).unwrap();
        let cursor = store.resume_point(&id).unwrap();
        assert_eq!(cursor.records_written, 0);
    }

    #[test]
    fn test_estimate_run_reads_test_file() {
        let dir = TempDir::new().unwrap();
        let test_file = dir.path().join("test.txt");
        let output = dir.path().join("estimates.tsv");
        fs::write(&test_file, "aa\nab\nzz\nabab\n").unwrap();

        let reducer = AlphabetReducer::identity("ab");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = GuessConfig {
            guess_serialization_method: SerializationMethod::DelamicoRandomWalk,
            random_walk_seed_num: 5_000,
            random_walk_seed_iterations: 5,
            password_test_fname: Some(test_file),
            ..scenario_config()
        };
        let args = RunArgs {
            enumerate_ofile: Some(output.clone()),
            ..RunArgs::default()
        };

        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();
        let summary = guesser.run(&args, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.targets, 4);
        assert_eq!(summary.failed_targets, 2);

        let text = fs::read_to_string(&output).unwrap();
        let rows: Vec<Vec<&str>> = text.lines().map(|l| l.split('\t').collect()).collect();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.len() == 6));
        let top: f64 = rows[0][2].parse().unwrap();
        assert!((top - 1.0).abs() < 0.15, "estimate {}", top);
        assert_eq!(rows[2][2], "-1");
        assert_eq!(rows[3][2], "-1");
    }

    #[test]
    fn test_wrong_entry_point_is_config_error() {
        let reducer = AlphabetReducer::identity("ab");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = GuessConfig {
            guess_serialization_method: SerializationMethod::DelamicoRandomWalk,
            password_test_fname: Some(PathBuf::from("unused.txt")),
            ..scenario_config()
        };
        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();
        assert!(matches!(
            guesser.enumerate_to(Vec::new()),
            Err(ALICEGuessError::Config(_))
        ));
    }

    #[test]
    fn test_score_reports_probabilities() {
        let reducer = AlphabetReducer::identity("ab");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = scenario_config();
        let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();

        let scores = guesser
            .score(&["aa".to_string(), "ax".to_string()])
            .unwrap();
        assert!((scores[0].unwrap().exp() - 0.4).abs() < 1e-12);
        assert_eq!(scores[1], Err(TargetFailure::UnknownSymbol('x')));
    }

    #[test]
    fn test_alphabet_mismatch_is_fatal() {
        let reducer = AlphabetReducer::identity("abc");
        let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
        let config = GuessConfig {
            char_bag: "abc".to_string(),
            ..scenario_config()
        };
        assert!(matches!(
            Guesser::new(&oracle, &reducer, &config),
            Err(ALICEGuessError::AlphabetMismatch { .. })
        ));
    }
}
