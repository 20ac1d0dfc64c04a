//! Configuration for ALICE-Guess
//!
//! A run is described by a JSON file with two objects:
//!
//! ```text
//! {
//!   "args":   { "arch_file": ..., "weight_file": ..., "enumerate_ofile": ... },
//!   "config": { "min_len": 4, "max_len": 40, "guess_serialization_method": "human", ... }
//! }
//! ```
//!
//! Every `config` key has a default, so partial files are fine. Keys the guessing
//! engine does not use (training knobs such as `hidden_size` or `layers`) are kept
//! verbatim in [`GuessConfig::upstream`].

use crate::alphabet::{ReducerSettings, DEFAULT_CHAR_BAG};
use crate::oracle::AdapterSettings;
use crate::password_list::PasswordFormat;
use crate::{ALICEGuessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Intermediate store value meaning "keep nothing on disk"
pub const IN_MEMORY: &str = ":memory:";

/// How guesses are produced and serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationMethod {
    /// Best-first enumeration, one `guess<TAB>probability<TAB>rank` line per guess
    #[default]
    #[serde(alias = "exhaustive")]
    Human,
    /// Monte Carlo guess-number estimation for a test set
    DelamicoRandomWalk,
}

/// Strategy selected for a run, with the settings it needs
#[derive(Debug, Clone, PartialEq)]
pub enum GuessStrategy {
    Enumerate {
        threshold: f64,
        budget: Option<u64>,
        /// Fork depth when guessing in parallel
        fork_length: Option<usize>,
    },
    RandomWalk {
        seeds: usize,
        max_depth: usize,
        rng_seed: u64,
        parallel: bool,
        test_file: PathBuf,
    },
}

/// Guessing engine configuration (the `config` object)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuessConfig {
    pub char_bag: String,
    pub min_len: usize,
    pub max_len: usize,
    pub context_length: usize,
    pub lower_probability_threshold: f64,
    pub chunk_size_guesser: usize,
    pub chunk_print_interval: usize,
    pub guess_serialization_method: SerializationMethod,
    /// Stop enumeration after this many emitted guesses
    pub guess_budget: Option<u64>,
    pub random_walk_seed_num: usize,
    pub random_walk_seed_iterations: usize,
    pub random_walk_rng_seed: u64,
    pub parallel_guessing: bool,
    pub fork_length: usize,
    pub max_gpu_prediction_size: usize,
    pub rare_character_optimization: bool,
    pub uppercase_character_optimization: bool,
    pub rare_character_lowest_threshold: usize,
    pub rare_character_classes: usize,
    pub relevel_not_matching_passwords: bool,
    pub train_backwards: bool,
    pub no_end_word_cache: bool,
    pub save_model_versioned: bool,
    pub password_test_fname: Option<PathBuf>,
    pub intermediate_fname: String,
    /// Settings for the model side (architecture, training) passed through untouched
    #[serde(flatten)]
    pub upstream: BTreeMap<String, serde_json::Value>,
}

impl Default for GuessConfig {
    fn default() -> Self {
        Self {
            char_bag: DEFAULT_CHAR_BAG.to_string(),
            min_len: 4,
            max_len: 40,
            context_length: 10,
            lower_probability_threshold: 1e-5,
            chunk_size_guesser: 1000,
            chunk_print_interval: 1000,
            guess_serialization_method: SerializationMethod::Human,
            guess_budget: None,
            random_walk_seed_num: 10_000,
            random_walk_seed_iterations: 50,
            random_walk_rng_seed: 0x5EED,
            parallel_guessing: false,
            fork_length: 2,
            max_gpu_prediction_size: 1024,
            rare_character_optimization: false,
            uppercase_character_optimization: false,
            rare_character_lowest_threshold: 20,
            rare_character_classes: 1,
            relevel_not_matching_passwords: true,
            train_backwards: false,
            no_end_word_cache: false,
            save_model_versioned: false,
            password_test_fname: None,
            intermediate_fname: IN_MEMORY.to_string(),
            upstream: BTreeMap::new(),
        }
    }
}

impl GuessConfig {
    /// Load a bare `config` object
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ALICEGuessError::Config(msg));

        if self.char_bag.is_empty() {
            return fail("char_bag is empty".to_string());
        }
        if self.char_bag.chars().count() >= crate::alphabet::PAD_SYMBOL as usize {
            return fail("char_bag is too large".to_string());
        }
        if self.max_len == 0 || self.min_len > self.max_len {
            return fail(format!(
                "invalid length range [{}, {}]",
                self.min_len, self.max_len
            ));
        }
        if !(self.lower_probability_threshold > 0.0 && self.lower_probability_threshold <= 1.0) {
            return fail(format!(
                "lower_probability_threshold {} outside (0, 1]",
                self.lower_probability_threshold
            ));
        }
        if self.chunk_size_guesser == 0 || self.max_gpu_prediction_size == 0 {
            return fail("chunk_size_guesser and max_gpu_prediction_size must be positive".to_string());
        }
        if self.parallel_guessing
            && self.guess_serialization_method == SerializationMethod::Human
            && self.fork_length >= self.min_len
        {
            return fail(format!(
                "fork_length {} must be below min_len {}",
                self.fork_length, self.min_len
            ));
        }
        if self.rare_character_optimization {
            if self.rare_character_classes == 0 {
                return fail("rare_character_classes must be positive".to_string());
            }
            if self
                .rare_character_lowest_threshold
                .div_ceil(self.rare_character_classes)
                > u8::MAX as usize + 1
            {
                return fail("too many rare characters per class".to_string());
            }
        }
        if self.guess_serialization_method == SerializationMethod::DelamicoRandomWalk {
            if self.random_walk_seed_num == 0 {
                return fail("random_walk_seed_num must be positive".to_string());
            }
            if self.random_walk_seed_iterations <= self.max_len {
                log::warn!(
                    "random_walk_seed_iterations ({}) <= max_len ({}): long walks will be truncated",
                    self.random_walk_seed_iterations,
                    self.max_len
                );
            }
        }

        Ok(())
    }

    /// Pick the strategy named by `guess_serialization_method`
    pub fn strategy(&self) -> Result<GuessStrategy> {
        match self.guess_serialization_method {
            SerializationMethod::Human => Ok(GuessStrategy::Enumerate {
                threshold: self.lower_probability_threshold,
                budget: self.guess_budget,
                fork_length: self.parallel_guessing.then_some(self.fork_length),
            }),
            SerializationMethod::DelamicoRandomWalk => {
                let test_file = self.password_test_fname.clone().ok_or_else(|| {
                    ALICEGuessError::Config(
                        "delamico_random_walk needs password_test_fname".to_string(),
                    )
                })?;
                Ok(GuessStrategy::RandomWalk {
                    seeds: self.random_walk_seed_num,
                    max_depth: self.random_walk_seed_iterations,
                    rng_seed: self.random_walk_rng_seed,
                    parallel: self.parallel_guessing,
                    test_file,
                })
            }
        }
    }

    pub fn reducer_settings(&self) -> ReducerSettings {
        ReducerSettings {
            rare_character_optimization: self.rare_character_optimization,
            uppercase_character_optimization: self.uppercase_character_optimization,
            rare_character_lowest_threshold: self.rare_character_lowest_threshold,
            rare_character_classes: self.rare_character_classes,
        }
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            min_len: self.min_len,
            max_len: self.max_len,
            max_batch: self.max_gpu_prediction_size,
            relevel: self.relevel_not_matching_passwords,
            backwards: self.train_backwards,
        }
    }

    /// Checkpoint location, `None` when kept in memory
    pub fn intermediate_path(&self) -> Option<PathBuf> {
        (self.intermediate_fname != IN_MEMORY).then(|| PathBuf::from(&self.intermediate_fname))
    }

    /// Log settings that are accepted but do not steer guessing
    pub fn log_passthrough(&self) {
        if !self.upstream.is_empty() {
            let keys: Vec<&str> = self.upstream.keys().map(String::as_str).collect();
            log::info!("Upstream model settings (not used for guessing): {}", keys.join(", "));
        }
        if self.no_end_word_cache || self.save_model_versioned {
            log::info!(
                "no_end_word_cache={} save_model_versioned={} have no effect on guessing",
                self.no_end_word_cache,
                self.save_model_versioned
            );
        }
    }
}

/// File and logging arguments (the `args` object)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunArgs {
    pub arch_file: Option<PathBuf>,
    pub weight_file: Option<PathBuf>,
    /// Output path, `-` for stdout
    pub enumerate_ofile: Option<PathBuf>,
    pub pwd_file: Vec<PathBuf>,
    pub pwd_format: PasswordFormat,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

/// Combined `{"args": ..., "config": ...}` file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub args: RunArgs,
    pub config: GuessConfig,
}

impl ConfigFile {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let file: Self = serde_json::from_str(text)?;
        file.config.validate()?;
        Ok(file)
    }
}
