//! # ALICE-Guess
//!
//! Password guess enumeration and guess-number estimation.
//!
//! A character-level model trained on a password corpus is queried as a
//! next-character oracle. ALICE-Guess turns that oracle into either an explicit
//! stream of guesses in descending probability order, or a Monte Carlo estimate
//! of where a test password falls in that order (its "guess number") without
//! enumerating the guess space.
//!
//! ## Pipeline
//!
//! ```text
//! Character bag
//!     ↓ AlphabetReducer (case / rare folding)
//! Working alphabet
//!     ↓ OracleAdapter (batched, validated, re-leveled)
//! P(next | context)
//!     ├─ Enumerator: best-first search above a probability floor
//!     └─ RandomWalkEstimator: N(p) ≈ mean of 1/p_i over sampled walks with p_i ≥ p
//!     ↓ GuessSerializer (expand to original characters, chunked TSV)
//! enumerate_ofile
//! ```
//!
//! ## Example
//!
//! ```rust
//! use alice_guess::{AlphabetReducer, GuessConfig, Guesser, StaticOracle};
//!
//! let reducer = AlphabetReducer::identity("ab");
//! let oracle = StaticOracle::new(vec![0.6, 0.3, 0.1], 2);
//! let config = GuessConfig {
//!     min_len: 1,
//!     max_len: 2,
//!     lower_probability_threshold: 0.05,
//!     ..GuessConfig::default()
//! };
//!
//! let guesser = Guesser::new(&oracle, &reducer, &config).unwrap();
//! let mut out = Vec::new();
//! guesser.enumerate_to(&mut out).unwrap();
//!
//! let text = String::from_utf8(out).unwrap();
//! assert!(text.starts_with("aa\t"));
//! ```

// --- Global Allocator: mimalloc (Microsoft's high-performance allocator) ---
#[cfg(not(target_env = "msvc"))]
use mimalloc::MiMalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod alphabet;
pub mod checkpoint;
pub mod config;
pub mod enumerator;
pub mod guesser;
pub mod ngram_oracle;
pub mod oracle;
pub mod password_list;
pub mod random_walk;
pub mod serializer;

pub use alphabet::{
    Alphabet, AlphabetReducer, CaseFold, CharacterCounter, RareClass, RareFold, ReducedChar,
    ReducerSettings, Symbol, SymbolFold, DEFAULT_CHAR_BAG, PAD_SYMBOL,
};
pub use checkpoint::{model_fingerprint, IntermediateStore, RunCursor, RunId};
pub use config::{ConfigFile, GuessConfig, GuessStrategy, RunArgs, SerializationMethod};
pub use enumerator::{
    merge_partitions, EnumerationStop, Enumerator, GuessChunk, GuessSource, MergedEnumeration,
    ParallelEnumerator, ReducedGuess,
};
pub use guesser::{Guesser, RunSummary};
pub use ngram_oracle::{NgramArchitecture, NgramOracle};
pub use oracle::{
    AdapterSettings, ContextWindow, Distribution, FnOracle, Oracle, OracleAdapter, StaticOracle,
    MASS_TOLERANCE,
};
pub use password_list::{PasswordFormat, PasswordList};
pub use random_walk::{
    score_passwords, GuessNumberEstimate, RandomWalkEstimator, TargetFailure, TargetOutcome,
    WalkTable,
};
pub use serializer::{EstimateRecord, GuessRecord, GuessSerializer};

use thiserror::Error;

/// ALICE-Guess version
pub const ALICE_GUESS_VERSION: (u8, u8) = (1, 0);

/// ALICE-Guess fingerprint
pub const ALICE_GUESS_FINGERPRINT: &str = "ALICE-GUESS-v1.0";

/// Error types for ALICE-Guess operations
#[derive(Error, Debug)]
pub enum ALICEGuessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode error: {0}")]
    Bincode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown symbol {0:?}: not part of the model alphabet")]
    UnknownSymbol(char),

    #[error("Alphabet mismatch: reducer has {reducer} symbols, oracle predicts {oracle}")]
    AlphabetMismatch { reducer: usize, oracle: usize },

    #[error("Oracle fault: distribution {index} has total mass {sum}")]
    OracleFault { index: usize, sum: f64 },

    #[error("Run cancelled")]
    Cancelled,
}

impl From<bincode::Error> for ALICEGuessError {
    fn from(e: bincode::Error) -> Self {
        ALICEGuessError::Bincode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ALICEGuessError>;
