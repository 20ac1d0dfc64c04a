//! Character n-gram oracle
//!
//! A compact stand-in for the recurrent password model: next-symbol counts for
//! every context suffix up to `context_length`, combined with Witten-Bell
//! interpolation down to an add-one unigram. Every predicted distribution sums to
//! exactly 1 and every symbol keeps non-zero mass.
//!
//! ```text
//! P_0(s)     = (c(s) + 1) / (N + V)
//! P_k(s | h) = (c(h, s) + T(h) * P_{k-1}(s)) / (N(h) + T(h))
//! ```
//!
//! Files:
//! - architecture: JSON ([`NgramArchitecture`]), includes what is needed to rebuild
//!   the alphabet reducer the model was trained with
//! - weights: bincode counts

use crate::alphabet::{AlphabetReducer, CharacterCounter, ReducerSettings, Symbol};
use crate::config::GuessConfig;
use crate::oracle::{ContextWindow, Distribution, Oracle};
use crate::password_list::PasswordList;
use crate::{ALICEGuessError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tempfile::NamedTempFile;

/// Model type tag written to architecture files
pub const NGRAM_MODEL_TYPE: &str = "ngram";

/// Architecture file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NgramArchitecture {
    pub model_type: String,
    pub context_length: usize,
    pub char_bag: String,
    pub min_len: usize,
    pub max_len: usize,
    pub train_backwards: bool,
    pub reducer: ReducerSettings,
    /// Corpus character counts, for rebuilding the reducer
    pub frequencies: Vec<(char, u64)>,
    pub trained_passwords: u64,
    pub created_at: String,
}

impl NgramArchitecture {
    pub fn new(config: &GuessConfig, counter: &CharacterCounter) -> Self {
        Self {
            model_type: NGRAM_MODEL_TYPE.to_string(),
            context_length: config.context_length,
            char_bag: config.char_bag.clone(),
            min_len: config.min_len,
            max_len: config.max_len,
            train_backwards: config.train_backwards,
            reducer: config.reducer_settings(),
            frequencies: counter.frequencies().iter().map(|(&c, &f)| (c, f)).collect(),
            trained_passwords: counter.accepted(),
            created_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// Rebuild the alphabet reducer used at training time
    pub fn reducer(&self) -> AlphabetReducer {
        let mut counter = CharacterCounter::new(&self.char_bag, 0, usize::MAX);
        for &(c, f) in &self.frequencies {
            let pwd = c.to_string();
            counter.observe(&pwd, f);
        }
        AlphabetReducer::build(&self.char_bag, &self.reducer, &counter)
    }

    /// Force the settings the model was trained with onto a guessing config
    pub fn apply_to(&self, config: &mut GuessConfig) {
        if config.char_bag != self.char_bag
            || config.reducer_settings() != self.reducer
            || config.train_backwards != self.train_backwards
        {
            log::warn!("Alphabet settings differ from the model architecture; using the model's");
        }
        config.char_bag = self.char_bag.clone();
        config.rare_character_optimization = self.reducer.rare_character_optimization;
        config.uppercase_character_optimization = self.reducer.uppercase_character_optimization;
        config.rare_character_lowest_threshold = self.reducer.rare_character_lowest_threshold;
        config.rare_character_classes = self.reducer.rare_character_classes;
        config.train_backwards = self.train_backwards;
        config.context_length = self.context_length;
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let arch: Self = serde_json::from_str(&text)?;
        if arch.model_type != NGRAM_MODEL_TYPE {
            return Err(ALICEGuessError::Config(format!(
                "unsupported model type '{}'",
                arch.model_type
            )));
        }
        Ok(arch)
    }
}

/// Interpolated character n-gram model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NgramOracle {
    order: usize,
    alphabet_size: usize,
    /// `tables[k]`: context of length k -> next-symbol counts (end-of-string last)
    tables: Vec<HashMap<Vec<Symbol>, Vec<u64>>>,
}

impl NgramOracle {
    pub fn new(alphabet_size: usize, order: usize) -> Self {
        Self {
            order,
            alphabet_size,
            tables: vec![HashMap::new(); order + 1],
        }
    }

    /// Train on every password of `list`, reduced and (optionally) reversed
    pub fn fit(
        list: &PasswordList,
        reducer: &AlphabetReducer,
        order: usize,
        backwards: bool,
    ) -> Result<Self> {
        let mut model = Self::new(reducer.alphabet().len(), order);
        for (pwd, weight) in list.iter() {
            let mut seq = reducer.reduce_str(pwd)?;
            if backwards {
                seq.reverse();
            }
            model.observe(&seq, weight);
        }
        log::info!(
            "Trained order-{} n-gram model on {} passwords ({} contexts)",
            order,
            list.len(),
            model.context_count()
        );
        Ok(model)
    }

    /// Count every transition of one sequence (oracle order)
    pub fn observe(&mut self, seq: &[Symbol], weight: u64) {
        let end = self.alphabet_size as Symbol;
        let dist_len = self.alphabet_size + 1;

        for i in 0..=seq.len() {
            let window = ContextWindow::from_prefix(&seq[..i], self.order);
            let next = seq.get(i).copied().unwrap_or(end) as usize;
            for k in 0..=self.order {
                let key = window.symbols()[self.order - k..].to_vec();
                let counts = self.tables[k]
                    .entry(key)
                    .or_insert_with(|| vec![0; dist_len]);
                counts[next] += weight;
            }
        }
    }

    /// Interpolated distribution for one padded context window
    pub fn distribution(&self, window: &[Symbol]) -> Distribution {
        let dist_len = self.alphabet_size + 1;

        let root: &[Symbol] = &[];
        let unigram = self.tables[0].get(root);
        let total: u64 = unigram.map(|c| c.iter().sum()).unwrap_or(0);
        let mut dist: Distribution = (0..dist_len)
            .map(|s| {
                let c = unigram.map_or(0, |c| c[s]);
                (c as f64 + 1.0) / (total as f64 + dist_len as f64)
            })
            .collect();

        let usable = self.order.min(window.len());
        for k in 1..=usable {
            let key = &window[window.len() - k..];
            let Some(counts) = self.tables[k].get(key) else {
                break;
            };
            let n: u64 = counts.iter().sum();
            let t = counts.iter().filter(|&&c| c > 0).count() as f64;
            if n == 0 {
                break;
            }
            let denom = n as f64 + t;
            for (p, &c) in dist.iter_mut().zip(counts.iter()) {
                *p = (c as f64 + t * *p) / denom;
            }
        }

        dist
    }

    /// Number of distinct contexts stored across all orders
    pub fn context_count(&self) -> usize {
        self.tables.iter().map(HashMap::len).sum()
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Write weights atomically (temp file + rename)
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let temp_file = NamedTempFile::new_in(parent)?;
        {
            let writer = BufWriter::new(&temp_file);
            bincode::serialize_into(writer, self)?;
        }
        temp_file
            .persist(path)
            .map_err(|e| ALICEGuessError::Io(e.error))?;
        Ok(())
    }

    pub fn load_weights<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let model: Self = bincode::deserialize_from(reader)?;
        if model.tables.len() != model.order + 1 {
            return Err(ALICEGuessError::Config(
                "weight file has inconsistent context tables".to_string(),
            ));
        }
        Ok(model)
    }
}

impl Oracle for NgramOracle {
    fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    fn context_length(&self) -> usize {
        self.order
    }

    fn predict(&self, contexts: &[ContextWindow]) -> Result<Vec<Distribution>> {
        Ok(contexts
            .par_iter()
            .map(|ctx| self.distribution(ctx.symbols()))
            .collect())
    }
}
