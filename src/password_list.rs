//! Password list input
//!
//! Two formats are read:
//! - `list`: one password per line
//! - `tsv`: `password<TAB>count`, count being the number of occurrences
//!
//! Lines that are not valid UTF-8 or (for TSV) lack a usable count are skipped
//! with a warning.

use crate::alphabet::CharacterCounter;
use crate::{ALICEGuessError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// On-disk layout of a password file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordFormat {
    #[default]
    List,
    Tsv,
}

impl FromStr for PasswordFormat {
    type Err = ALICEGuessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "list" => Ok(Self::List),
            "tsv" => Ok(Self::Tsv),
            other => Err(ALICEGuessError::Config(format!(
                "unknown password format '{}', expected list or tsv",
                other
            ))),
        }
    }
}

/// Passwords with occurrence counts
#[derive(Debug, Clone, Default)]
pub struct PasswordList {
    entries: Vec<(String, u64)>,
    skipped_lines: usize,
}

impl PasswordList {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(p, w)| (p.into(), w)).collect(),
            skipped_lines: 0,
        }
    }

    pub fn read<P: AsRef<Path>>(path: P, format: PasswordFormat) -> Result<Self> {
        log::info!("Reading passwords from {}", path.as_ref().display());
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), format)
    }

    /// Read several files in order into one list
    pub fn concat(paths: &[PathBuf], format: PasswordFormat) -> Result<Self> {
        let mut all = Self::default();
        for path in paths {
            let list = Self::read(path, format)?;
            all.skipped_lines += list.skipped_lines;
            all.entries.extend(list.entries);
        }
        Ok(all)
    }

    pub fn from_reader<R: BufRead>(reader: R, format: PasswordFormat) -> Result<Self> {
        let mut list = Self::default();

        for (line_no, raw) in reader.split(b'\n').enumerate() {
            let raw = raw?;
            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line.trim_end_matches(['\r', '\n']),
                Err(_) => {
                    log::warn!("Skipping line {}: not valid UTF-8", line_no + 1);
                    list.skipped_lines += 1;
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            match format {
                PasswordFormat::List => list.entries.push((line.to_string(), 1)),
                PasswordFormat::Tsv => match parse_tsv_line(line) {
                    Some(entry) => list.entries.push(entry),
                    None => {
                        log::warn!("Skipping line {}: expected password<TAB>count", line_no + 1);
                        list.skipped_lines += 1;
                    }
                },
            }
        }

        Ok(list)
    }

    /// Keep only passwords the counter accepts, recording their characters
    pub fn filtered(self, counter: &mut CharacterCounter) -> Self {
        let total = self.entries.len();
        let entries: Vec<(String, u64)> = self
            .entries
            .into_iter()
            .filter(|(pwd, weight)| counter.observe(pwd, *weight))
            .collect();
        log::info!("Filtered {} of {} passwords", total - entries.len(), total);

        Self {
            entries,
            skipped_lines: self.skipped_lines,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(p, w)| (p.as_str(), *w))
    }

    pub fn passwords(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(p, _)| p.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }
}

fn parse_tsv_line(line: &str) -> Option<(String, u64)> {
    let (pwd, count) = line.rsplit_once('\t')?;
    let count: f64 = count.trim().parse().ok()?;
    if !count.is_finite() || count < 0.0 {
        return None;
    }
    Some((pwd.to_string(), count.round().max(1.0) as u64))
}
