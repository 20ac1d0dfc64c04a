//! Alphabet reduction for ALICE-Guess
//!
//! Folds uppercase and rare characters into a smaller working alphabet so the
//! probability tree stays tractable, and undoes the folding exactly when guesses
//! are written out.
//!
//! ```text
//! original char ──CaseFold──▶ (lowercase, case bit) ──RareFold──▶ (class representative, member)
//! ```
//!
//! Each fold is a bijection between a character and a (character, variant) pair,
//! so the composition is reversible: `expand(reduce(x)) == x` for every character
//! of the configured bag.

use crate::{ALICEGuessError, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};

/// Index of a character in the working alphabet
pub type Symbol = u16;

/// Left padding inside context windows
pub const PAD_SYMBOL: Symbol = Symbol::MAX;

/// Default character bag (letters, digits and the printable ASCII symbols)
pub const DEFAULT_CHAR_BAG: &str = concat!(
    "abcdefghijklmnopqrstuvwxyz",
    "ABCDEFGHIJKLMNOPQRSTUVWXYZ",
    "0123456789",
    "~!@#$%^&*(),.<>/?'\"{}[]\\|-_=+;: `"
);

/// Working alphabet the oracle predicts over.
///
/// Symbols are assigned in character order, so comparing symbol sequences is the
/// same as comparing the decoded strings. The end-of-string symbol is one past the
/// last character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alphabet {
    chars: Vec<char>,
    index: HashMap<char, Symbol>,
}

impl Alphabet {
    pub fn new<I: IntoIterator<Item = char>>(chars: I) -> Self {
        let mut chars: Vec<char> = chars.into_iter().collect();
        chars.sort_unstable();
        chars.dedup();

        let index = chars
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as Symbol))
            .collect();

        Self { chars, index }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// End-of-string symbol
    pub fn end_symbol(&self) -> Symbol {
        self.chars.len() as Symbol
    }

    /// Length of a next-symbol distribution (characters + end-of-string)
    pub fn distribution_len(&self) -> usize {
        self.chars.len() + 1
    }

    pub fn symbol_of(&self, c: char) -> Option<Symbol> {
        self.index.get(&c).copied()
    }

    pub fn char_of(&self, symbol: Symbol) -> Option<char> {
        self.chars.get(symbol as usize).copied()
    }

    pub fn chars(&self) -> &[char] {
        &self.chars
    }
}

/// A reversible character fold.
///
/// `fold` maps a character to a representative plus a variant tag, `unfold`
/// inverts it, and `variants` lists every character folding onto a representative
/// with its share of the representative's probability mass.
pub trait SymbolFold {
    fn fold(&self, c: char) -> (char, u8);

    fn unfold(&self, c: char, variant: u8) -> Option<char>;

    fn variants(&self, c: char) -> SmallVec<[(char, f64); 4]>;
}

/// Folds ASCII uppercase letters onto their lowercase letter with a case bit
#[derive(Debug, Clone)]
pub struct CaseFold {
    /// lowercase letter -> share of mass belonging to the uppercase form
    upper_share: HashMap<char, f64>,
}

impl CaseFold {
    pub fn new(bag: &[char], counter: &CharacterCounter) -> Self {
        let mut upper_share = HashMap::new();
        for &c in bag.iter().filter(|c| c.is_ascii_uppercase()) {
            let lower = c.to_ascii_lowercase();
            if !bag.contains(&lower) {
                continue;
            }
            let upper_count = counter.frequency(c) as f64 + 1.0;
            let lower_count = counter.frequency(lower) as f64 + 1.0;
            upper_share.insert(lower, upper_count / (upper_count + lower_count));
        }
        Self { upper_share }
    }

    /// Does this fold remove `c` from the working alphabet?
    pub fn folds_away(&self, c: char) -> bool {
        c.is_ascii_uppercase() && self.upper_share.contains_key(&c.to_ascii_lowercase())
    }
}

impl SymbolFold for CaseFold {
    fn fold(&self, c: char) -> (char, u8) {
        if self.folds_away(c) {
            (c.to_ascii_lowercase(), 1)
        } else {
            (c, 0)
        }
    }

    fn unfold(&self, c: char, variant: u8) -> Option<char> {
        match variant {
            0 => Some(c),
            1 if self.upper_share.contains_key(&c) => Some(c.to_ascii_uppercase()),
            _ => None,
        }
    }

    fn variants(&self, c: char) -> SmallVec<[(char, f64); 4]> {
        let mut out = SmallVec::new();
        match self.upper_share.get(&c) {
            Some(&share) => {
                out.push((c, 1.0 - share));
                out.push((c.to_ascii_uppercase(), share));
            }
            None => out.push((c, 1.0)),
        }
        out
    }
}

/// One equivalence class of rare characters
#[derive(Debug, Clone)]
pub struct RareClass {
    /// Character standing in for the whole class (first member)
    pub representative: char,
    /// Members with their share of the class mass
    pub members: Vec<(char, f64)>,
}

/// Folds the least frequent characters into a bounded number of classes
#[derive(Debug, Clone)]
pub struct RareFold {
    classes: Vec<RareClass>,
    lookup: HashMap<char, (usize, u8)>,
}

impl RareFold {
    /// `rare` is ordered rarest first; it is split into at most `class_count`
    /// contiguous classes.
    pub fn new(rare: &[char], class_count: usize, frequency: impl Fn(char) -> u64) -> Self {
        let mut classes = Vec::new();
        let mut lookup = HashMap::new();

        if !rare.is_empty() {
            let class_count = class_count.clamp(1, rare.len());
            let per_class = rare.len().div_ceil(class_count);

            for (class_idx, group) in rare.chunks(per_class).enumerate() {
                let total: f64 = group.iter().map(|&c| frequency(c) as f64 + 1.0).sum();
                let members: Vec<(char, f64)> = group
                    .iter()
                    .map(|&c| (c, (frequency(c) as f64 + 1.0) / total))
                    .collect();
                for (member_idx, &c) in group.iter().enumerate() {
                    lookup.insert(c, (class_idx, member_idx as u8));
                }
                classes.push(RareClass {
                    representative: group[0],
                    members,
                });
            }
        }

        Self { classes, lookup }
    }

    pub fn classes(&self) -> &[RareClass] {
        &self.classes
    }

    fn class_of_representative(&self, c: char) -> Option<&RareClass> {
        match self.lookup.get(&c) {
            Some(&(class_idx, 0)) => self.classes.get(class_idx),
            _ => None,
        }
    }
}

impl SymbolFold for RareFold {
    fn fold(&self, c: char) -> (char, u8) {
        match self.lookup.get(&c) {
            Some(&(class_idx, member)) => (self.classes[class_idx].representative, member),
            None => (c, 0),
        }
    }

    fn unfold(&self, c: char, variant: u8) -> Option<char> {
        match self.class_of_representative(c) {
            Some(class) => class.members.get(variant as usize).map(|&(m, _)| m),
            None if variant == 0 => Some(c),
            None => None,
        }
    }

    fn variants(&self, c: char) -> SmallVec<[(char, f64); 4]> {
        match self.class_of_representative(c) {
            Some(class) => class.members.iter().copied().collect(),
            None => smallvec::smallvec![(c, 1.0)],
        }
    }
}

/// Reducer switches, usually taken from the guessing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerSettings {
    pub rare_character_optimization: bool,
    pub uppercase_character_optimization: bool,
    pub rare_character_lowest_threshold: usize,
    pub rare_character_classes: usize,
}

impl Default for ReducerSettings {
    fn default() -> Self {
        Self {
            rare_character_optimization: false,
            uppercase_character_optimization: false,
            rare_character_lowest_threshold: 20,
            rare_character_classes: 1,
        }
    }
}

/// A reduced character: working symbol plus the side-channel needed to undo the folds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedChar {
    pub symbol: Symbol,
    /// One variant tag per fold, in fold order
    pub trail: SmallVec<[u8; 2]>,
}

/// Reversible mapping between the character bag and the working alphabet
#[derive(Debug, Clone)]
pub struct AlphabetReducer {
    original: Vec<char>,
    case: Option<CaseFold>,
    rare: Option<RareFold>,
    alphabet: Alphabet,
    /// Per working symbol: original characters with log-share, most likely first
    expansions: Vec<Vec<(char, f64)>>,
}

impl AlphabetReducer {
    /// Identity reducer over `bag`
    pub fn identity(bag: &str) -> Self {
        Self::build(bag, &ReducerSettings::default(), &CharacterCounter::new(bag, 0, usize::MAX))
    }

    /// Build the reducer from the bag, the switches and corpus statistics
    pub fn build(bag: &str, settings: &ReducerSettings, counter: &CharacterCounter) -> Self {
        let original = Alphabet::new(bag.chars()).chars().to_vec();

        let case = settings
            .uppercase_character_optimization
            .then(|| CaseFold::new(&original, counter));

        // Frequencies in the case-folded space
        let mut folded_freq: BTreeMap<char, u64> = BTreeMap::new();
        for &c in &original {
            let folded = case.as_ref().map_or(c, |f| f.fold(c).0);
            *folded_freq.entry(folded).or_insert(0) += counter.frequency(c);
        }

        let rare = settings.rare_character_optimization.then(|| {
            let exclude_upper = settings.uppercase_character_optimization;
            let mut candidates: Vec<(u64, char)> = folded_freq
                .iter()
                .filter(|(c, _)| !(exclude_upper && c.is_ascii_uppercase()))
                .map(|(&c, &f)| (f, c))
                .collect();
            candidates.sort_unstable();
            let rare: Vec<char> = candidates
                .iter()
                .take(settings.rare_character_lowest_threshold)
                .map(|&(_, c)| c)
                .collect();
            RareFold::new(&rare, settings.rare_character_classes, |c| {
                folded_freq.get(&c).copied().unwrap_or(0)
            })
        });

        let mut reducer = Self {
            alphabet: Alphabet::new(std::iter::empty()),
            original,
            case,
            rare,
            expansions: Vec::new(),
        };

        let working: Vec<char> = reducer
            .original
            .iter()
            .map(|&c| reducer.fold_chain(c).0)
            .collect();
        reducer.alphabet = Alphabet::new(working);
        reducer.expansions = reducer
            .alphabet
            .chars()
            .iter()
            .map(|&c| reducer.expand_all(c))
            .collect();

        reducer
    }

    fn folds(&self) -> SmallVec<[&dyn SymbolFold; 2]> {
        let mut folds: SmallVec<[&dyn SymbolFold; 2]> = SmallVec::new();
        if let Some(case) = &self.case {
            folds.push(case);
        }
        if let Some(rare) = &self.rare {
            folds.push(rare);
        }
        folds
    }

    fn fold_chain(&self, c: char) -> (char, SmallVec<[u8; 2]>) {
        let mut current = c;
        let mut trail = SmallVec::new();
        for fold in self.folds() {
            let (next, variant) = fold.fold(current);
            current = next;
            trail.push(variant);
        }
        (current, trail)
    }

    fn expand_all(&self, c: char) -> Vec<(char, f64)> {
        let mut current: Vec<(char, f64)> = vec![(c, 0.0)];
        for fold in self.folds().into_iter().rev() {
            current = current
                .into_iter()
                .flat_map(|(x, log_share)| {
                    fold.variants(x)
                        .into_iter()
                        .map(move |(y, share)| (y, log_share + share.ln()))
                })
                .collect();
        }
        current.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        current
    }

    /// Map an original character into the working alphabet
    pub fn reduce(&self, c: char) -> Result<ReducedChar> {
        if self.original.binary_search(&c).is_err() {
            return Err(ALICEGuessError::UnknownSymbol(c));
        }
        let (folded, trail) = self.fold_chain(c);
        let symbol = self
            .alphabet
            .symbol_of(folded)
            .ok_or(ALICEGuessError::UnknownSymbol(c))?;
        Ok(ReducedChar { symbol, trail })
    }

    /// Undo `reduce`
    pub fn expand(&self, reduced: &ReducedChar) -> Result<char> {
        let mut current = self
            .alphabet
            .char_of(reduced.symbol)
            .ok_or_else(|| ALICEGuessError::Config(format!("no symbol {}", reduced.symbol)))?;
        let folds = self.folds();
        if reduced.trail.len() != folds.len() {
            return Err(ALICEGuessError::Config(format!(
                "variant trail of length {} for {} folds",
                reduced.trail.len(),
                folds.len()
            )));
        }
        for (fold, &variant) in folds.iter().zip(reduced.trail.iter()).rev() {
            current = fold
                .unfold(current, variant)
                .ok_or(ALICEGuessError::UnknownSymbol(current))?;
        }
        Ok(current)
    }

    /// Reduce a whole string, dropping the side-channel
    pub fn reduce_str(&self, s: &str) -> Result<Vec<Symbol>> {
        s.chars().map(|c| self.reduce(c).map(|r| r.symbol)).collect()
    }

    /// Original characters behind a working symbol, with log-shares, most likely first
    pub fn expansions(&self, symbol: Symbol) -> &[(char, f64)] {
        self.expansions
            .get(symbol as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    /// The configured character bag, sorted
    pub fn original_chars(&self) -> &[char] {
        &self.original
    }

    pub fn is_identity(&self) -> bool {
        self.alphabet.len() == self.original.len()
    }

    pub fn rare_classes(&self) -> &[RareClass] {
        self.rare.as_ref().map(RareFold::classes).unwrap_or(&[])
    }
}

/// Corpus character statistics and the password validity filter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterCounter {
    char_bag: String,
    min_len: usize,
    max_len: usize,
    frequencies: BTreeMap<char, u64>,
    total_characters: u64,
    accepted: u64,
    filtered_out: u64,
    longest: usize,
}

impl CharacterCounter {
    pub fn new(char_bag: &str, min_len: usize, max_len: usize) -> Self {
        Self {
            char_bag: char_bag.to_string(),
            min_len,
            max_len,
            frequencies: BTreeMap::new(),
            total_characters: 0,
            accepted: 0,
            filtered_out: 0,
            longest: 0,
        }
    }

    /// Every character in the bag and length within bounds
    pub fn is_valid(&self, pwd: &str) -> bool {
        let len = pwd.chars().count();
        len >= self.min_len && len <= self.max_len && pwd.chars().all(|c| self.char_bag.contains(c))
    }

    /// Filter a password, counting its characters `weight` times when accepted
    pub fn observe(&mut self, pwd: &str, weight: u64) -> bool {
        let len = pwd.chars().count();
        self.longest = self.longest.max(len);

        if !self.is_valid(pwd) {
            self.filtered_out += 1;
            return false;
        }

        self.accepted += 1;
        self.total_characters += len as u64 * weight;
        for c in pwd.chars() {
            *self.frequencies.entry(c).or_insert(0) += weight;
        }
        true
    }

    pub fn frequency(&self, c: char) -> u64 {
        self.frequencies.get(&c).copied().unwrap_or(0)
    }

    pub fn frequencies(&self) -> &BTreeMap<char, u64> {
        &self.frequencies
    }

    pub fn total_characters(&self) -> u64 {
        self.total_characters
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn filtered_out(&self) -> u64 {
        self.filtered_out
    }

    pub fn longest(&self) -> usize {
        self.longest
    }

    pub fn char_bag(&self) -> &str {
        &self.char_bag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skewed_counter() -> CharacterCounter {
        let mut counter = CharacterCounter::new(DEFAULT_CHAR_BAG, 1, 40);
        for pwd in ["password", "Password1", "letmein", "dragon", "qwerty123", "abc!"] {
            counter.observe(pwd, 10);
        }
        counter
    }

    #[test]
    fn test_identity_reducer() {
        let reducer = AlphabetReducer::identity("ba");
        assert!(reducer.is_identity());
        assert_eq!(reducer.alphabet().chars(), &['a', 'b']);
        assert_eq!(reducer.alphabet().end_symbol(), 2);
        assert_eq!(reducer.reduce_str("ab").unwrap(), vec![0, 1]);
        assert_eq!(reducer.expansions(1), &[('b', 0.0)]);
    }

    #[test]
    fn test_expand_reduce_is_identity_for_every_bag_character() {
        let counter = skewed_counter();
        for (rare, upper, classes) in [(false, false, 1), (true, false, 1), (false, true, 1), (true, true, 3)] {
            let settings = ReducerSettings {
                rare_character_optimization: rare,
                uppercase_character_optimization: upper,
                rare_character_lowest_threshold: 20,
                rare_character_classes: classes,
            };
            let reducer = AlphabetReducer::build(DEFAULT_CHAR_BAG, &settings, &counter);
            for c in DEFAULT_CHAR_BAG.chars() {
                let reduced = reducer.reduce(c).unwrap();
                assert_eq!(reducer.expand(&reduced).unwrap(), c, "settings {:?}", settings);
            }
        }
    }

    #[test]
    fn test_unknown_symbol() {
        let reducer = AlphabetReducer::identity("abc");
        assert!(matches!(reducer.reduce('z'), Err(ALICEGuessError::UnknownSymbol('z'))));
        assert!(reducer.reduce_str("abz").is_err());
    }

    #[test]
    fn test_uppercase_fold_shrinks_alphabet() {
        let counter = skewed_counter();
        let settings = ReducerSettings {
            uppercase_character_optimization: true,
            ..ReducerSettings::default()
        };
        let reducer = AlphabetReducer::build(DEFAULT_CHAR_BAG, &settings, &counter);

        assert_eq!(reducer.alphabet().len(), DEFAULT_CHAR_BAG.chars().count() - 26);
        assert_eq!(
            reducer.reduce('P').unwrap().symbol,
            reducer.reduce('p').unwrap().symbol
        );

        // 'a' seen 40 times, 'A' never
        let a = reducer.reduce('A').unwrap().symbol;
        let shares = reducer.expansions(a);
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].0, 'a');
        assert!((shares[1].1.exp() - 1.0 / 42.0).abs() < 1e-12);
        let total: f64 = shares.iter().map(|(_, ls)| ls.exp()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rare_fold_bounded_classes() {
        let counter = skewed_counter();
        let settings = ReducerSettings {
            rare_character_optimization: true,
            rare_character_lowest_threshold: 20,
            rare_character_classes: 4,
            ..ReducerSettings::default()
        };
        let reducer = AlphabetReducer::build(DEFAULT_CHAR_BAG, &settings, &counter);

        assert_eq!(reducer.rare_classes().len(), 4);
        assert_eq!(
            reducer.alphabet().len(),
            DEFAULT_CHAR_BAG.chars().count() - 20 + 4
        );
        // Frequent characters are never folded
        let a = reducer.reduce('a').unwrap();
        assert_eq!(reducer.expansions(a.symbol).len(), 1);
    }

    #[test]
    fn test_expansion_shares_sum_to_one() {
        let counter = skewed_counter();
        let settings = ReducerSettings {
            rare_character_optimization: true,
            uppercase_character_optimization: true,
            rare_character_lowest_threshold: 30,
            rare_character_classes: 2,
        };
        let reducer = AlphabetReducer::build(DEFAULT_CHAR_BAG, &settings, &counter);
        let mut covered = 0;
        for symbol in 0..reducer.alphabet().len() as Symbol {
            let exp = reducer.expansions(symbol);
            covered += exp.len();
            let total: f64 = exp.iter().map(|(_, ls)| ls.exp()).sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert!(exp.windows(2).all(|w| w[0].1 >= w[1].1));
        }
        assert_eq!(covered, DEFAULT_CHAR_BAG.chars().count());
    }

    #[test]
    fn test_counter_filters_passwords() {
        let mut counter = CharacterCounter::new("abc", 2, 3);
        assert!(counter.observe("ab", 1));
        assert!(!counter.observe("a", 1));
        assert!(!counter.observe("abcd", 1));
        assert!(!counter.observe("abz", 1));
        assert!(counter.observe("cab", 2));

        assert_eq!(counter.accepted(), 2);
        assert_eq!(counter.filtered_out(), 3);
        assert_eq!(counter.frequency('a'), 3);
        assert_eq!(counter.frequency('c'), 2);
        assert_eq!(counter.total_characters(), 8);
        assert_eq!(counter.longest(), 4);
    }
}
