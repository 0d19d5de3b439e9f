//! Recovery phrase and phrase hash
//!
//! A recovery phrase is an ordered list of eight lowercase words. Order is
//! significant everywhere: the database key and the phrase hash both change
//! when two words swap places.

use crate::{Error, Result};
use rand::seq::SliceRandom;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroize;

/// Number of words in a recovery phrase
pub const PHRASE_WORD_COUNT: usize = 8;

/// Delimiter used when hashing a phrase
const HASH_DELIMITER: &str = "|";

/// Ordered eight-word recovery phrase
#[derive(Clone, PartialEq, Eq)]
pub struct RecoveryPhrase(Vec<String>);

impl RecoveryPhrase {
    /// Build a phrase from user input or storage.
    ///
    /// Each word is trimmed and lowercased. Fails unless there are exactly
    /// eight non-empty words without inner whitespace.
    pub fn from_words<I, S>(words: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words: Vec<String> = words
            .into_iter()
            .map(|w| w.as_ref().trim().to_lowercase())
            .collect();

        if words.len() != PHRASE_WORD_COUNT {
            return Err(Error::Validation(format!(
                "Recovery phrase must have {} words, got {}",
                PHRASE_WORD_COUNT,
                words.len()
            )));
        }
        if words.iter().any(|w| w.is_empty()) {
            return Err(Error::Validation("Recovery phrase contains an empty word".to_string()));
        }
        if words.iter().any(|w| w.chars().any(char::is_whitespace)) {
            return Err(Error::Validation(
                "Recovery phrase words must not contain whitespace".to_string(),
            ));
        }

        Ok(Self(words))
    }

    /// Parse a space-separated phrase
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_words(text.split_whitespace())
    }

    /// Draw eight distinct words uniformly from the BIP-39 English wordlist
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut pool: Vec<&'static str> = bip39::Language::English.word_list().to_vec();
        let (chosen, _) = pool.partial_shuffle(rng, PHRASE_WORD_COUNT);
        Self(chosen.iter().map(|w| w.to_string()).collect())
    }

    /// Words in order
    pub fn words(&self) -> &[String] {
        &self.0
    }

    /// Words joined with `sep`
    pub fn joined(&self, sep: &str) -> String {
        self.0.join(sep)
    }

    /// One-way hash used to validate a re-entered phrase
    pub fn hash(&self) -> PhraseHash {
        let combined = self.joined(HASH_DELIMITER).to_lowercase();
        let digest = Sha256::digest(combined.as_bytes());
        PhraseHash(hex::encode(digest))
    }
}

impl Drop for RecoveryPhrase {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for RecoveryPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoveryPhrase([REDACTED; {}])", self.0.len())
    }
}

/// Hex-encoded SHA-256 of a recovery phrase. Safe to back up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseHash(String);

impl PhraseHash {
    /// Wrap a stored hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_lowercase())
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Format words as numbered rows, `per_row` entries per line.
///
/// ```text
///  1. apple   2. banana
///  3. cherry   4. date
/// ```
pub fn format_mnemonic(words: &[String], per_row: usize) -> String {
    let per_row = per_row.max(1);
    words
        .iter()
        .enumerate()
        .collect::<Vec<_>>()
        .chunks(per_row)
        .map(|row| {
            row.iter()
                .map(|(idx, w)| format!("{:>2}. {}", idx + 1, w))
                .collect::<Vec<_>>()
                .join("   ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::OsRng;
    use std::collections::HashSet;

    fn sample() -> RecoveryPhrase {
        RecoveryPhrase::parse("alpha bravo charlie delta echo foxtrot golf hotel").unwrap()
    }

    #[test]
    fn test_normalizes_case_and_whitespace() {
        let p = RecoveryPhrase::from_words([
            " Alpha", "BRAVO ", "charlie", "Delta", "echo", "foxtrot", "golf", "hotel",
        ])
        .unwrap();
        assert_eq!(p, sample());
    }

    #[test]
    fn test_rejects_wrong_word_count() {
        assert!(RecoveryPhrase::parse("one two three").is_err());
        assert!(RecoveryPhrase::parse("a b c d e f g h i").is_err());
    }

    #[test]
    fn test_rejects_blank_and_inner_whitespace() {
        assert!(RecoveryPhrase::from_words(["a", "b", "c", "d", "e", "f", "g", "  "]).is_err());
        assert!(RecoveryPhrase::from_words(["a", "b", "c", "d", "e", "f", "g", "h i"]).is_err());
    }

    #[test]
    fn test_generate_draws_distinct_wordlist_words() {
        let wordlist: HashSet<&str> = bip39::Language::English.word_list().iter().copied().collect();
        for _ in 0..20 {
            let p = RecoveryPhrase::generate(&mut OsRng);
            assert_eq!(p.words().len(), PHRASE_WORD_COUNT);
            let distinct: HashSet<&String> = p.words().iter().collect();
            assert_eq!(distinct.len(), PHRASE_WORD_COUNT);
            assert!(p.words().iter().all(|w| wordlist.contains(w.as_str())));
        }
    }

    #[test]
    fn test_hash_known_value() {
        let expected = hex::encode(Sha256::digest(
            b"alpha|bravo|charlie|delta|echo|foxtrot|golf|hotel",
        ));
        assert_eq!(sample().hash().as_str(), expected);
    }

    #[test]
    fn test_hash_is_order_sensitive() {
        let mut words = sample().words().to_vec();
        words.swap(0, 7);
        let swapped = RecoveryPhrase::from_words(words).unwrap();
        assert_ne!(sample().hash(), swapped.hash());
    }

    #[test]
    fn test_stored_hash_case_insensitive() {
        let hash = sample().hash();
        assert_eq!(PhraseHash::from_hex(hash.as_str().to_uppercase()), hash);
    }

    #[test]
    fn test_format_mnemonic_rows() {
        let words = sample().words().to_vec();
        let two = format_mnemonic(&words, 2);
        let lines: Vec<&str> = two.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], " 1. alpha    2. bravo");

        let three = format_mnemonic(&words, 3);
        assert_eq!(three.lines().count(), 3);
        assert!(three.lines().last().unwrap().starts_with(" 7. golf"));
    }

    #[test]
    fn test_debug_hides_words() {
        let rendered = format!("{:?}", sample());
        assert!(!rendered.contains("alpha"));
    }

    proptest! {
        #[test]
        fn prop_hash_is_deterministic(words in proptest::collection::vec("[a-z]{3,8}", 8)) {
            let a = RecoveryPhrase::from_words(&words).unwrap();
            let b = RecoveryPhrase::from_words(&words).unwrap();
            prop_assert_eq!(a.hash(), b.hash());
        }

        #[test]
        fn prop_parse_roundtrips_joined(words in proptest::collection::vec("[a-z]{3,8}", 8)) {
            let p = RecoveryPhrase::from_words(&words).unwrap();
            let reparsed = RecoveryPhrase::parse(&p.joined(" ")).unwrap();
            prop_assert_eq!(reparsed.words(), p.words());
        }
    }
}
