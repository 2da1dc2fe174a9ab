use std::fmt;

use thiserror::Error;

use crate::words::{self, MIN_WORDS, WordsError};

/// Errors from parsing or constructing a transfer code.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("a code needs at least {MIN_WORDS} words, got {0}")]
    TooFewWords(usize),

    #[error("code contains an empty word")]
    EmptyWord,

    #[error("channel word count {channel} leaves fewer than two secret words (code has {total})")]
    InvalidSplit { channel: usize, total: usize },

    #[error(transparent)]
    Words(#[from] WordsError),
}

/// The secret tail of a transfer code.
///
/// Never transmitted in clear; only ever fed into the PAKE. The `Debug`
/// impl redacts the content so the phrase cannot leak through logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretPhrase(String);

impl SecretPhrase {
    /// PAKE input bytes (the secret words joined with `-`).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SecretPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretPhrase(..)")
    }
}

/// A one-time word code, e.g. `amber-river-stone-lamp`.
///
/// The leading `channel_words` words are public — they are hashed into the
/// discovery channel and may appear on the wire. The remaining words form
/// the [`SecretPhrase`]. How many words open the channel is an explicit
/// parameter rather than a hard-wired split; the default is a single
/// channel word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCode {
    words: Vec<String>,
    channel_words: usize,
}

impl TransferCode {
    /// Default number of words in a generated code.
    pub const DEFAULT_WORD_COUNT: usize = 4;

    /// Builds a code from pre-chosen words with an explicit split.
    ///
    /// # Errors
    ///
    /// Fails when fewer than [`MIN_WORDS`] words are given, a word is
    /// empty, or the split leaves fewer than two secret words.
    pub fn new<S: Into<String>>(
        words: impl IntoIterator<Item = S>,
        channel_words: usize,
    ) -> Result<Self, CodeError> {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        if words.len() < MIN_WORDS {
            return Err(CodeError::TooFewWords(words.len()));
        }
        if words.iter().any(String::is_empty) {
            return Err(CodeError::EmptyWord);
        }
        if channel_words == 0 || words.len() < channel_words + 2 {
            return Err(CodeError::InvalidSplit {
                channel: channel_words,
                total: words.len(),
            });
        }
        Ok(Self {
            words,
            channel_words,
        })
    }

    /// Generates a fresh random code of `count` words with the default
    /// single-channel-word split.
    ///
    /// # Errors
    ///
    /// Fails when `count` is below [`MIN_WORDS`].
    pub fn generate(count: usize) -> Result<Self, CodeError> {
        Self::new(words::random_words(count)?, 1)
    }

    /// Parses the dash-joined human form with the default split.
    ///
    /// # Errors
    ///
    /// Fails on too few words or empty segments (`amber--stone-lamp`).
    pub fn parse(input: &str) -> Result<Self, CodeError> {
        Self::parse_with_split(input, 1)
    }

    /// Parses the dash-joined human form with an explicit channel split.
    ///
    /// # Errors
    ///
    /// Same conditions as [`TransferCode::new`].
    pub fn parse_with_split(input: &str, channel_words: usize) -> Result<Self, CodeError> {
        Self::new(input.trim().split('-').map(str::to_string), channel_words)
    }

    /// The public part of the code, joined with `-`. Safe to hash into
    /// discovery keys.
    #[must_use]
    pub fn channel_phrase(&self) -> String {
        self.words[..self.channel_words].join("-")
    }

    /// The secret part of the code. Never transmitted.
    #[must_use]
    pub fn secret_phrase(&self) -> SecretPhrase {
        SecretPhrase(self.words[self.channel_words..].join("-"))
    }

    #[must_use]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }
}

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.words.join("-"))
    }
}
