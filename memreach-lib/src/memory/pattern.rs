use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,
    #[error("invalid pattern token {0:?}")]
    InvalidToken(String),
}

/// Radix of the textual byte tokens. Every token is two characters wide
/// regardless of radix, e.g. hex `"4A"` or decimal `"74"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Radix {
    Hex,
    Dec,
}

impl Radix {
    pub fn base(self) -> u32 {
        match self {
            Radix::Hex => 16,
            Radix::Dec => 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternByte {
    Byte(u8),
    Any,
}

impl PatternByte {
    fn parse(token: &str, radix: Radix) -> Result<Self, PatternError> {
        match token {
            "?" | "??" => Ok(Self::Any),
            _ if token.len() == 2 => u8::from_str_radix(token, radix.base())
                .map(Self::Byte)
                .map_err(|_| PatternError::InvalidToken(token.to_string())),
            _ => Err(PatternError::InvalidToken(token.to_string())),
        }
    }
}

impl PartialEq<u8> for PatternByte {
    fn eq(&self, other: &u8) -> bool {
        match self {
            Self::Byte(byte) => byte == other,
            Self::Any => true,
        }
    }
}

/// A byte pattern with optional wildcard positions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<PatternByte>,
}

impl Pattern {
    /// Parses pattern text in the given radix.
    ///
    /// Tokens are either separated by whitespace or packed two characters
    /// per byte; a leading separator is trimmed. `??` (or `?` in separated
    /// form) marks a wildcard position.
    pub fn parse(text: &str, radix: Radix) -> Result<Self, PatternError> {
        let text = text.trim_start_matches(' ');
        let mut bytes = Vec::new();

        if text.contains(char::is_whitespace) {
            for token in text.split_ascii_whitespace() {
                bytes.push(PatternByte::parse(token, radix)?);
            }
        } else {
            for chunk in text.as_bytes().chunks(2) {
                let token = std::str::from_utf8(chunk)
                    .map_err(|_| PatternError::InvalidToken(String::from_utf8_lossy(chunk).into_owned()))?;
                bytes.push(PatternByte::parse(token, radix)?);
            }
        }

        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }

        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn matches(&self, window: &[u8]) -> bool {
        self == window
    }

    /// Offsets of every occurrence within `haystack`, in ascending order.
    /// Overlapping occurrences are all reported.
    pub fn find_all(&self, haystack: &[u8]) -> Vec<usize> {
        if haystack.len() < self.len() {
            return Vec::new();
        }

        haystack
            .windows(self.len())
            .enumerate()
            .filter(|(_, window)| *self == **window)
            .map(|(offset, _)| offset)
            .collect()
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, Radix::Hex)
    }
}

impl PartialEq<[u8]> for Pattern {
    fn eq(&self, other: &[u8]) -> bool {
        self.bytes.len() == other.len()
            && Iterator::zip(self.bytes.iter(), other.iter()).all(|(a, b)| a == b)
    }
}
