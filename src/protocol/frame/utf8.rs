//! UTF-8 payloads and incremental validation.
//!
//! Text messages may arrive in arbitrary fragments, so validation cannot
//! wait for the final frame: the DFA state and partially decoded codepoint
//! are carried across fragments and checked for completion at message end.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use core::str;
use std::fmt;

/// The DFA accepting state: all input so far was a whole number of valid
/// UTF-8 sequences.
const UTF8_ACCEPT: u32 = 0;
/// The DFA rejecting state. Sticky: no further input can recover.
const UTF8_REJECT: u32 = 12;

/// Maps each byte to its character class.
#[rustfmt::skip]
static UTF8_CLASSES: [u8; 256] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    8, 8, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    10, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 4, 3, 3,
    11, 6, 6, 6, 5, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
];

/// Maps a state/class combination to the next state.
#[rustfmt::skip]
static UTF8_TRANSITIONS: [u8; 108] = [
     0, 12, 24, 36, 60, 96, 84, 12, 12, 12, 48, 72,
    12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12,
    12,  0, 12, 12, 12, 12, 12,  0, 12,  0, 12, 12,
    12, 24, 12, 12, 12, 12, 12, 24, 12, 24, 12, 12,
    12, 12, 12, 12, 12, 12, 12, 24, 12, 12, 12, 12,
    12, 24, 12, 12, 12, 12, 12, 12, 12, 24, 12, 12,
    12, 12, 12, 12, 12, 12, 12, 36, 12, 36, 12, 12,
    12, 36, 12, 12, 12, 12, 12, 36, 12, 36, 12, 12,
    12, 36, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12,
];

/// Streaming UTF-8 validator whose state survives fragment boundaries.
#[derive(Debug, Clone, Copy)]
pub struct Utf8Validator {
    state: u32,
    codepoint: u32,
}

impl Default for Utf8Validator {
    fn default() -> Self {
        Self { state: UTF8_ACCEPT, codepoint: 0 }
    }
}

impl Utf8Validator {
    /// Create a validator in the accepting state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more payload bytes, failing as soon as a byte makes the input
    /// invalid regardless of what follows.
    pub fn advance(&mut self, input: &[u8]) -> Result<()> {
        for &byte in input {
            let class = u32::from(UTF8_CLASSES[usize::from(byte)]);
            self.codepoint = if self.state == UTF8_ACCEPT {
                (0xff >> class) & u32::from(byte)
            } else {
                (u32::from(byte) & 0x3f) | (self.codepoint << 6)
            };
            self.state = u32::from(UTF8_TRANSITIONS[(self.state + class) as usize]);
            if self.state == UTF8_REJECT {
                return Err(Error::Utf8("invalid UTF-8 data".into()));
            }
        }
        Ok(())
    }

    /// Whether the input consumed so far ends on a codepoint boundary.
    /// Required at message end before a text message may be delivered.
    pub fn is_complete(&self) -> bool {
        self.state == UTF8_ACCEPT
    }

    /// The last fully decoded codepoint, if the validator is on a boundary.
    pub fn codepoint(&self) -> u32 {
        self.codepoint
    }

    /// Return to the accepting state for the next message.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Validate a complete buffer, requiring it to end on a codepoint boundary.
pub fn validate(input: &[u8]) -> Result<()> {
    let mut validator = Utf8Validator::new();
    validator.advance(input)?;
    if validator.is_complete() {
        Ok(())
    } else {
        Err(Error::Utf8("truncated UTF-8 sequence".into()))
    }
}

/// Utf8 payload.
#[derive(Debug, Default, Clone, Eq, PartialEq, Hash)]
pub struct Utf8Bytes(Bytes);

impl Utf8Bytes {
    /// Creates from a static str.
    #[inline]
    pub const fn from_static(str: &'static str) -> Self {
        Self(Bytes::from_static(str.as_bytes()))
    }

    /// Returns as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        // SAFETY: is valid utf8
        unsafe { str::from_utf8_unchecked(&self.0) }
    }

    /// Creates from a [`Bytes`] object without checking the encoding.
    ///
    /// # Safety
    ///
    /// The bytes passed in must be valid UTF-8.
    pub(crate) unsafe fn from_bytes_unchecked(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl std::ops::Deref for Utf8Bytes {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<[u8]> for Utf8Bytes {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<str> for Utf8Bytes {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl<T> PartialEq<T> for Utf8Bytes
where
    for<'a> &'a str: PartialEq<T>,
{
    #[inline]
    fn eq(&self, other: &T) -> bool {
        self.as_str() == *other
    }
}

impl fmt::Display for Utf8Bytes {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<Bytes> for Utf8Bytes {
    type Error = Error;

    #[inline]
    fn try_from(bytes: Bytes) -> Result<Self> {
        validate(&bytes)?;
        Ok(Self(bytes))
    }
}

impl TryFrom<BytesMut> for Utf8Bytes {
    type Error = Error;

    #[inline]
    fn try_from(bytes: BytesMut) -> Result<Self> {
        bytes.freeze().try_into()
    }
}

impl From<String> for Utf8Bytes {
    #[inline]
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for Utf8Bytes {
    #[inline]
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Utf8Bytes> for Bytes {
    #[inline]
    fn from(Utf8Bytes(bytes): Utf8Bytes) -> Self {
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ascii_and_multibyte() {
        assert!(validate(b"Hello").is_ok());
        assert!(validate("κόσμε".as_bytes()).is_ok());
        assert!(validate("\u{10348}".as_bytes()).is_ok());
    }

    #[test]
    fn rejects_overlong_encoding() {
        // Overlong "/" must fail on the first byte already.
        let mut v = Utf8Validator::new();
        assert!(v.advance(&[0xc0]).is_err());
        assert!(validate(&[0xc0, 0xaf]).is_err());
    }

    #[test]
    fn rejects_surrogates_and_out_of_range() {
        assert!(validate(&[0xed, 0xa0, 0x80]).is_err());
        assert!(validate(&[0xf4, 0x90, 0x80, 0x80]).is_err());
    }

    #[test]
    fn state_survives_fragment_boundaries() {
        // "€" split between two fragments.
        let euro = "\u{20ac}".as_bytes();
        let mut v = Utf8Validator::new();
        v.advance(&euro[..1]).unwrap();
        assert!(!v.is_complete());
        v.advance(&euro[1..]).unwrap();
        assert!(v.is_complete());
        assert_eq!(v.codepoint(), 0x20ac);
    }

    #[test]
    fn incomplete_at_end_is_detected() {
        let mut v = Utf8Validator::new();
        v.advance(&[0xe2, 0x82]).unwrap();
        assert!(!v.is_complete());
        assert!(validate(&[0xe2, 0x82]).is_err());
    }
}
