use crate::{
    error::{CapacityError, Error, Result},
    protocol::frame::utf8::{Utf8Bytes, Utf8Validator},
};
use bytes::{Bytes, BytesMut};
use std::{fmt, str};

/// A message being reassembled from fragments.
///
/// Text fragments are run through the streaming UTF-8 validator as they
/// are appended, so invalid data fails the connection without waiting for
/// the final fragment.
#[derive(Debug)]
pub(crate) struct IncompleteMessage {
    kind: IncompleteMessageType,
    buf: BytesMut,
    utf8: Utf8Validator,
}

/// The type of an incomplete message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IncompleteMessageType {
    Text,
    Binary,
}

impl IncompleteMessage {
    pub(crate) fn new(kind: IncompleteMessageType) -> Self {
        Self { kind, buf: BytesMut::new(), utf8: Utf8Validator::new() }
    }

    pub(crate) fn kind(&self) -> IncompleteMessageType {
        self.kind
    }

    /// Add more data to an existing message.
    pub(crate) fn extend(&mut self, tail: Bytes, size_limit: Option<usize>) -> Result<()> {
        // Always have a max size. This ensures an error in case of
        // concatenating two buffers of more than `usize::MAX` bytes in total.
        let max_size = size_limit.unwrap_or(usize::MAX);
        let my_size = self.buf.len();
        let portion_size = tail.len();
        if my_size > max_size || portion_size > max_size - my_size {
            return Err(Error::Capacity(CapacityError::MessageTooLong {
                size: my_size.saturating_add(portion_size),
                max_size,
            }));
        }

        if self.kind == IncompleteMessageType::Text {
            self.utf8.advance(&tail)?;
        }

        self.buf.extend_from_slice(&tail);
        Ok(())
    }

    /// Convert an incomplete message into a complete one.
    pub(crate) fn complete(self) -> Result<Message> {
        match self.kind {
            IncompleteMessageType::Binary => Ok(Message::Binary(self.buf.freeze())),
            IncompleteMessageType::Text => {
                if !self.utf8.is_complete() {
                    return Err(Error::Utf8("text message ends mid-codepoint".into()));
                }
                // SAFETY: every fragment passed the streaming validator and
                // the final fragment left it on a codepoint boundary.
                let text = unsafe { Utf8Bytes::from_bytes_unchecked(self.buf.freeze()) };
                Ok(Message::Text(text))
            }
        }
    }
}

/// Check an unfragmented payload against the configured message cap.
pub(crate) fn check_max_size(size: usize, max_size: Option<usize>) -> Result<()> {
    if let Some(max_size) = max_size {
        if size > max_size {
            return Err(Error::Capacity(CapacityError::MessageTooLong { size, max_size }));
        }
    }
    Ok(())
}

/// A complete WebSocket message as delivered to the application.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    /// A text WebSocket message.
    Text(Utf8Bytes),
    /// A binary WebSocket message.
    Binary(Bytes),
}

impl Message {
    /// Create a new text WebSocket message from a stringable.
    pub fn text<S>(string: S) -> Message
    where
        S: Into<Utf8Bytes>,
    {
        Message::Text(string.into())
    }

    /// Create a new binary WebSocket message by converting to `Bytes`.
    pub fn binary<B>(bin: B) -> Message
    where
        B: Into<Bytes>,
    {
        Message::Binary(bin.into())
    }

    /// Indicates whether a message is a text message.
    pub fn is_text(&self) -> bool {
        matches!(*self, Message::Text(_))
    }

    /// Indicates whether a message is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(*self, Message::Binary(_))
    }

    /// Get the length of the WebSocket message.
    pub fn len(&self) -> usize {
        match *self {
            Message::Text(ref string) => string.len(),
            Message::Binary(ref data) => data.len(),
        }
    }

    /// Returns true if the WebSocket message has no content.
    /// For example, if the other side of the connection sent an empty string.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the WebSocket message and return it as binary data.
    pub fn into_data(self) -> Bytes {
        match self {
            Message::Text(utf8) => utf8.into(),
            Message::Binary(data) => data,
        }
    }

    /// Attempt to consume the WebSocket message and convert it to a text payload.
    pub fn into_text(self) -> Result<Utf8Bytes> {
        match self {
            Message::Text(txt) => Ok(txt),
            Message::Binary(data) => data.try_into(),
        }
    }

    /// Attempt to get a &str from the WebSocket message; binary data is
    /// converted if it happens to be valid UTF-8.
    pub fn to_text(&self) -> Result<&str> {
        match *self {
            Message::Text(ref string) => Ok(string.as_str()),
            Message::Binary(ref data) => Ok(str::from_utf8(data)?),
        }
    }
}

impl From<String> for Message {
    #[inline]
    fn from(string: String) -> Self {
        Message::text(string)
    }
}

impl<'s> From<&'s str> for Message {
    #[inline]
    fn from(string: &'s str) -> Self {
        Message::text(string)
    }
}

impl<'b> From<&'b [u8]> for Message {
    #[inline]
    fn from(data: &'b [u8]) -> Self {
        Message::binary(Bytes::copy_from_slice(data))
    }
}

impl From<Vec<u8>> for Message {
    #[inline]
    fn from(data: Vec<u8>) -> Self {
        Message::binary(data)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(string) = self.to_text() {
            write!(f, "{string}")
        } else {
            write!(f, "Binary Data<length={}>", self.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let t = Message::text("test".to_owned());
        assert_eq!(t.to_string(), "test".to_owned());

        let bin = Message::binary(vec![0, 1, 3, 4, 241]);
        assert_eq!(bin.to_string(), "Binary Data<length=5>".to_owned());
    }

    #[test]
    fn binary_convert() {
        let bin = [6u8, 7, 8, 9, 10, 241];
        let msg = Message::from(&bin[..]);
        assert!(msg.is_binary());
        assert!(msg.into_text().is_err());
    }

    #[test]
    fn reassembly_concatenates_fragments() {
        let mut incomplete = IncompleteMessage::new(IncompleteMessageType::Text);
        incomplete.extend(Bytes::from_static(b"Hel"), None).unwrap();
        incomplete.extend(Bytes::from_static(b"lo"), None).unwrap();
        assert_eq!(incomplete.complete().unwrap(), Message::text("Hello"));
    }

    #[test]
    fn reassembly_validates_utf8_mid_stream() {
        let mut incomplete = IncompleteMessage::new(IncompleteMessageType::Text);
        assert!(matches!(
            incomplete.extend(Bytes::from_static(&[0xc0, 0xaf]), None),
            Err(Error::Utf8(_))
        ));
    }

    #[test]
    fn reassembly_accepts_codepoint_split_across_fragments() {
        let euro = "\u{20ac}".as_bytes();
        let mut incomplete = IncompleteMessage::new(IncompleteMessageType::Text);
        incomplete.extend(Bytes::copy_from_slice(&euro[..1]), None).unwrap();
        incomplete.extend(Bytes::copy_from_slice(&euro[1..]), None).unwrap();
        assert_eq!(incomplete.complete().unwrap(), Message::text("\u{20ac}"));
    }

    #[test]
    fn reassembly_rejects_truncated_codepoint_at_fin() {
        let euro = "\u{20ac}".as_bytes();
        let mut incomplete = IncompleteMessage::new(IncompleteMessageType::Text);
        incomplete.extend(Bytes::copy_from_slice(&euro[..2]), None).unwrap();
        assert!(matches!(incomplete.complete(), Err(Error::Utf8(_))));
    }

    #[test]
    fn reassembly_enforces_size_limit() {
        let mut incomplete = IncompleteMessage::new(IncompleteMessageType::Binary);
        incomplete.extend(Bytes::from_static(&[0; 8]), Some(10)).unwrap();
        assert!(matches!(
            incomplete.extend(Bytes::from_static(&[0; 8]), Some(10)),
            Err(Error::Capacity(CapacityError::MessageTooLong { size: 16, max_size: 10 }))
        ));
    }
}
