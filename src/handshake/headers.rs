//! HTTP header storage for the opening handshake.

/// Request or response headers.
///
/// Stored with the exact spelling they arrived with, in arrival order;
/// lookups compare names case-insensitively per HTTP. A repeated name is
/// folded into the first occurrence, comma-separated.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    data: Vec<(String, String)>,
}

impl Headers {
    /// Get the (folded) value of the header with the given name, if any.
    pub fn find(&self, name: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Add a header, folding into an existing one of the same name.
    pub fn append(&mut self, name: &str, value: &str) {
        match self.data.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => self.data.push((name.to_owned(), value.to_owned())),
        }
    }

    /// Iterate over stored headers in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of distinct header names stored.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no headers are stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Split a header value into its comma-separated tokens, trimming
/// optional whitespace and dropping empty entries.
pub(crate) fn split_tokens(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Whether a comma-separated header value contains the given token,
/// compared case-insensitively.
pub(crate) fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .map(str::trim)
        .any(|t| t.eq_ignore_ascii_case(token))
}
