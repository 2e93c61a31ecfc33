//! Classification of command replies

use std::fmt;

/// Successful reply to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The device answered `ok`
    Ok,
    /// The device answered with a bare number, e.g. a battery query
    Value(i64),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => f.write_str("ok"),
            Reply::Value(value) => write!(f, "{value}"),
        }
    }
}

/// What one received datagram means for the outstanding command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Classified {
    Success(Reply),
    /// The device refused the command; never retried
    Rejected(String),
    /// Non-empty text that is neither `ok`, an error nor a number
    Malformed(String),
    /// Empty or non-UTF-8 payload
    Empty,
}

/// Classify a raw reply payload.
///
/// Surrounding whitespace and NUL padding are stripped first.
pub(crate) fn classify(payload: &[u8]) -> Classified {
    let Ok(text) = std::str::from_utf8(payload) else {
        return Classified::Empty;
    };
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

    if text.is_empty() {
        return Classified::Empty;
    }
    if text == "ok" {
        return Classified::Success(Reply::Ok);
    }
    if text.to_ascii_lowercase().contains("error") {
        return Classified::Rejected(text.to_string());
    }
    if is_signed_integer(text) {
        if let Ok(value) = text.parse::<i64>() {
            return Classified::Success(Reply::Value(value));
        }
    }
    Classified::Malformed(text.to_string())
}

fn is_signed_integer(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}
