//! Strongly-typed strings for client identity and token material
//!
//! Secret-bearing types redact themselves in `Debug` and `Display` output so
//! that they can be logged without leaking credentials. The alternate format
//! (`{:#?}`) reveals a short prefix of an access token for correlation.

use aliri_braid::braid;
use std::fmt;

/// An OAuth2 client identifier
#[braid(serde)]
pub struct ClientId;

/// An OAuth2 client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

impl fmt::Debug for ClientSecretRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("***CLIENT SECRET***")
    }
}

impl fmt::Display for ClientSecretRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("***CLIENT SECRET***")
    }
}

/// An opaque access token as issued by the authority
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

impl fmt::Debug for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            write!(f, "\"{}\"", Prefixed(&self.0, 15))
        } else {
            f.write_str("***ACCESS TOKEN***")
        }
    }
}

impl fmt::Display for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            f.write_str(&self.0)
        } else {
            f.write_str("***ACCESS TOKEN***")
        }
    }
}

/// Shows at most the first `.1` characters of a string, marking any
/// truncation with an ellipsis.
struct Prefixed<'a>(&'a str, usize);

impl fmt::Display for Prefixed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.chars().count() <= self.1 {
            f.write_str(self.0)
        } else {
            let cut = self
                .0
                .char_indices()
                .nth(self.1)
                .map_or(self.0.len(), |(idx, _)| idx);
            f.write_str(&self.0[..cut])?;
            f.write_str("…")
        }
    }
}
