use std::fmt;

use aliri_braid::braid;

/// An opaque bearer access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

impl fmt::Debug for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            f.write_str("\"")?;
            reveal_prefix(&self.0, &mut *f, 15)?;
            f.write_str("\"")
        } else {
            f.write_str("***ACCESS TOKEN***")
        }
    }
}

impl fmt::Display for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            reveal_prefix(&self.0, &mut *f, usize::MAX)
        } else {
            f.write_str("***ACCESS TOKEN***")
        }
    }
}

/// Writes at most `default_len` characters of the secret (or the formatter
/// width, when one is given), eliding the rest.
fn reveal_prefix(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        return f.write_str("…");
    }
    if max_len > unprotected.len() {
        return f.write_str(unprotected);
    }
    match unprotected.char_indices().nth(max_len - 2) {
        Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
            f.write_str(&unprotected[0..idx + c.len_utf8()])?;
            f.write_str("…")
        }
        _ => f.write_str(unprotected),
    }
}
