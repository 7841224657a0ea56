pub mod http;
pub mod path_sanitize;
pub mod subprocess;
pub mod url_security;

use sha2::{Digest, Sha256};

/// Stable slug for filesystem/session identifiers: lowercases, keeps
/// `[a-z0-9._-]`, replaces everything else with `_`.
pub fn safe_slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugifies_unsafe_characters() {
        assert_eq!(safe_slug("Tg Chat/123"), "tg_chat_123");
        assert_eq!(safe_slug(""), "_");
    }
}
