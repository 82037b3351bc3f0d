//! SSH authorized_keys parsing (OpenSSH format).
//!
//! Publickey authentication is backed by a per-user authorized_keys
//! file, fetched through the delegated-open contract so it can live
//! inside the user's namespace. Each line has the format:
//!
//! ```text
//! [options] keytype base64-key [comment]
//! ```
//!
//! Unparseable lines are skipped, as OpenSSH does, so one bad entry
//! cannot lock a user out of the rest of the file.

use base64::Engine;
use subtle::ConstantTimeEq;

/// A single authorized key entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    /// Key options (e.g., "no-port-forwarding", "command=\"...\"")
    options: Vec<String>,
    /// Algorithm name (e.g., "ssh-ed25519", "ecdsa-sha2-nistp256")
    algorithm: String,
    /// Decoded public key blob in SSH wire format
    key_data: Vec<u8>,
    /// Optional comment
    comment: String,
}

impl AuthorizedKey {
    /// Returns the key options.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the key data (SSH wire format blob).
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Compares this entry against an offered key blob in constant
    /// time.
    pub fn matches(&self, algorithm: &str, key_blob: &[u8]) -> bool {
        self.algorithm == algorithm
            && self.key_data.len() == key_blob.len()
            && bool::from(self.key_data.ct_eq(key_blob))
    }
}

fn looks_like_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-sha2-") || token.starts_with("sk-")
}

fn parse_line(line: &str) -> Option<AuthorizedKey> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut tokens = line.split_whitespace();
    let mut options = Vec::new();

    // everything before the key type token is an options field
    let algorithm = loop {
        let token = tokens.next()?;
        if looks_like_key_type(token) {
            break token.to_string();
        }
        options.push(token.to_string());
    };

    let key_data = base64::engine::general_purpose::STANDARD
        .decode(tokens.next()?)
        .ok()?;

    let comment = tokens.collect::<Vec<_>>().join(" ");

    Some(AuthorizedKey {
        options,
        algorithm,
        key_data,
        comment,
    })
}

/// A parsed authorized_keys file.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeysFile {
    keys: Vec<AuthorizedKey>,
}

impl AuthorizedKeysFile {
    /// Parses file contents. Malformed lines are skipped.
    pub fn parse(contents: &str) -> Self {
        Self {
            keys: contents.lines().filter_map(parse_line).collect(),
        }
    }

    /// Parses raw bytes, tolerating invalid UTF-8 by replacement.
    pub fn parse_bytes(contents: &[u8]) -> Self {
        Self::parse(&String::from_utf8_lossy(contents))
    }

    /// Returns the parsed keys.
    pub fn keys(&self) -> &[AuthorizedKey] {
        &self.keys
    }

    /// Looks up an offered key; returns the matching entry if the file
    /// authorizes it.
    pub fn find(&self, algorithm: &str, key_blob: &[u8]) -> Option<&AuthorizedKey> {
        self.keys.iter().find(|k| k.matches(algorithm, key_blob))
    }
}
