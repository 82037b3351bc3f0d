//! SSH identification lines (RFC 4253 Section 4.2).
//!
//! Before any packet flows, each side sends one line of the form
//! `SSH-protoversion-softwareversion [comments]`, terminated by CR LF.
//! The line matters beyond the handshake: both sides hash it verbatim
//! (without the terminator) into the key exchange, so [`Version`] keeps
//! the exact validated line and derives the software/comment fields
//! from it on demand instead of storing them separately.
//!
//! Accepted protocol versions are "2.0" and the compatibility marker
//! "1.99"; anything else is refused before key exchange starts.

use passage_platform::{PassageError, PassageResult};
use std::fmt;

/// Maximum length of an identification line, excluding CR LF
/// (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Protocol versions this server will talk to.
const ACCEPTED_PROTO_VERSIONS: [&str; 2] = ["2.0", "1.99"];

fn reject(line: &str, why: &str) -> PassageError {
    PassageError::Protocol(format!("identification line {:?}: {}", line, why))
}

/// A validated SSH identification line, stored verbatim without CR LF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    line: String,
}

impl Version {
    /// Builds an SSH-2.0 identification line from a software version
    /// and optional comments.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let line = match comments {
            Some(comments) => format!("SSH-2.0-{} {}", software, comments),
            None => format!("SSH-2.0-{}", software),
        };
        Self { line }
    }

    /// This server's own identification line.
    pub fn default_passage() -> Self {
        Self {
            line: concat!("SSH-2.0-Passage_", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Validates a received identification line. Trailing CR LF is
    /// stripped; the rest is kept byte-for-byte for the exchange hash.
    pub fn parse(input: &str) -> PassageResult<Self> {
        let line = input.trim_end_matches(['\r', '\n']);

        if line.len() > MAX_VERSION_LENGTH {
            return Err(PassageError::Protocol(format!(
                "identification line longer than {} bytes",
                MAX_VERSION_LENGTH
            )));
        }
        if line.chars().any(|c| c.is_ascii_control()) {
            return Err(reject(line, "contains control characters"));
        }

        // SSH- <proto> - <software> [SP comments]
        let mut parts = line.splitn(3, '-');
        let (prefix, proto, remainder) = (parts.next(), parts.next(), parts.next());

        if prefix != Some("SSH") {
            return Err(reject(line, "does not start with SSH-"));
        }
        let proto = proto.ok_or_else(|| reject(line, "missing protocol version"))?;
        if !ACCEPTED_PROTO_VERSIONS.contains(&proto) {
            return Err(reject(
                line,
                &format!("protocol version {} not supported", proto),
            ));
        }
        match remainder {
            None | Some("") => return Err(reject(line, "missing software version")),
            Some(rest) if rest.starts_with(' ') => {
                return Err(reject(line, "missing software version"))
            }
            Some(_) => {}
        }

        Ok(Self {
            line: line.to_string(),
        })
    }

    fn software_and_comments(&self) -> (&str, Option<&str>) {
        // the constructors guarantee "SSH-<proto>-" precedes this
        let remainder = self.line.splitn(3, '-').nth(2).unwrap_or("");
        match remainder.split_once(' ') {
            Some((software, comments)) => (software, Some(comments)),
            None => (remainder, None),
        }
    }

    /// The software version field.
    pub fn software(&self) -> &str {
        self.software_and_comments().0
    }

    /// The comments field, when present.
    pub fn comments(&self) -> Option<&str> {
        self.software_and_comments().1
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}
