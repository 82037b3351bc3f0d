//! Access control contract.
//!
//! After (or during) authentication, the server asks an
//! [`AccessController`] what to do with the user: accept them with a
//! session profile, reject them, or demand further authentication. In a
//! gateway deployment this is answered by an external translation
//! service keyed by the listener tag; [`AllowAll`] is the standalone
//! default.

use crate::PassageResult;
use std::path::PathBuf;

/// What a successfully authorized session looks like.
///
/// The profile is applied to every child process spawned for the user's
/// channels, and may redirect the whole connection to an upstream host.
#[derive(Debug, Clone, Default)]
pub struct SessionProfile {
    /// Working directory for spawned children (typically the home
    /// directory inside the user's namespace).
    pub chdir: Option<PathBuf>,
    /// Extra environment for spawned children.
    pub env: Vec<(String, String)>,
    /// When set, session channels are proxied to this "host:port"
    /// upstream instead of spawning local children.
    pub proxy_to: Option<String>,
    /// Shell to execute for shell requests (defaults to /bin/sh).
    pub shell: Option<PathBuf>,
}

/// Outcome of an authorization query.
#[derive(Debug, Clone)]
pub enum AccessDecision {
    /// Accept the user with the given profile.
    Accept(SessionProfile),
    /// Reject the user; authentication fails.
    Reject,
    /// Credentials were acceptable but insufficient; more authentication
    /// is required (partial success).
    Continue,
}

/// Per-connection authorization oracle.
#[async_trait::async_trait]
pub trait AccessController: Send + Sync {
    /// Decides what to do with `user` who authenticated with `method` on
    /// the listener identified by `listener_tag`.
    async fn authorize(
        &self,
        listener_tag: &str,
        user: &str,
        method: &str,
    ) -> PassageResult<AccessDecision>;
}

/// Accepts every authenticated user with a default profile.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl AccessController for AllowAll {
    async fn authorize(
        &self,
        _listener_tag: &str,
        _user: &str,
        _method: &str,
    ) -> PassageResult<AccessDecision> {
        Ok(AccessDecision::Accept(SessionProfile::default()))
    }
}

/// Verifies a username/password pair against an external backend.
#[async_trait::async_trait]
pub trait CredentialChecker: Send + Sync {
    /// Returns true when the pair is valid.
    async fn check_password(&self, user: &str, password: &str) -> PassageResult<bool>;
}

/// Rejects every password; the secure default when no backend is wired.
#[derive(Debug, Default)]
pub struct RejectAllPasswords;

#[async_trait::async_trait]
impl CredentialChecker for RejectAllPasswords {
    async fn check_password(&self, _user: &str, _password: &str) -> PassageResult<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all() {
        let controller = AllowAll;
        let decision = controller.authorize("", "alice", "publickey").await.unwrap();
        assert!(matches!(decision, AccessDecision::Accept(_)));
    }

    #[tokio::test]
    async fn test_reject_all_passwords() {
        let checker = RejectAllPasswords;
        assert!(!checker.check_password("alice", "hunter2").await.unwrap());
    }
}
