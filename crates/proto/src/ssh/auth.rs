//! SSH user authentication, server side (RFC 4252).
//!
//! After the transport is ready the client requests the "ssh-userauth"
//! service and then sends USERAUTH_REQUEST messages. Three methods are
//! offered:
//!
//! - **none** - always fails, returning the acceptable method list;
//!   clients use it to probe
//! - **password** - verified by the external credential checker
//! - **publickey** - two phases: a signatureless probe answered with
//!   PK_OK when the key appears in the user's authorized_keys file
//!   (fetched through the delegated-open contract), then a signed
//!   request verified over the session id
//!
//! Every request counts against a per-connection attempt budget;
//! exceeding it disconnects with NO_MORE_AUTH_METHODS_AVAILABLE. A
//! successful method is still subject to the access controller, which
//! may reject the user or demand further authentication
//! (partial success).

use crate::ssh::authorized_keys::AuthorizedKeysFile;
use crate::ssh::hostkey::verify_ssh_signature;
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::wire::{PacketReader, PacketWriter};
use passage_platform::{
    AccessController, AccessDecision, CredentialChecker, DelegatedOpen, PassageResult,
    SessionProfile,
};
use std::path::Path;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Methods advertised in USERAUTH_FAILURE replies.
const METHODS: &str = "publickey,password";

/// Default authentication attempt budget per connection.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 10;

/// Services the authentication layer hands over to.
const CONNECTION_SERVICE: &str = "ssh-connection";

/// External collaborators the engine consults, plus the session
/// identifier that publickey signatures cover.
pub struct AuthBackend<'a> {
    /// Session identifier: the exchange hash of the first key exchange.
    pub session_id: &'a [u8],
    /// Password verification backend.
    pub credentials: &'a dyn CredentialChecker,
    /// Reads per-user files (authorized_keys) inside their namespace.
    pub delegated_open: &'a dyn DelegatedOpen,
    /// Post-authentication authorization oracle.
    pub access: &'a dyn AccessController,
    /// Listener tag forwarded to the access controller.
    pub listener_tag: &'a str,
    /// Path of the per-user authorized_keys file, resolved by the
    /// delegated-open implementation.
    pub authorized_keys_path: &'a Path,
}

/// What the connection should do with an authentication message.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Send this reply and keep authenticating.
    Reply(Vec<u8>),
    /// Authentication complete: send the reply and enter the
    /// connection layer as `username`.
    Success {
        /// The authenticated user.
        username: String,
        /// Profile granted by the access controller.
        profile: SessionProfile,
        /// USERAUTH_SUCCESS payload.
        reply: Vec<u8>,
    },
    /// Send DISCONNECT with this reason and close.
    Disconnect(DisconnectReason, String),
}

/// Per-connection authentication state machine.
#[derive(Debug)]
pub struct AuthEngine {
    max_attempts: u32,
    attempts: u32,
    service_accepted: bool,
}

impl AuthEngine {
    /// Creates an engine with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            service_accepted: false,
        }
    }

    /// Handles SSH_MSG_SERVICE_REQUEST; only "ssh-userauth" is
    /// available.
    pub fn handle_service_request(&mut self, payload: &[u8]) -> PassageResult<AuthOutcome> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::ServiceRequest)?;
        let service = r.get_str()?;

        if service != "ssh-userauth" {
            return Ok(AuthOutcome::Disconnect(
                DisconnectReason::ServiceNotAvailable,
                format!("service {} is not available", service),
            ));
        }

        self.service_accepted = true;

        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ServiceAccept as u8)?;
        w.put_str("ssh-userauth")?;
        Ok(AuthOutcome::Reply(w.into_bytes()))
    }

    /// Handles one SSH_MSG_USERAUTH_REQUEST.
    pub async fn handle_request(
        &mut self,
        payload: &[u8],
        backend: &AuthBackend<'_>,
    ) -> PassageResult<AuthOutcome> {
        if !self.service_accepted {
            return Ok(AuthOutcome::Disconnect(
                DisconnectReason::ProtocolError,
                "authentication before service request".to_string(),
            ));
        }

        self.attempts += 1;
        if self.attempts > self.max_attempts {
            warn!(attempts = self.attempts, "authentication attempt budget exceeded");
            return Ok(AuthOutcome::Disconnect(
                DisconnectReason::NoMoreAuthMethodsAvailable,
                "too many authentication attempts".to_string(),
            ));
        }

        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::UserauthRequest)?;
        let username = r.get_str()?.to_string();
        let service = r.get_str()?.to_string();
        let method = r.get_str()?.to_string();

        if service != CONNECTION_SERVICE {
            return Ok(AuthOutcome::Disconnect(
                DisconnectReason::ServiceNotAvailable,
                format!("cannot authenticate for service {}", service),
            ));
        }

        debug!(user = %username, method = %method, attempt = self.attempts, "userauth request");

        match method.as_str() {
            "none" => Ok(AuthOutcome::Reply(failure(false)?)),
            "password" => {
                self.handle_password(&username, &mut r, backend).await
            }
            "publickey" => self.handle_publickey(&username, &mut r, backend).await,
            _ => Ok(AuthOutcome::Reply(failure(false)?)),
        }
    }

    async fn handle_password(
        &mut self,
        username: &str,
        r: &mut PacketReader<'_>,
        backend: &AuthBackend<'_>,
    ) -> PassageResult<AuthOutcome> {
        let change_request = r.get_bool()?;
        let mut password = r.get_str()?.to_string();

        // password changing is not offered
        if change_request {
            password.zeroize();
            return Ok(AuthOutcome::Reply(failure(false)?));
        }

        let valid = backend
            .credentials
            .check_password(username, &password)
            .await?;
        password.zeroize();

        if !valid {
            info!(user = %username, "password authentication failed");
            return Ok(AuthOutcome::Reply(failure(false)?));
        }

        self.finish(username, "password", backend).await
    }

    async fn handle_publickey(
        &mut self,
        username: &str,
        r: &mut PacketReader<'_>,
        backend: &AuthBackend<'_>,
    ) -> PassageResult<AuthOutcome> {
        let has_signature = r.get_bool()?;
        let algorithm = r.get_str()?.to_string();
        let key_blob = r.get_string()?.to_vec();

        let authorized = self
            .lookup_authorized_key(username, &algorithm, &key_blob, backend)
            .await;

        if !authorized {
            info!(user = %username, algorithm = %algorithm, "public key not authorized");
            return Ok(AuthOutcome::Reply(failure(false)?));
        }

        if !has_signature {
            // phase one: tell the client this key would be acceptable
            let mut w = PacketWriter::new();
            w.put_u8(MessageType::UserauthPkOk as u8)?;
            w.put_str(&algorithm)?;
            w.put_string(&key_blob)?;
            return Ok(AuthOutcome::Reply(w.into_bytes()));
        }

        let signature = r.get_string()?.to_vec();
        let signed_data =
            publickey_signature_data(backend.session_id, username, &algorithm, &key_blob)?;

        match verify_ssh_signature(&key_blob, &signature, &signed_data) {
            Ok(true) => self.finish(username, "publickey", backend).await,
            Ok(false) => {
                info!(user = %username, "public key signature verification failed");
                Ok(AuthOutcome::Reply(failure(false)?))
            }
            Err(e) => {
                warn!(user = %username, error = %e, "malformed public key signature");
                Ok(AuthOutcome::Reply(failure(false)?))
            }
        }
    }

    async fn lookup_authorized_key(
        &self,
        username: &str,
        algorithm: &str,
        key_blob: &[u8],
        backend: &AuthBackend<'_>,
    ) -> bool {
        let contents = match backend
            .delegated_open
            .open_read_only(username, backend.authorized_keys_path)
            .await
        {
            Ok(contents) => contents,
            Err(e) => {
                debug!(user = %username, error = %e, "no authorized_keys file");
                return false;
            }
        };

        AuthorizedKeysFile::parse_bytes(&contents)
            .find(algorithm, key_blob)
            .is_some()
    }

    async fn finish(
        &self,
        username: &str,
        method: &str,
        backend: &AuthBackend<'_>,
    ) -> PassageResult<AuthOutcome> {
        match backend
            .access
            .authorize(backend.listener_tag, username, method)
            .await?
        {
            AccessDecision::Accept(profile) => {
                info!(user = %username, method = %method, "authentication succeeded");
                let mut w = PacketWriter::new();
                w.put_u8(MessageType::UserauthSuccess as u8)?;
                Ok(AuthOutcome::Success {
                    username: username.to_string(),
                    profile,
                    reply: w.into_bytes(),
                })
            }
            AccessDecision::Continue => Ok(AuthOutcome::Reply(failure(true)?)),
            AccessDecision::Reject => {
                info!(user = %username, "access controller rejected user");
                Ok(AuthOutcome::Reply(failure(false)?))
            }
        }
    }
}

fn failure(partial_success: bool) -> PassageResult<Vec<u8>> {
    let mut w = PacketWriter::new();
    w.put_u8(MessageType::UserauthFailure as u8)?;
    w.put_str(METHODS)?;
    w.put_bool(partial_success)?;
    Ok(w.into_bytes())
}

/// Builds the data a publickey authentication signature covers
/// (RFC 4252 Section 7):
///
/// ```text
/// string session_id || byte 50 || string user || string service ||
/// string "publickey" || bool true || string algorithm || string key blob
/// ```
pub fn publickey_signature_data(
    session_id: &[u8],
    username: &str,
    algorithm: &str,
    key_blob: &[u8],
) -> PassageResult<Vec<u8>> {
    let mut w = PacketWriter::new();
    w.put_string(session_id)?;
    w.put_u8(MessageType::UserauthRequest as u8)?;
    w.put_str(username)?;
    w.put_str(CONNECTION_SERVICE)?;
    w.put_str("publickey")?;
    w.put_bool(true)?;
    w.put_str(algorithm)?;
    w.put_string(key_blob)?;
    Ok(w.into_bytes())
}
