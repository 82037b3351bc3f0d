//! The SSH server: listener and per-connection engine.
//!
//! [`SshServer`] binds a TCP listener and hands each accepted socket to
//! a [`ServerSession`], one cooperative task per connection. The
//! session drives the whole protocol: identification exchange, key
//! exchange (initial and rekeys), authentication, then the multiplexed
//! connection layer with its channel table.
//!
//! The engine is a single loop per connection selecting between three
//! inputs: inbound packets, events from channel back-end tasks (child
//! process pumps, upstream sockets), and the server-wide shutdown
//! signal. No channel state is touched from outside the loop, so there
//! is no shared mutable state to lock.
//!
//! The session is generic over the byte stream, which lets the whole
//! engine run over in-memory duplex pipes in tests.

use crate::ssh::auth::{AuthBackend, AuthEngine, AuthOutcome};
use crate::ssh::channel::{
    Channel, ChannelEvent, ChannelInit, DataStream, Finish, CHANNEL_MAX_PACKET, RECEIVE_WINDOW,
};
use crate::ssh::connection::{
    exit_signal_request, exit_status_request, ChannelClose, ChannelData, ChannelEof,
    ChannelExtendedData, ChannelFailure, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelRequest, ChannelSuccess, ChannelWindowAdjust, DirectTcpipOpen,
};
use crate::ssh::direct_tcpip::DirectTcpipChannel;
use crate::ssh::hostkey::HostKey;
use crate::ssh::kex::{self, derive_contexts, ExchangeTranscript, KexAlgorithms, KexInit};
use crate::ssh::message::{
    ChannelOpenFailureReason, DisconnectReason, MessageType, EXTENDED_DATA_STDERR,
};
use crate::ssh::session::{SessionChannel, SessionConfig};
use crate::ssh::transport::{Transport, WRITE_HIGH_WATER};
use crate::ssh::version::Version;
use crate::ssh::wire::{PacketReader, PacketWriter};
use passage_platform::{
    AccessController, AllowAll, CredentialChecker, DelegatedOpen, ExitOutcome,
    LocalDelegatedOpen, LocalSpawnService, PassageError, PassageResult, RejectAllPasswords,
    SessionProfile, SpawnService,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Depth of the channel back-end event queue; bounded so runaway
/// producers block instead of growing memory.
const EVENT_QUEUE: usize = 64;

/// Bound on connection-layer packets deferred while a key exchange is
/// in flight.
const DEFERRED_LIMIT: usize = 1024;

/// Server configuration: identity, policy and the service contracts.
#[derive(Clone)]
pub struct ServerConfig {
    /// Our identification line.
    pub server_version: Version,
    /// The host key used for every key exchange.
    pub host_key: Arc<dyn HostKey>,
    /// Authentication attempt budget per connection.
    pub max_auth_attempts: u32,
    /// Tag forwarded to the access controller, identifying this
    /// listener.
    pub listener_tag: String,
    /// Per-user authorized_keys path, resolved by the delegated-open
    /// implementation.
    pub authorized_keys_path: PathBuf,
    /// Whether direct-tcpip channels are allowed.
    pub allow_direct_tcpip: bool,
    /// Maximum concurrent channels per connection.
    pub max_channels: usize,
    /// Session channel settings.
    pub session: SessionConfig,

    /// Password verification backend.
    pub credentials: Arc<dyn CredentialChecker>,
    /// Authorization oracle.
    pub access: Arc<dyn AccessController>,
    /// Per-user file access.
    pub delegated_open: Arc<dyn DelegatedOpen>,
    /// Child process factory.
    pub spawn: Arc<dyn SpawnService>,
}

impl ServerConfig {
    /// Creates a configuration with secure defaults around `host_key`:
    /// all passwords rejected, every authenticated user accepted with a
    /// default profile, local filesystem lookups and uninsulated local
    /// spawning.
    pub fn new(host_key: Arc<dyn HostKey>) -> Self {
        Self {
            server_version: Version::default_passage(),
            host_key,
            max_auth_attempts: crate::ssh::auth::DEFAULT_MAX_AUTH_ATTEMPTS,
            listener_tag: String::new(),
            authorized_keys_path: PathBuf::from("/.ssh/authorized_keys"),
            allow_direct_tcpip: true,
            max_channels: 64,
            session: SessionConfig::default(),
            credentials: Arc::new(RejectAllPasswords),
            access: Arc::new(AllowAll),
            delegated_open: Arc::new(LocalDelegatedOpen::default()),
            spawn: Arc::new(LocalSpawnService),
        }
    }
}

/// Listening SSH server.
pub struct SshServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    shutdown: watch::Sender<bool>,
}

impl SshServer {
    /// Binds to `addr`.
    pub async fn bind(addr: &str, config: ServerConfig) -> PassageResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            config: Arc::new(config),
            shutdown,
        })
    }

    /// Accepts one connection and builds its session. The caller
    /// typically spawns [`ServerSession::run`] on its own task.
    pub async fn accept(&self) -> PassageResult<ServerSession<TcpStream>> {
        let (stream, peer) = self.listener.accept().await?;
        info!(peer = %peer, "connection accepted");
        Ok(ServerSession::new(
            stream,
            self.config.clone(),
            self.shutdown.subscribe(),
        ))
    }

    /// The bound local address.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Asks every running session to disconnect gracefully
    /// (DISCONNECT by-application), e.g. from a SIGTERM handler.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Debug)]
enum KexState {
    /// No exchange in progress.
    Idle,
    /// We sent KEXINIT and await the peer's.
    WaitKexInit { server_payload: Vec<u8> },
    /// Algorithms negotiated; awaiting the client's ECDH init.
    WaitEcdh {
        algorithms: KexAlgorithms,
        server_payload: Vec<u8>,
        client_payload: Vec<u8>,
    },
    /// Reply and our NEWKEYS sent; awaiting the peer's NEWKEYS.
    WaitNewKeys,
}

/// One SSH connection, from accept to teardown.
pub struct ServerSession<S> {
    transport: Transport<S>,
    config: Arc<ServerConfig>,
    shutdown: watch::Receiver<bool>,

    client_version: String,
    server_version: String,
    session_id: Option<Vec<u8>>,
    kex_state: KexState,

    auth: AuthEngine,
    username: Option<String>,
    profile: SessionProfile,

    channels: HashMap<u32, Channel>,
    next_channel_id: u32,
    events_tx: mpsc::Sender<ChannelEvent>,
    events_rx: mpsc::Receiver<ChannelEvent>,

    /// Connection-layer packets held back during a key exchange; RFC
    /// 4253 allows only transport messages between KEXINIT and NEWKEYS.
    deferred_out: Vec<Vec<u8>>,

    write_blocked: bool,
    closing: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ServerSession<S> {
    /// Wraps an accepted stream.
    pub fn new(stream: S, config: Arc<ServerConfig>, shutdown: watch::Receiver<bool>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let max_auth_attempts = config.max_auth_attempts;
        Self {
            transport: Transport::new(stream),
            config,
            shutdown,
            client_version: String::new(),
            server_version: String::new(),
            session_id: None,
            kex_state: KexState::Idle,
            auth: AuthEngine::new(max_auth_attempts),
            username: None,
            profile: SessionProfile::default(),
            channels: HashMap::new(),
            next_channel_id: 0,
            events_tx,
            events_rx,
            deferred_out: Vec::new(),
            write_blocked: false,
            closing: false,
        }
    }

    fn kex_idle(&self) -> bool {
        matches!(self.kex_state, KexState::Idle)
    }

    /// Queues a connection-layer packet, deferring it while a key
    /// exchange is in progress.
    fn queue_channel_packet(&mut self, payload: Vec<u8>) -> PassageResult<()> {
        if self.kex_idle() {
            self.transport.queue_packet(&payload)
        } else {
            if self.deferred_out.len() >= DEFERRED_LIMIT {
                return Err(PassageError::Resource(
                    "too many packets deferred during key exchange".to_string(),
                ));
            }
            self.deferred_out.push(payload);
            Ok(())
        }
    }

    /// Drives the connection to completion. Protocol errors are
    /// answered with a DISCONNECT carrying the matching reason; I/O
    /// errors tear down silently.
    pub async fn run(mut self) -> PassageResult<()> {
        let result = self.run_inner().await;

        if let Err(e) = &result {
            match e {
                PassageError::Io(_) => {
                    debug!(error = %e, "connection closed");
                }
                PassageError::Protocol(msg) => {
                    let reason = if msg.contains("MAC") {
                        DisconnectReason::MacError
                    } else {
                        DisconnectReason::ProtocolError
                    };
                    warn!(error = %e, "protocol error, disconnecting");
                    self.transport.send_disconnect(reason, msg).await;
                }
                PassageError::Resource(msg) => {
                    warn!(error = %e, "resource limit hit, disconnecting");
                    self.transport
                        .send_disconnect(DisconnectReason::ProtocolError, msg)
                        .await;
                }
                _ => {
                    warn!(error = %e, "internal error, disconnecting");
                    self.transport
                        .send_disconnect(DisconnectReason::ProtocolError, "internal error")
                        .await;
                }
            }
        }

        self.teardown();
        result
    }

    async fn run_inner(&mut self) -> PassageResult<()> {
        let (client_version, server_version) = self
            .transport
            .exchange_versions(&self.config.server_version)
            .await?;
        self.client_version = client_version;
        self.server_version = server_version;

        self.start_kex().await?;

        while !self.closing {
            tokio::select! {
                payload = self.transport.recv_packet() => {
                    self.handle_packet(&payload?).await?;
                }
                event = self.events_rx.recv() => {
                    // the session owns a sender, so recv never yields None
                    if let Some(event) = event {
                        self.handle_event(event).await?;
                    }
                }
                _ = self.shutdown.changed() => {
                    info!("graceful shutdown requested");
                    self.transport
                        .send_disconnect(DisconnectReason::ByApplication, "server shutting down")
                        .await;
                    break;
                }
            }

            self.pump().await?;
        }

        Ok(())
    }

    fn teardown(&mut self) {
        for (_, mut channel) in self.channels.drain() {
            channel.handler.on_close();
        }
    }

    /// Initiates a key exchange (the initial one, or a rekey).
    async fn start_kex(&mut self) -> PassageResult<()> {
        let kexinit = KexInit::server_default(self.config.host_key.algorithm_name());
        let payload = kexinit.to_bytes()?;
        self.transport.send_packet(&payload).await?;
        self.kex_state = KexState::WaitKexInit {
            server_payload: payload,
        };
        debug!("key exchange initiated");
        Ok(())
    }

    async fn handle_packet(&mut self, payload: &[u8]) -> PassageResult<()> {
        let Some(&msg) = payload.first() else {
            return Err(PassageError::Protocol("empty packet payload".to_string()));
        };

        match MessageType::from_u8(msg) {
            Some(MessageType::Disconnect) => {
                debug!("peer disconnected");
                self.closing = true;
                Ok(())
            }
            Some(MessageType::Ignore)
            | Some(MessageType::Debug)
            | Some(MessageType::Unimplemented) => Ok(()),
            Some(MessageType::KexInit) => self.handle_kexinit(payload).await,
            Some(MessageType::EcdhKexInit) => self.handle_ecdh_init(payload).await,
            Some(MessageType::NewKeys) => self.handle_newkeys(),
            Some(MessageType::ServiceRequest) => self.handle_service_request(payload).await,
            Some(MessageType::UserauthRequest) => self.handle_userauth(payload).await,
            Some(MessageType::GlobalRequest) => self.handle_global_request(payload).await,
            Some(MessageType::ChannelOpen) => self.handle_channel_open(payload).await,
            Some(msg_type) if msg_type.is_channel() => self.handle_channel_msg(msg, payload).await,
            _ => {
                debug!(msg, "unimplemented message number");
                let mut w = PacketWriter::new();
                w.put_u8(MessageType::Unimplemented as u8)?;
                w.put_u32(self.transport.last_recv_seq())?;
                self.transport.send_packet(w.as_slice()).await
            }
        }
    }

    async fn handle_kexinit(&mut self, payload: &[u8]) -> PassageResult<()> {
        let client_kexinit = KexInit::from_bytes(payload)?;

        let server_payload = match std::mem::replace(&mut self.kex_state, KexState::Idle) {
            // peer-initiated rekey: answer with our own KEXINIT first
            KexState::Idle => {
                let kexinit = KexInit::server_default(self.config.host_key.algorithm_name());
                let server_payload = kexinit.to_bytes()?;
                self.transport.send_packet(&server_payload).await?;
                server_payload
            }
            KexState::WaitKexInit { server_payload } => server_payload,
            other => {
                self.kex_state = other;
                return Err(PassageError::Protocol(
                    "unexpected KEXINIT during key exchange".to_string(),
                ));
            }
        };

        let server_kexinit = KexInit::from_bytes(&server_payload)?;
        let algorithms = match kex::negotiate(&client_kexinit, &server_kexinit) {
            Ok(algorithms) => algorithms,
            Err(e) => {
                self.transport
                    .send_disconnect(DisconnectReason::KeyExchangeFailed, &e.to_string())
                    .await;
                return Err(e);
            }
        };

        debug!(
            kex = ?algorithms.kex,
            cipher_in = algorithms.cipher_client_to_server.name(),
            cipher_out = algorithms.cipher_server_to_client.name(),
            "algorithms negotiated"
        );

        self.kex_state = KexState::WaitEcdh {
            algorithms,
            server_payload,
            client_payload: payload.to_vec(),
        };
        Ok(())
    }

    async fn handle_ecdh_init(&mut self, payload: &[u8]) -> PassageResult<()> {
        let KexState::WaitEcdh {
            algorithms,
            server_payload,
            client_payload,
        } = std::mem::replace(&mut self.kex_state, KexState::Idle)
        else {
            return Err(PassageError::Protocol(
                "ECDH init outside of key exchange".to_string(),
            ));
        };

        let transcript = ExchangeTranscript {
            client_version: self.client_version.clone(),
            server_version: self.server_version.clone(),
            client_kexinit: client_payload,
            server_kexinit: server_payload,
        };

        let outcome = kex::respond_ecdh_init(
            algorithms.kex,
            &transcript,
            self.config.host_key.as_ref(),
            payload,
        )?;

        // the first exchange hash becomes the immutable session id
        let session_id = self
            .session_id
            .get_or_insert_with(|| outcome.exchange_hash.clone())
            .clone();

        let (seal, open) = derive_contexts(
            &algorithms,
            &outcome.shared_secret,
            &outcome.exchange_hash,
            &session_id,
        )?;
        self.transport.set_pending(seal, open);

        self.transport.queue_packet(&outcome.reply)?;
        self.transport.queue_packet(&[MessageType::NewKeys as u8])?;
        self.transport.flush().await?;
        self.transport.install_pending_send()?;

        self.kex_state = KexState::WaitNewKeys;
        Ok(())
    }

    fn handle_newkeys(&mut self) -> PassageResult<()> {
        if !matches!(self.kex_state, KexState::WaitNewKeys) {
            return Err(PassageError::Protocol("unexpected NEWKEYS".to_string()));
        }
        self.transport.install_pending_recv()?;
        self.kex_state = KexState::Idle;
        debug!("new keys installed");

        // release what the connection layer held back during the
        // exchange
        for payload in std::mem::take(&mut self.deferred_out) {
            self.transport.queue_packet(&payload)?;
        }
        // window refills suppressed during the exchange would never
        // retrigger if the peer is stalled on an empty window
        for channel in self.channels.values_mut() {
            if let Some(credit) = channel.refill_local_window() {
                let adjust = ChannelWindowAdjust {
                    recipient_channel: channel.peer_id,
                    additional: credit,
                }
                .to_bytes()?;
                self.transport.queue_packet(&adjust)?;
            }
        }
        Ok(())
    }

    async fn handle_service_request(&mut self, payload: &[u8]) -> PassageResult<()> {
        if self.session_id.is_none() {
            return Err(PassageError::Protocol(
                "service request before key exchange".to_string(),
            ));
        }
        let outcome = self.auth.handle_service_request(payload)?;
        self.apply_auth_outcome(outcome).await
    }

    async fn handle_userauth(&mut self, payload: &[u8]) -> PassageResult<()> {
        if self.username.is_some() {
            // RFC 4252: requests after success are silently ignored
            return Ok(());
        }
        let Some(session_id) = self.session_id.clone() else {
            return Err(PassageError::Protocol(
                "authentication before key exchange".to_string(),
            ));
        };

        let backend = AuthBackend {
            session_id: &session_id,
            credentials: self.config.credentials.as_ref(),
            delegated_open: self.config.delegated_open.as_ref(),
            access: self.config.access.as_ref(),
            listener_tag: &self.config.listener_tag,
            authorized_keys_path: &self.config.authorized_keys_path,
        };

        let outcome = self.auth.handle_request(payload, &backend).await?;
        self.apply_auth_outcome(outcome).await
    }

    async fn apply_auth_outcome(&mut self, outcome: AuthOutcome) -> PassageResult<()> {
        match outcome {
            AuthOutcome::Reply(reply) => self.transport.send_packet(&reply).await,
            AuthOutcome::Success {
                username,
                profile,
                reply,
            } => {
                self.username = Some(username);
                self.profile = profile;
                self.transport.send_packet(&reply).await
            }
            AuthOutcome::Disconnect(reason, description) => {
                self.transport.send_disconnect(reason, &description).await;
                self.closing = true;
                Ok(())
            }
        }
    }

    async fn handle_global_request(&mut self, payload: &[u8]) -> PassageResult<()> {
        let mut r = PacketReader::new(payload);
        r.expect_msg(MessageType::GlobalRequest)?;
        let name = r.get_str()?.to_string();
        let want_reply = r.get_bool()?;

        debug!(request = %name, "global request refused");
        if want_reply {
            let mut w = PacketWriter::new();
            w.put_u8(MessageType::RequestFailure as u8)?;
            self.transport.send_packet(w.as_slice()).await?;
        }
        Ok(())
    }

    fn require_auth(&self) -> PassageResult<()> {
        if self.username.is_none() {
            return Err(PassageError::Protocol(
                "connection-layer message before authentication".to_string(),
            ));
        }
        Ok(())
    }

    async fn handle_channel_open(&mut self, payload: &[u8]) -> PassageResult<()> {
        self.require_auth()?;
        let open = ChannelOpen::from_bytes(payload)?;

        if self.channels.len() >= self.config.max_channels {
            warn!(limit = self.config.max_channels, "channel table full");
            return self
                .refuse_open(
                    open.sender_channel,
                    ChannelOpenFailureReason::ResourceShortage,
                    "too many channels",
                )
                .await;
        }

        let local_id = self.next_channel_id;
        let init = ChannelInit {
            local_id,
            peer_id: open.sender_channel,
            peer_window: open.initial_window,
            max_packet: open.max_packet,
        };

        let handler: Box<dyn crate::ssh::channel::ChannelHandler> = match open.channel_type.as_str()
        {
            "session" => Box::new(SessionChannel::new(
                local_id,
                self.events_tx.clone(),
                self.config.spawn.clone(),
                self.config.session.clone(),
                self.profile.clone(),
            )),
            "direct-tcpip" => {
                if !self.config.allow_direct_tcpip {
                    return self
                        .refuse_open(
                            open.sender_channel,
                            ChannelOpenFailureReason::AdministrativelyProhibited,
                            "direct-tcpip disabled",
                        )
                        .await;
                }
                let request = DirectTcpipOpen::from_bytes(&open.type_specific)?;
                match DirectTcpipChannel::connect(
                    local_id,
                    &request.host,
                    request.port,
                    self.events_tx.clone(),
                )
                .await
                {
                    Ok(channel) => Box::new(channel),
                    Err(e) => {
                        return self
                            .refuse_open(
                                open.sender_channel,
                                ChannelOpenFailureReason::ConnectFailed,
                                &e.to_string(),
                            )
                            .await;
                    }
                }
            }
            other => {
                debug!(channel_type = %other, "unknown channel type");
                return self
                    .refuse_open(
                        open.sender_channel,
                        ChannelOpenFailureReason::UnknownChannelType,
                        "unknown channel type",
                    )
                    .await;
            }
        };

        self.next_channel_id += 1;

        let mut channel = Channel::new(init, handler);
        channel.confirm();
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: channel.peer_id,
            sender_channel: local_id,
            initial_window: RECEIVE_WINDOW,
            max_packet: CHANNEL_MAX_PACKET,
        }
        .to_bytes()?;

        info!(
            channel = local_id,
            channel_type = %open.channel_type,
            "channel opened"
        );
        self.channels.insert(local_id, channel);
        self.queue_channel_packet(confirmation)
    }

    async fn refuse_open(
        &mut self,
        peer_id: u32,
        reason: ChannelOpenFailureReason,
        description: &str,
    ) -> PassageResult<()> {
        let failure = ChannelOpenFailure {
            recipient_channel: peer_id,
            reason,
            description: description.to_string(),
        }
        .to_bytes()?;
        self.queue_channel_packet(failure)
    }

    fn channel_mut(&mut self, id: u32) -> PassageResult<&mut Channel> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| PassageError::Protocol(format!("message for unknown channel {}", id)))
    }

    async fn handle_channel_msg(&mut self, msg: u8, payload: &[u8]) -> PassageResult<()> {
        self.require_auth()?;

        match MessageType::from_u8(msg) {
            Some(MessageType::ChannelData) => {
                let data = ChannelData::from_bytes(payload)?;
                let channel = self.channel_mut(data.recipient_channel)?;
                channel.consume_local_window(data.data.len())?;
                channel.handler.on_data(&data.data).await?;

                if let Some(credit) = channel.refill_local_window() {
                    let adjust = ChannelWindowAdjust {
                        recipient_channel: channel.peer_id,
                        additional: credit,
                    }
                    .to_bytes()?;
                    self.queue_channel_packet(adjust)?;
                }
                Ok(())
            }
            Some(MessageType::ChannelExtendedData) => {
                let data = ChannelExtendedData::from_bytes(payload)?;
                let channel = self.channel_mut(data.recipient_channel)?;
                channel.consume_local_window(data.data.len())?;
                channel
                    .handler
                    .on_extended_data(data.data_type, &data.data)
                    .await?;

                if let Some(credit) = channel.refill_local_window() {
                    let adjust = ChannelWindowAdjust {
                        recipient_channel: channel.peer_id,
                        additional: credit,
                    }
                    .to_bytes()?;
                    self.queue_channel_packet(adjust)?;
                }
                Ok(())
            }
            Some(MessageType::ChannelWindowAdjust) => {
                let adjust = ChannelWindowAdjust::from_bytes(payload)?;
                let channel = self.channel_mut(adjust.recipient_channel)?;
                channel.add_peer_window(adjust.additional);
                Ok(())
            }
            Some(MessageType::ChannelEof) => {
                let eof = ChannelEof::from_bytes(payload)?;
                let channel = self.channel_mut(eof.recipient_channel)?;
                channel.mark_eof_received();
                channel.handler.on_eof().await
            }
            Some(MessageType::ChannelClose) => {
                let close = ChannelClose::from_bytes(payload)?;
                let id = close.recipient_channel;
                let channel = self.channel_mut(id)?;
                channel.mark_close_received();

                if !channel.close_sent() {
                    let reply = ChannelClose {
                        recipient_channel: channel.peer_id,
                    }
                    .to_bytes()?;
                    channel.mark_close_sent();
                    self.queue_channel_packet(reply)?;
                }

                if self.channels.get(&id).is_some_and(Channel::fully_closed) {
                    if let Some(mut channel) = self.channels.remove(&id) {
                        channel.handler.on_close();
                        info!(channel = id, "channel closed");
                    }
                }
                Ok(())
            }
            Some(MessageType::ChannelRequest) => {
                let request = ChannelRequest::from_bytes(payload)?;
                let channel = self.channel_mut(request.recipient_channel)?;
                let peer_id = channel.peer_id;

                let granted = channel
                    .handler
                    .on_request(&request.request_type, &request.type_specific)
                    .await?;

                debug!(
                    channel = request.recipient_channel,
                    request = %request.request_type,
                    granted,
                    "channel request"
                );

                if request.want_reply {
                    let reply = if granted {
                        ChannelSuccess {
                            recipient_channel: peer_id,
                        }
                        .to_bytes()?
                    } else {
                        ChannelFailure {
                            recipient_channel: peer_id,
                        }
                        .to_bytes()?
                    };
                    self.queue_channel_packet(reply)?;
                }
                Ok(())
            }
            Some(MessageType::ChannelSuccess) | Some(MessageType::ChannelFailure) => {
                // we never send want_reply requests
                Ok(())
            }
            _ => Err(PassageError::Internal(format!(
                "message {} routed to channel layer",
                msg
            ))),
        }
    }

    async fn handle_event(&mut self, event: ChannelEvent) -> PassageResult<()> {
        match event {
            ChannelEvent::Output { id, stream, data } => {
                // the channel may have been closed while the pump task
                // was still delivering
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.queue_output(stream, data)?;
                }
                Ok(())
            }
            ChannelEvent::SourceEof { id } => {
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.handler.on_source_eof();
                }
                Ok(())
            }
            ChannelEvent::ChildExit { id, outcome } => {
                debug!(channel = id, ?outcome, "child exited");
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.handler.on_child_exit(outcome);
                }
                Ok(())
            }
            ChannelEvent::Wakeup { id } => {
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.handler.on_wakeup().await?;
                }
                Ok(())
            }
        }
    }

    /// Per-iteration housekeeping: move window-permitted channel output
    /// to the transport, finish drained channels, manage write-blocked
    /// notifications, flush, and trigger rekeys.
    async fn pump(&mut self) -> PassageResult<()> {
        // channel traffic stays parked while a key exchange is in
        // flight; only transport messages may cross the wire then
        let ids: Vec<u32> = if self.kex_idle() {
            self.channels.keys().copied().collect()
        } else {
            Vec::new()
        };

        for id in ids {
            let Some(channel) = self.channels.get_mut(&id) else {
                continue;
            };

            for (stream, data) in channel.take_sendable() {
                let packet = match stream {
                    DataStream::Stdout => ChannelData {
                        recipient_channel: channel.peer_id,
                        data,
                    }
                    .to_bytes()?,
                    DataStream::Stderr => ChannelExtendedData {
                        recipient_channel: channel.peer_id,
                        data_type: EXTENDED_DATA_STDERR,
                        data,
                    }
                    .to_bytes()?,
                };
                self.transport.queue_packet(&packet)?;
            }

            if let Some(finish) = channel.take_finish() {
                let peer_id = channel.peer_id;
                if let Finish::Exit(outcome) = finish {
                    let request = match outcome {
                        ExitOutcome::Exited(code) => exit_status_request(peer_id, code)?,
                        ExitOutcome::Signaled(signal) => exit_signal_request(peer_id, signal)?,
                    };
                    self.transport.queue_packet(&request)?;
                }
                if !channel.eof_sent() {
                    channel.mark_eof_sent();
                    self.transport.queue_packet(
                        &ChannelEof {
                            recipient_channel: peer_id,
                        }
                        .to_bytes()?,
                    )?;
                }
                if !channel.close_sent() {
                    channel.mark_close_sent();
                    self.transport.queue_packet(
                        &ChannelClose {
                            recipient_channel: peer_id,
                        }
                        .to_bytes()?,
                    )?;
                }
            }

            if self.channels.get(&id).is_some_and(Channel::fully_closed) {
                if let Some(mut channel) = self.channels.remove(&id) {
                    channel.handler.on_close();
                    info!(channel = id, "channel closed");
                }
            }
        }

        if !self.write_blocked && self.transport.queued_bytes() > WRITE_HIGH_WATER {
            self.write_blocked = true;
            for channel in self.channels.values_mut() {
                channel.handler.on_write_blocked();
            }
        }

        self.transport.flush().await?;

        if self.write_blocked {
            self.write_blocked = false;
            for channel in self.channels.values_mut() {
                channel.handler.on_write_unblocked();
            }
        }

        // rekey under load without interrupting channel traffic
        if self.transport.should_rekey() && matches!(self.kex_state, KexState::Idle) {
            info!("rekey threshold reached");
            self.start_kex().await?;
        }

        Ok(())
    }
}
