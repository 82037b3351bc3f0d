//! Integration tests driving the whole server engine over an in-memory
//! duplex stream.
//!
//! The test client is a minimal SSH client built from the crate's own
//! wire primitives: it performs the real version exchange, a real
//! curve25519 key exchange with signature verification, password
//! authentication and channel operations, so every byte crosses the
//! same packet layer a network peer would exercise.

use passage_platform::{CredentialChecker, PassageResult};
use passage_proto::ssh::kex::{exchange_hash, ExchangeTranscript};
use passage_proto::ssh::{
    verify_ssh_signature, ChannelClose, ChannelData, ChannelEof, ChannelOpen,
    ChannelOpenConfirmation, ChannelRequest, ChannelWindowAdjust, CipherAlgorithm, Ed25519HostKey,
    KexInit, KeyMaterial, MessageType, OpeningContext, PacketReader, PacketWriter, SealingContext,
    ServerConfig, ServerSession, Transport, Version,
};
use passage_proto::ssh::kex_dh::Curve25519Exchange;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct TestCredentials;

#[async_trait::async_trait]
impl CredentialChecker for TestCredentials {
    async fn check_password(&self, user: &str, password: &str) -> PassageResult<bool> {
        Ok(user == "alice" && password == "correct horse")
    }
}

struct Harness {
    client: TestClient,
    server: JoinHandle<PassageResult<()>>,
    _shutdown: watch::Sender<bool>,
}

async fn start_server(configure: impl FnOnce(&mut ServerConfig)) -> Harness {
    let (client_stream, server_stream) = tokio::io::duplex(256 * 1024);

    let mut config = ServerConfig::new(Arc::new(Ed25519HostKey::from_seed(&[42u8; 32])));
    config.credentials = Arc::new(TestCredentials);
    configure(&mut config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let session = ServerSession::new(server_stream, Arc::new(config), shutdown_rx);
    let server = tokio::spawn(session.run());

    let client = TestClient::handshake(client_stream).await;
    Harness {
        client,
        server,
        _shutdown: shutdown_tx,
    }
}

/// Minimal SSH client over the crate's own transport.
struct TestClient {
    transport: Transport<DuplexStream>,
    session_id: Vec<u8>,
    client_version: String,
    server_version: String,
}

impl TestClient {
    async fn handshake(stream: DuplexStream) -> Self {
        let mut transport = Transport::new(stream);
        let (server_line, client_line) = transport
            .exchange_versions(&Version::new("testclient_1.0", None))
            .await
            .unwrap();
        assert!(server_line.starts_with("SSH-2.0-Passage_"));

        let mut client = Self {
            transport,
            session_id: Vec::new(),
            client_version: client_line,
            server_version: server_line,
        };
        let session_id = client.key_exchange().await;
        client.session_id = session_id;
        client
    }

    /// Runs one full key exchange; returns the exchange hash.
    async fn key_exchange(&mut self) -> Vec<u8> {
        let client_kexinit = KexInit::server_default("ssh-ed25519");
        let client_payload = client_kexinit.to_bytes().unwrap();
        self.transport.send_packet(&client_payload).await.unwrap();

        let server_payload = self.recv().await;
        assert_eq!(server_payload[0], MessageType::KexInit as u8);

        let exchange = Curve25519Exchange::new();
        let client_public = *exchange.public_key();
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::EcdhKexInit as u8).unwrap();
        w.put_string(&client_public).unwrap();
        self.transport.send_packet(w.as_slice()).await.unwrap();

        let reply = self.recv().await;
        let mut r = PacketReader::new(&reply);
        r.expect_msg(MessageType::EcdhKexInitReply).unwrap();
        let host_blob = r.get_string().unwrap().to_vec();
        let server_ephemeral = r.get_string().unwrap().to_vec();
        let signature = r.get_string().unwrap().to_vec();

        let shared = exchange.compute_shared_secret(&server_ephemeral).unwrap();
        let transcript = ExchangeTranscript {
            client_version: self.client_version.clone(),
            server_version: self.server_version.clone(),
            client_kexinit: client_payload,
            server_kexinit: server_payload,
        };
        let hash = exchange_hash(
            &transcript,
            &host_blob,
            &client_public,
            &server_ephemeral,
            &shared,
        )
        .unwrap();

        // the server must have signed H with its host key
        assert!(verify_ssh_signature(&host_blob, &signature, &hash).unwrap());

        let session_id = if self.session_id.is_empty() {
            hash.clone()
        } else {
            self.session_id.clone()
        };

        let cipher = CipherAlgorithm::ChaCha20Poly1305;
        let c2s = KeyMaterial::derive(cipher, None, &shared, &hash, &session_id, true).unwrap();
        let s2c = KeyMaterial::derive(cipher, None, &shared, &hash, &session_id, false).unwrap();
        self.transport.set_pending(
            SealingContext::new(cipher, None, &c2s).unwrap(),
            OpeningContext::new(cipher, None, &s2c).unwrap(),
        );

        let newkeys = self.recv().await;
        assert_eq!(newkeys, vec![MessageType::NewKeys as u8]);
        self.transport.install_pending_recv().unwrap();

        self.transport
            .send_packet(&[MessageType::NewKeys as u8])
            .await
            .unwrap();
        self.transport.install_pending_send().unwrap();

        hash
    }

    /// Client-initiated rekey: same exchange, session id retained.
    async fn rekey(&mut self) {
        self.key_exchange().await;
    }

    async fn recv(&mut self) -> Vec<u8> {
        timeout(TEST_TIMEOUT, self.transport.recv_packet())
            .await
            .expect("timed out waiting for server packet")
            .unwrap()
    }

    async fn send(&mut self, payload: &[u8]) {
        self.transport.send_packet(payload).await.unwrap();
    }

    async fn authenticate(&mut self) {
        let mut w = PacketWriter::new();
        w.put_u8(MessageType::ServiceRequest as u8).unwrap();
        w.put_str("ssh-userauth").unwrap();
        self.send(w.as_slice()).await;

        let accept = self.recv().await;
        assert_eq!(accept[0], MessageType::ServiceAccept as u8);

        let mut w = PacketWriter::new();
        w.put_u8(MessageType::UserauthRequest as u8).unwrap();
        w.put_str("alice").unwrap();
        w.put_str("ssh-connection").unwrap();
        w.put_str("password").unwrap();
        w.put_bool(false).unwrap();
        w.put_str("correct horse").unwrap();
        self.send(w.as_slice()).await;

        let success = self.recv().await;
        assert_eq!(success, vec![MessageType::UserauthSuccess as u8]);
    }

    async fn open_session(&mut self, peer_id: u32, window: u32) -> ChannelOpenConfirmation {
        let open = ChannelOpen {
            channel_type: "session".to_string(),
            sender_channel: peer_id,
            initial_window: window,
            max_packet: 0x8000,
            type_specific: Vec::new(),
        };
        self.send(&open.to_bytes().unwrap()).await;

        let reply = self.recv().await;
        ChannelOpenConfirmation::from_bytes(&reply).expect("expected open confirmation")
    }

    async fn request_exec(&mut self, recipient: u32, command: &str) {
        let mut body = PacketWriter::new();
        body.put_str(command).unwrap();
        let request = ChannelRequest {
            recipient_channel: recipient,
            request_type: "exec".to_string(),
            want_reply: true,
            type_specific: body.into_bytes(),
        };
        self.send(&request.to_bytes().unwrap()).await;

        let reply = self.recv().await;
        assert_eq!(
            reply[0],
            MessageType::ChannelSuccess as u8,
            "exec was refused"
        );
    }

    /// Collects session output until exit-status; returns (stdout,
    /// exit code). Consumes the EOF and CLOSE that follow and answers
    /// the CLOSE.
    async fn collect_exit(&mut self, local_id: u32, server_id: u32) -> (Vec<u8>, u32) {
        let mut stdout = Vec::new();
        let mut exit_code = None;

        loop {
            let payload = self.recv().await;
            match MessageType::from_u8(payload[0]) {
                Some(MessageType::ChannelData) => {
                    let data = ChannelData::from_bytes(&payload).unwrap();
                    assert_eq!(data.recipient_channel, local_id);
                    stdout.extend_from_slice(&data.data);
                }
                Some(MessageType::ChannelExtendedData) => {}
                Some(MessageType::ChannelRequest) => {
                    let request = ChannelRequest::from_bytes(&payload).unwrap();
                    assert_eq!(request.request_type, "exit-status");
                    let mut r = PacketReader::new(&request.type_specific);
                    exit_code = Some(r.get_u32().unwrap());
                }
                Some(MessageType::ChannelEof) => {
                    assert!(exit_code.is_some(), "EOF before exit-status");
                }
                Some(MessageType::ChannelClose) => {
                    self.send(
                        &ChannelClose {
                            recipient_channel: server_id,
                        }
                        .to_bytes()
                        .unwrap(),
                    )
                    .await;
                    break;
                }
                Some(MessageType::ChannelWindowAdjust) => {}
                other => panic!("unexpected message during exit: {:?}", other),
            }
        }

        (stdout, exit_code.unwrap())
    }
}

#[tokio::test]
async fn test_banner_and_kex_handshake() {
    let harness = start_server(|_| {}).await;
    // handshake already asserted the banner prefix and the signature
    // over the exchange hash
    assert_eq!(harness.client.session_id.len(), 32);
}

#[tokio::test]
async fn test_password_auth_and_exec_echo() {
    let mut harness = start_server(|_| {}).await;
    harness.client.authenticate().await;

    let confirmation = harness.client.open_session(0, 0x200000).await;
    assert_eq!(confirmation.recipient_channel, 0);
    assert_eq!(confirmation.sender_channel, 0);
    assert_eq!(confirmation.initial_window, 0x100000);

    harness.client.request_exec(0, "printf hi").await;
    let (stdout, code) = harness.client.collect_exit(0, 0).await;
    assert_eq!(stdout, b"hi");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_exec_nonzero_exit_status() {
    let mut harness = start_server(|_| {}).await;
    harness.client.authenticate().await;
    harness.client.open_session(0, 0x200000).await;

    harness.client.request_exec(0, "exit 4").await;
    let (_, code) = harness.client.collect_exit(0, 0).await;
    assert_eq!(code, 4);
}

#[tokio::test]
async fn test_wrong_password_fails() {
    let mut harness = start_server(|_| {}).await;
    let client = &mut harness.client;

    let mut w = PacketWriter::new();
    w.put_u8(MessageType::ServiceRequest as u8).unwrap();
    w.put_str("ssh-userauth").unwrap();
    client.send(w.as_slice()).await;
    let accept = client.recv().await;
    assert_eq!(accept[0], MessageType::ServiceAccept as u8);

    let mut w = PacketWriter::new();
    w.put_u8(MessageType::UserauthRequest as u8).unwrap();
    w.put_str("alice").unwrap();
    w.put_str("ssh-connection").unwrap();
    w.put_str("password").unwrap();
    w.put_bool(false).unwrap();
    w.put_str("wrong").unwrap();
    client.send(w.as_slice()).await;

    let failure = client.recv().await;
    assert_eq!(failure[0], MessageType::UserauthFailure as u8);
    let mut r = PacketReader::new(&failure[1..]);
    assert_eq!(r.get_name_list().unwrap(), vec!["publickey", "password"]);
}

#[tokio::test]
async fn test_window_exhaustion_stalls_and_resumes() {
    let mut harness = start_server(|_| {}).await;
    harness.client.authenticate().await;

    // a 5-byte receive window on our side
    harness.client.open_session(0, 5).await;
    harness.client.request_exec(0, "printf 0123456789").await;

    // exactly the window's worth arrives, possibly fragmented
    let mut received = Vec::new();
    while received.len() < 5 {
        let payload = harness.client.recv().await;
        let data = ChannelData::from_bytes(&payload).unwrap();
        received.extend_from_slice(&data.data);
    }
    assert_eq!(received, b"01234");

    // the server must stall: nothing else until we adjust
    let stalled = timeout(
        Duration::from_millis(200),
        harness.client.transport.recv_packet(),
    )
    .await;
    assert!(stalled.is_err(), "server sent data beyond the window");

    harness
        .client
        .send(
            &ChannelWindowAdjust {
                recipient_channel: 0,
                additional: 5,
            }
            .to_bytes()
            .unwrap(),
        )
        .await;

    let mut received = Vec::new();
    while received.len() < 5 {
        let payload = harness.client.recv().await;
        let data = ChannelData::from_bytes(&payload).unwrap();
        received.extend_from_slice(&data.data);
    }
    assert_eq!(received, b"56789");

    // exit still needs window for nothing, so the sequence completes
    harness
        .client
        .send(
            &ChannelWindowAdjust {
                recipient_channel: 0,
                additional: 1024,
            }
            .to_bytes()
            .unwrap(),
        )
        .await;
    let (stdout, code) = harness.client.collect_exit(0, 0).await;
    assert!(stdout.is_empty());
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_stdin_round_trip_through_child() {
    let mut harness = start_server(|_| {}).await;
    harness.client.authenticate().await;
    harness.client.open_session(0, 0x200000).await;
    harness.client.request_exec(0, "cat").await;

    harness
        .client
        .send(
            &ChannelData {
                recipient_channel: 0,
                data: b"through the gateway".to_vec(),
            }
            .to_bytes()
            .unwrap(),
        )
        .await;
    harness
        .client
        .send(&ChannelEof { recipient_channel: 0 }.to_bytes().unwrap())
        .await;

    let (stdout, code) = harness.client.collect_exit(0, 0).await;
    assert_eq!(stdout, b"through the gateway");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_rekey_preserves_session() {
    let mut harness = start_server(|_| {}).await;
    harness.client.authenticate().await;
    harness.client.open_session(0, 0x200000).await;

    let session_id_before = harness.client.session_id.clone();

    // client-initiated rekey with the channel open
    harness.client.rekey().await;
    assert_eq!(harness.client.session_id, session_id_before);

    // the channel still works under the new keys
    harness.client.request_exec(0, "printf rekeyed").await;
    let (stdout, code) = harness.client.collect_exit(0, 0).await;
    assert_eq!(stdout, b"rekeyed");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_direct_tcpip_proxies_upstream() {
    let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let echo = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.unwrap();
        let (mut read, mut write) = stream.split();
        tokio::io::copy(&mut read, &mut write).await.unwrap();
    });

    let mut harness = start_server(|_| {}).await;
    harness.client.authenticate().await;

    let mut type_specific = PacketWriter::new();
    type_specific.put_str("127.0.0.1").unwrap();
    type_specific.put_u32(upstream_addr.port() as u32).unwrap();
    type_specific.put_str("10.0.0.1").unwrap();
    type_specific.put_u32(50000).unwrap();

    let open = ChannelOpen {
        channel_type: "direct-tcpip".to_string(),
        sender_channel: 9,
        initial_window: 0x100000,
        max_packet: 0x8000,
        type_specific: type_specific.into_bytes(),
    };
    harness.client.send(&open.to_bytes().unwrap()).await;

    let reply = harness.client.recv().await;
    let confirmation = ChannelOpenConfirmation::from_bytes(&reply).unwrap();
    assert_eq!(confirmation.recipient_channel, 9);
    let server_id = confirmation.sender_channel;

    harness
        .client
        .send(
            &ChannelData {
                recipient_channel: server_id,
                data: b"ping".to_vec(),
            }
            .to_bytes()
            .unwrap(),
        )
        .await;

    let payload = harness.client.recv().await;
    let data = ChannelData::from_bytes(&payload).unwrap();
    assert_eq!(data.data, b"ping");

    drop(echo);
}

#[tokio::test]
async fn test_direct_tcpip_can_be_prohibited() {
    let mut harness = start_server(|config| {
        config.allow_direct_tcpip = false;
    })
    .await;
    harness.client.authenticate().await;

    let mut type_specific = PacketWriter::new();
    type_specific.put_str("127.0.0.1").unwrap();
    type_specific.put_u32(22).unwrap();
    type_specific.put_str("10.0.0.1").unwrap();
    type_specific.put_u32(50000).unwrap();

    let open = ChannelOpen {
        channel_type: "direct-tcpip".to_string(),
        sender_channel: 0,
        initial_window: 0x100000,
        max_packet: 0x8000,
        type_specific: type_specific.into_bytes(),
    };
    harness.client.send(&open.to_bytes().unwrap()).await;

    let reply = harness.client.recv().await;
    assert_eq!(reply[0], MessageType::ChannelOpenFailure as u8);
    let mut r = PacketReader::new(&reply[1..]);
    assert_eq!(r.get_u32().unwrap(), 0);
    // ADMINISTRATIVELY_PROHIBITED
    assert_eq!(r.get_u32().unwrap(), 1);
}

#[tokio::test]
async fn test_channel_message_before_auth_disconnects() {
    let mut harness = start_server(|_| {}).await;

    harness
        .client
        .send(
            &ChannelData {
                recipient_channel: 0,
                data: b"sneaky".to_vec(),
            }
            .to_bytes()
            .unwrap(),
        )
        .await;

    let reply = harness.client.recv().await;
    assert_eq!(reply[0], MessageType::Disconnect as u8);
    let mut r = PacketReader::new(&reply[1..]);
    // PROTOCOL_ERROR
    assert_eq!(r.get_u32().unwrap(), 2);

    let result = timeout(TEST_TIMEOUT, harness.server).await.unwrap().unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_graceful_shutdown_sends_disconnect() {
    let mut harness = start_server(|_| {}).await;
    harness.client.authenticate().await;

    harness._shutdown.send(true).unwrap();

    let reply = harness.client.recv().await;
    assert_eq!(reply[0], MessageType::Disconnect as u8);
    let mut r = PacketReader::new(&reply[1..]);
    // BY_APPLICATION
    assert_eq!(r.get_u32().unwrap(), 11);

    let result = timeout(TEST_TIMEOUT, harness.server).await.unwrap().unwrap();
    assert!(result.is_ok());
}
