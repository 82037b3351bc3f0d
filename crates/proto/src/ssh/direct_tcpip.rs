//! direct-tcpip channels: outgoing TCP proxying (RFC 4254
//! Section 7.2).
//!
//! The client asks us to connect to a host:port and splice the channel
//! onto the resulting stream. The upstream connection is made while the
//! CHANNEL_OPEN is being handled; failure to connect refuses the open
//! with CONNECT_FAILED. After that the channel is a byte pipe: upstream
//! reads become CHANNEL_DATA through the connection's event queue,
//! inbound CHANNEL_DATA is reassembled and written upstream with the
//! same buffered backpressure the session stdin path uses.

use crate::ssh::buffered::BufferedChannel;
use crate::ssh::channel::{ChannelEvent, ChannelHandler, DataStream, Finish};
use passage_platform::{PassageError, PassageResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PUMP_CHUNK: usize = 32 * 1024;
const WRITE_QUEUE: usize = 8;

/// A direct-tcpip channel splicing the peer onto an upstream TCP
/// stream.
pub struct DirectTcpipChannel {
    local_id: u32,
    inbound: BufferedChannel,
    write_tx: Option<mpsc::Sender<Vec<u8>>>,
    upstream_open: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl DirectTcpipChannel {
    /// Connects to `host:port` and wires the pumps. Returns a
    /// connect failure (for CHANNEL_OPEN_FAILURE) if the upstream is
    /// unreachable.
    pub async fn connect(
        local_id: u32,
        host: &str,
        port: u32,
        events: mpsc::Sender<ChannelEvent>,
    ) -> PassageResult<Self> {
        let address = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&address).await.map_err(|e| {
            PassageError::Io(std::io::Error::new(
                e.kind(),
                format!("direct-tcpip connect to {} failed: {}", address, e),
            ))
        })?;

        debug!(channel = local_id, upstream = %address, "direct-tcpip connected");

        let (read_half, write_half) = stream.into_split();
        let mut channel = Self {
            local_id,
            inbound: BufferedChannel::new(),
            write_tx: None,
            upstream_open: true,
            tasks: Vec::new(),
        };
        channel.spawn_reader(read_half, events.clone());
        channel.spawn_writer(write_half, events);
        Ok(channel)
    }

    fn spawn_reader(&mut self, mut read_half: OwnedReadHalf, events: mpsc::Sender<ChannelEvent>) {
        let id = self.local_id;
        self.tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_CHUNK];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Err(e) => {
                        warn!(channel = id, error = %e, "upstream read failed");
                        break;
                    }
                    Ok(n) => {
                        if events
                            .send(ChannelEvent::Output {
                                id,
                                stream: DataStream::Stdout,
                                data: buf[..n].to_vec(),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
            let _ = events.send(ChannelEvent::SourceEof { id }).await;
        }));
    }

    fn spawn_writer(&mut self, mut write_half: OwnedWriteHalf, events: mpsc::Sender<ChannelEvent>) {
        let id = self.local_id;
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE);
        self.write_tx = Some(tx);

        self.tasks.push(tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
                if events.send(ChannelEvent::Wakeup { id }).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        }));
    }

    fn drain_inbound(&mut self) {
        let Some(tx) = &self.write_tx else {
            self.inbound.drain(|bytes| bytes.len());
            self.check_inbound_eof();
            return;
        };

        loop {
            let mut progressed = false;
            self.inbound.drain(|bytes| match tx.try_reserve() {
                Ok(permit) => {
                    let take = bytes.len().min(PUMP_CHUNK);
                    permit.send(bytes[..take].to_vec());
                    progressed = true;
                    take
                }
                Err(_) => 0,
            });
            if !progressed || self.inbound.is_empty() {
                break;
            }
        }

        self.check_inbound_eof();
    }

    fn check_inbound_eof(&mut self) {
        if self.inbound.take_buffered_eof() {
            // half-close towards the upstream
            self.write_tx = None;
        }
    }
}

#[async_trait::async_trait]
impl ChannelHandler for DirectTcpipChannel {
    async fn on_data(&mut self, data: &[u8]) -> PassageResult<()> {
        self.inbound.push(data);
        self.drain_inbound();
        Ok(())
    }

    async fn on_eof(&mut self) -> PassageResult<()> {
        self.inbound.set_eof();
        self.drain_inbound();
        Ok(())
    }

    async fn on_wakeup(&mut self) -> PassageResult<()> {
        self.drain_inbound();
        Ok(())
    }

    async fn on_request(
        &mut self,
        request_type: &str,
        _type_specific: &[u8],
    ) -> PassageResult<bool> {
        // direct-tcpip channels take no requests
        debug!(channel = self.local_id, request = %request_type, "request on direct-tcpip channel");
        Ok(false)
    }

    fn on_source_eof(&mut self) {
        self.upstream_open = false;
    }

    fn finish_status(&self) -> Option<Finish> {
        (!self.upstream_open).then_some(Finish::Plain)
    }

    fn on_close(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.tasks.clear();
        self.write_tx = None;
    }
}

impl Drop for DirectTcpipChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_proxies_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // upstream that reverses the classic echo: reads a line and
        // writes a fixed banner first
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"banner").await.unwrap();

            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let mut channel = DirectTcpipChannel::connect(3, "127.0.0.1", addr.port() as u32, events_tx)
            .await
            .unwrap();

        // upstream banner arrives as channel output
        let mut banner = Vec::new();
        while banner.len() < 6 {
            match events_rx.recv().await.unwrap() {
                ChannelEvent::Output { data, .. } => banner.extend_from_slice(&data),
                ChannelEvent::Wakeup { .. } => {}
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(banner, b"banner");

        // channel data flows to the upstream, then EOF half-closes
        channel.on_data(b"to-upstream").await.unwrap();
        channel.on_eof().await.unwrap();

        assert_eq!(server.await.unwrap(), b"to-upstream");

        // upstream closing finishes the channel
        loop {
            match events_rx.recv().await.unwrap() {
                ChannelEvent::SourceEof { .. } => {
                    channel.on_source_eof();
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(channel.finish_status(), Some(Finish::Plain));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        // a port that nothing listens on
        let result = DirectTcpipChannel::connect(0, "127.0.0.1", 1, events_tx).await;
        assert!(matches!(result, Err(PassageError::Io(_))));
    }
}
