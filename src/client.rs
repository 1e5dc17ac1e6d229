//! Connection lifecycle: config, the connect handshake, and the small
//! command surface external builders compose from.
//!
//! The protocol is strictly half-duplex per exchange; callers must not issue
//! two commands on one connection concurrently outside an active transfer.

use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rsa::RsaPublicKey;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::channel::FrameChannel;
use crate::codec::Width;
use crate::crypto;
use crate::error::{ProtoError, Result};
use crate::keepalive::{KeepAliveConfig, KeepAliveHandle, KeepAliveMonitor};
use crate::message::Message;
use crate::protocol::{self, timeouts};
use crate::status::Status;

fn default_key_len() -> usize {
    protocol::KEY_LEN_INTERVAL.0
}

fn default_buffer_size() -> usize {
    protocol::DFLT_MAX_BUFFER_SIZE
}

/// Deadlines and retry budget for connection establishment and socket I/O.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub dns_resolve_secs: u64,
    pub connect_secs: u64,
    pub connect_retries: u32,
    pub io_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            dns_resolve_secs: timeouts::DNS_RESOLVE_SECS,
            connect_secs: timeouts::CONNECT_SECS,
            connect_retries: timeouts::CONNECT_RETRIES,
            io_secs: timeouts::IO_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub address: String,
    pub port: u16,
    /// Protocol version string sent as the first handshake step.
    pub protocol_version: String,
    /// PEM public key used to wrap the session key.
    pub public_key_pem: String,
    /// Integrity hash the server validates as the last handshake step.
    pub client_hash: String,
    /// Session key length; out-of-range values are clamped to the minimum.
    #[serde(default = "default_key_len")]
    pub key_len: usize,
    /// Channel length proposed to the server during transfers.
    #[serde(default = "default_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Promote per-frame logging from trace to debug.
    #[serde(default)]
    pub verbose: bool,
}

/// Handle able to force-close the connection from another task. Keepalive
/// monitors hold a clone; a blocked operation then surfaces a socket error.
#[derive(Clone)]
pub struct ConnShutdown {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    socket: std::net::TcpStream,
    closed: AtomicBool,
}

impl ConnShutdown {
    fn new(socket: std::net::TcpStream) -> Self {
        ConnShutdown {
            inner: Arc::new(ShutdownInner {
                socket,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Shut the socket down in both directions. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inner.socket.shutdown(Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Raw socket access for keepalive socket options.
    pub(crate) fn raw_socket(&self) -> &std::net::TcpStream {
        &self.inner.socket
    }
}

pub struct Client {
    channel: FrameChannel,
    shutdown: ConnShutdown,
    session_key: Vec<u8>,
    pub(crate) config: ClientConfig,
}

impl Client {
    /// Resolve, connect and run the three-step handshake. A failing step
    /// closes the socket and is surfaced as [`ProtoError::Connect`] carrying
    /// the terminal status.
    pub async fn connect(config: ClientConfig) -> Result<Client> {
        let public_key = crypto::parse_public_key(&config.public_key_pem)?;
        let stream = open_socket(&config).await.map_err(ProtoError::Connect)?;
        stream.set_nodelay(true).ok();

        let std_stream = stream.into_std()?;
        let shutdown = ConnShutdown::new(std_stream.try_clone()?);
        let stream = TcpStream::from_std(std_stream)?;
        let channel = FrameChannel::new(stream)
            .io_timeout(Some(Duration::from_secs(config.timeouts.io_secs)));

        let mut client = Client {
            channel,
            shutdown,
            session_key: Vec::new(),
            config,
        };
        match client.handshake(&public_key).await {
            Ok(status) if status.is_ok() => {
                info!(
                    address = %client.config.address,
                    port = client.config.port,
                    "connected"
                );
                Ok(client)
            }
            Ok(status) => {
                client.shutdown.close();
                Err(ProtoError::Connect(status))
            }
            Err(e) => {
                client.shutdown.close();
                Err(e)
            }
        }
    }

    /// [`connect`](Self::connect), then start the keepalive monitor.
    pub async fn connect_with_keepalive(
        config: ClientConfig,
        keepalive: KeepAliveConfig,
    ) -> Result<(Client, KeepAliveHandle)> {
        let mut client = Client::connect(config).await?;
        let handle = KeepAliveMonitor::start(&mut client, keepalive, None).await?;
        Ok((client, handle))
    }

    async fn handshake(&mut self, public_key: &RsaPublicKey) -> Result<Status> {
        // Protocol version; plaintext, no cipher installed yet.
        let version = self.config.protocol_version.clone();
        let status = self.channel.translate(&Message::new(&version)).await?;
        if !status.is_ok() {
            return Ok(status);
        }

        // Session key, RSA-wrapped. The OK reply is still plaintext; the
        // ciphers start with the next frame.
        let key = crypto::random_session_key(self.config.key_len);
        let blob = crypto::encrypt_session_key(public_key, &key)?;
        let status = self
            .channel
            .translate(&Message::from(blob.as_slice()))
            .await?;
        if !status.is_ok() {
            return Ok(status);
        }
        self.channel.install_key(&key)?;
        self.session_key = key;

        // Client hash, first encrypted exchange.
        let hash = self.config.client_hash.clone();
        let status = self.channel.translate(&Message::new(&hash)).await?;
        if !status.is_ok() {
            return Ok(status);
        }
        Ok(Status::ok())
    }

    pub fn is_connected(&self) -> bool {
        !self.shutdown.is_closed()
    }

    pub fn session_key(&self) -> &[u8] {
        &self.session_key
    }

    /// The framed channel, for external command builders that compose their
    /// own send/recv/translate sequences.
    pub fn channel(&mut self) -> &mut FrameChannel {
        &mut self.channel
    }

    pub(crate) fn shutdown_handle(&self) -> ConnShutdown {
        self.shutdown.clone()
    }

    fn guard(&self) -> Result<()> {
        if self.shutdown.is_closed() {
            return Err(ProtoError::ChannelClosed);
        }
        Ok(())
    }

    /// One request/response exchange.
    pub async fn translate(&mut self, msg: &Message) -> Result<Status> {
        self.guard()?;
        if self.config.verbose {
            debug!(payload_len = msg.payload().len(), "translate");
        }
        self.channel.translate(msg).await
    }

    /// Debug command; the server echoes the argument back.
    pub async fn echo(&mut self, text: &str) -> Result<Status> {
        self.translate(&Message::new("ECHO").arg_str(text)).await
    }

    /// Send `END` and close the connection.
    pub async fn end(&mut self) -> Result<()> {
        self.guard()?;
        self.channel.send(&Message::new("END")).await?;
        self.disconnect();
        Ok(())
    }

    /// Close the connection. Idempotent; both cipher states die with it.
    pub fn disconnect(&mut self) {
        self.shutdown.close();
    }

    /// `NIGMA`: discard both cipher directions and rebuild them from a fresh
    /// server-issued session key of `key_len` bytes.
    pub async fn rotate_session_key(&mut self, key_len: usize) -> Result<Status> {
        if key_len < 8 || key_len % 4 != 0 {
            return Err(ProtoError::IllegalArgument(format!(
                "session key length must be a multiple of 4 and at least 8, got {key_len}"
            )));
        }
        let status = self
            .translate(&Message::new("NIGMA").arg_str(&key_len.to_string()))
            .await?;
        if !status.is_ok() {
            return Ok(status);
        }
        let len = self.channel.recv_int(Width::B4, false).await?;
        let key = self.channel.recv_exact(len as usize).await?;
        self.channel.install_key(&key)?;
        self.session_key = key;
        Ok(Status::ok())
    }

    /// `PROCKEY`: per-instance key used by the UDP process-check keepalive.
    pub async fn prockey(&mut self) -> Result<Status> {
        self.translate(&Message::new("PROCKEY")).await
    }

    /// `KEEPALIVE <on> <idle> | <interval> | <count>`: capability
    /// confirmation for the keepalive mechanisms.
    pub async fn keepalive_command(
        &mut self,
        on: bool,
        idle: u32,
        interval: u32,
        count: u32,
    ) -> Result<Status> {
        let msg = Message::new("KEEPALIVE")
            .arg_str(if on { "1" } else { "0" })
            .arg_int(idle as i64, Width::B4, false)?
            .arg_str("|")
            .arg_int(interval as i64, Width::B4, false)?
            .arg_str("|")
            .arg_int(count as i64, Width::B4, false)?;
        self.translate(&msg).await
    }
}

/// Resolve and open the TCP socket, reporting failures as structured
/// statuses rather than errors, as the connection step of the protocol
/// defines.
async fn open_socket(config: &ClientConfig) -> std::result::Result<TcpStream, Status> {
    let host = config.address.clone();
    let port = config.port;

    // DNS raced against a timer. On timeout the lookup task is abandoned,
    // not killed; a late result is discarded with the join handle.
    let lookup = tokio::spawn(async move {
        tokio::net::lookup_host((host.as_str(), port))
            .await
            .map(|mut addrs| addrs.next())
    });
    let dns_deadline = Duration::from_secs(config.timeouts.dns_resolve_secs);
    let addr = match tokio::time::timeout(dns_deadline, lookup).await {
        Err(_) => return Err(Status::parse_text("DISCONNECTED 0 time out dns")),
        Ok(Err(_)) => {
            return Err(Status::parse_text("DISCONNECTED 0 dns resolution aborted"))
        }
        Ok(Ok(Ok(Some(addr)))) => addr,
        Ok(Ok(_)) => {
            return Err(Status::parse_text(&format!(
                "DISCONNECTED 0 {} not found.",
                config.address
            )))
        }
    };

    let connect_deadline = Duration::from_secs(config.timeouts.connect_secs);
    let attempts = config.timeouts.connect_retries.max(1);
    for attempt in 1..=attempts {
        match tokio::time::timeout(connect_deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => debug!(attempt, error = %e, "connect attempt failed"),
            Err(_) => debug!(attempt, "connect attempt timed out"),
        }
    }
    Err(Status::parse_text("DISCONNECTED 0 connection time out"))
}
