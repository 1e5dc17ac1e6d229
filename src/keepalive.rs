//! Connection liveness monitoring, independent of command traffic.
//!
//! Three mechanisms: native TCP keepalive socket options, a 1-byte UDP
//! ping/pong against the host, and a keyed UDP ping tied to the serving
//! process via the `PROCKEY`/`KEEPALIVE` control handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{Client, ConnShutdown};
use crate::error::{ProtoError, Result};

/// Callback fired once when the monitor force-closes the connection.
pub type OnConnectionClosed = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepAliveMechanism {
    /// Delegate to the OS TCP keepalive options; no monitor loop runs.
    TcpNative,
    /// 1-byte UDP ping/pong probing the host.
    UdpHostCheck,
    /// Keyed UDP ping probing the serving process itself.
    UdpProcCheck,
}

fn default_idle() -> u64 {
    5
}

fn default_timeout() -> u64 {
    3
}

fn default_max_tries() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeepAliveConfig {
    pub mechanism: KeepAliveMechanism,
    /// Seconds between probes.
    #[serde(default = "default_idle")]
    pub idle_secs: u64,
    /// Per-probe reply deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Consecutive failures tolerated before the connection is closed.
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
}

/// Handle to a running monitor. Dropping it does not stop the loop; call
/// [`stop`](KeepAliveHandle::stop).
pub struct KeepAliveHandle {
    active: Arc<AtomicBool>,
    shutdown: ConnShutdown,
    task: Option<JoinHandle<()>>,
}

impl KeepAliveHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the monitor: exit the loop, release the UDP socket and close the
    /// main connection. Idempotent.
    pub fn stop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.shutdown.close();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct KeepAliveMonitor;

impl KeepAliveMonitor {
    /// Install the chosen mechanism on an established connection and start
    /// its loop. For [`KeepAliveMechanism::UdpProcCheck`] this first runs the
    /// `PROCKEY` + `KEEPALIVE` handshake on the main channel, retried up to
    /// `max_tries` times; exhausting the retries closes the connection.
    pub async fn start(
        client: &mut Client,
        config: KeepAliveConfig,
        on_closed: Option<OnConnectionClosed>,
    ) -> Result<KeepAliveHandle> {
        let shutdown = client.shutdown_handle();
        let active = Arc::new(AtomicBool::new(true));

        if config.mechanism == KeepAliveMechanism::TcpNative {
            configure_native(&shutdown, &config)?;
            // The kernel does the probing; nothing to run.
            return Ok(KeepAliveHandle {
                active,
                shutdown,
                task: None,
            });
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect((client.config.address.as_str(), client.config.port))
            .await?;

        let prockey = match config.mechanism {
            KeepAliveMechanism::UdpProcCheck => {
                match proccheck_handshake(client, &config).await {
                    Ok(key) => key,
                    Err(e) => {
                        // A forced close always reaches the callback.
                        shutdown.close();
                        if let Some(cb) = on_closed {
                            cb();
                        }
                        return Err(e);
                    }
                }
            }
            _ => Vec::new(),
        };

        let loop_active = Arc::clone(&active);
        let loop_shutdown = shutdown.clone();
        let task = tokio::spawn(probe_loop(
            socket,
            config,
            prockey,
            loop_active,
            loop_shutdown,
            on_closed,
        ));
        Ok(KeepAliveHandle {
            active,
            shutdown,
            task: Some(task),
        })
    }
}

fn configure_native(shutdown: &ConnShutdown, config: &KeepAliveConfig) -> Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(config.idle_secs))
        .with_interval(Duration::from_secs(config.timeout_secs))
        .with_retries(config.max_tries);
    SockRef::from(shutdown.raw_socket()).set_tcp_keepalive(&keepalive)?;
    debug!(
        idle = config.idle_secs,
        interval = config.timeout_secs,
        retries = config.max_tries,
        "native tcp keepalive configured"
    );
    Ok(())
}

/// `PROCKEY` for the per-instance key, then `KEEPALIVE` to confirm the
/// server will answer keyed UDP probes.
async fn proccheck_handshake(client: &mut Client, config: &KeepAliveConfig) -> Result<Vec<u8>> {
    let mut last = None;
    for attempt in 1..=config.max_tries.max(1) {
        let key_status = client.prockey().await?;
        if !key_status.is_ok() || key_status.message.is_empty() {
            debug!(attempt, %key_status, "prockey attempt failed");
            last = Some(key_status);
            continue;
        }
        let confirm = client
            .keepalive_command(true, 1, config.idle_secs as u32, config.max_tries)
            .await?;
        if confirm.is_ok() {
            return Ok(key_status.message.into_bytes());
        }
        debug!(attempt, %confirm, "keepalive confirmation failed");
        last = Some(confirm);
    }
    Err(ProtoError::Server(last.unwrap_or_else(|| {
        crate::status::Status::parse_text("FAILED 0 keepalive handshake exhausted")
    })))
}

async fn probe_loop(
    socket: UdpSocket,
    config: KeepAliveConfig,
    prockey: Vec<u8>,
    active: Arc<AtomicBool>,
    shutdown: ConnShutdown,
    mut on_closed: Option<OnConnectionClosed>,
) {
    let idle = Duration::from_secs(config.idle_secs);
    let deadline = Duration::from_secs(config.timeout_secs);
    let mut failures: u32 = 0;

    let ping: Vec<u8> = match config.mechanism {
        KeepAliveMechanism::UdpHostCheck => vec![0],
        KeepAliveMechanism::UdpProcCheck => {
            let mut p = Vec::with_capacity(1 + prockey.len());
            p.push(1);
            p.extend_from_slice(&prockey);
            p
        }
        KeepAliveMechanism::TcpNative => return,
    };

    while active.load(Ordering::SeqCst) && !shutdown.is_closed() {
        let pong = probe_once(&socket, &ping, deadline).await;
        match (config.mechanism, pong) {
            (_, Some(1)) => failures = 0,
            (KeepAliveMechanism::UdpProcCheck, Some(0)) => {
                warn!("server requested close");
                break;
            }
            (_, other) => {
                failures += 1;
                debug!(failures, pong = ?other, "keepalive probe failed");
            }
        }
        if failures >= config.max_tries {
            warn!(failures, "keepalive threshold reached, closing connection");
            break;
        }
        tokio::time::sleep(idle).await;
    }

    // Socket closes with the task; the main connection goes down with it.
    active.store(false, Ordering::SeqCst);
    shutdown.close();
    if let Some(cb) = on_closed.take() {
        cb();
    }
}

async fn probe_once(socket: &UdpSocket, ping: &[u8], deadline: Duration) -> Option<u8> {
    if socket.send(ping).await.is_err() {
        return None;
    }
    let mut buf = [0u8; 1];
    match tokio::time::timeout(deadline, socket.recv(&mut buf)).await {
        Ok(Ok(n)) if n == 1 => Some(buf[0]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_times_out_against_silence() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(silent.local_addr().unwrap()).await.unwrap();

        let pong = probe_once(&socket, &[0], Duration::from_millis(50)).await;
        assert_eq!(pong, None);
    }

    #[tokio::test]
    async fn probe_reads_pong_byte() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(server_addr).await.unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0]);
            server.send_to(&[1], peer).await.unwrap();
        });

        let pong = probe_once(&socket, &[0], Duration::from_secs(2)).await;
        assert_eq!(pong, Some(1));
        responder.await.unwrap();
    }

    #[test]
    fn mechanism_deserializes_snake_case() {
        #[derive(Deserialize)]
        struct Wrap {
            keepalive: KeepAliveConfig,
        }
        let raw = r#"
            [keepalive]
            mechanism = "udp_host_check"
            idle_secs = 7
        "#;
        let wrap: Wrap = toml::from_str(raw).unwrap();
        assert_eq!(wrap.keepalive.mechanism, KeepAliveMechanism::UdpHostCheck);
        assert_eq!(wrap.keepalive.idle_secs, 7);
        assert_eq!(wrap.keepalive.max_tries, default_max_tries());
    }
}
