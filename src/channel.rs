//! Length-prefixed framing over one connected TCP socket, encrypting and
//! decrypting through the per-direction session ciphers.
//!
//! `recv` never returns a short read: it loops until the declared body length
//! has arrived or the socket dies. A whole frame span is always run through
//! the cipher in one call so both ends stay on identical boundaries.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::cipher::SessionCipher;
use crate::codec::{self, Width};
use crate::error::{ProtoError, Result};
use crate::message::Message;
use crate::protocol;
use crate::status::Status;

fn map_io(e: io::Error) -> ProtoError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ProtoError::ChannelClosed,
        _ => ProtoError::Io(e),
    }
}

async fn timed_io<T>(
    deadline: Option<Duration>,
    what: &'static str,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T> {
    match deadline {
        None => fut.await.map_err(map_io),
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(res) => res.map_err(map_io),
            Err(_) => Err(ProtoError::Timeout {
                what,
                ms: d.as_millis() as u64,
            }),
        },
    }
}

async fn read_span<R: AsyncRead + Unpin>(
    stream: &mut R,
    cipher: &mut Option<SessionCipher>,
    len: usize,
    max: usize,
    deadline: Option<Duration>,
) -> Result<Vec<u8>> {
    if len > max {
        return Err(ProtoError::FrameTooLarge {
            claimed: len as i64,
            max,
        });
    }
    let mut buf = vec![0u8; len];
    if len > 0 {
        timed_io(deadline, "socket read", stream.read_exact(&mut buf)).await?;
    }
    if let Some(c) = cipher.as_mut() {
        c.decrypt(&mut buf);
    }
    Ok(buf)
}

async fn write_span<W: AsyncWrite + Unpin>(
    stream: &mut W,
    cipher: &mut Option<SessionCipher>,
    bytes: &[u8],
    deadline: Option<Duration>,
) -> Result<()> {
    let mut buf = bytes.to_vec();
    if let Some(c) = cipher.as_mut() {
        c.encrypt(&mut buf);
    }
    timed_io(deadline, "socket write", stream.write_all(&buf)).await
}

pub struct FrameChannel {
    stream: TcpStream,
    inbound: Option<SessionCipher>,
    outbound: Option<SessionCipher>,
    max_frame_size: usize,
    io_timeout: Option<Duration>,
}

impl FrameChannel {
    pub fn new(stream: TcpStream) -> Self {
        FrameChannel {
            stream,
            inbound: None,
            outbound: None,
            max_frame_size: protocol::MAX_FRAME_SIZE,
            io_timeout: Some(protocol::timeouts::io()),
        }
    }

    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn io_timeout(mut self, deadline: Option<Duration>) -> Self {
        self.io_timeout = deadline;
        self
    }

    /// Build both cipher directions from a freshly exchanged session key.
    /// Discards any previous cipher state.
    pub fn install_key(&mut self, key: &[u8]) -> Result<()> {
        self.inbound = Some(SessionCipher::new(key)?);
        self.outbound = Some(SessionCipher::new(key)?);
        Ok(())
    }

    pub fn has_key(&self) -> bool {
        self.inbound.is_some()
    }

    /// Send a framed message: encrypted header, then encrypted payload, as
    /// two writes.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let header = msg.header_bytes()?;
        trace!(header_len = header.len(), payload_len = msg.payload().len(), "send frame");
        write_span(&mut self.stream, &mut self.outbound, &header, self.io_timeout).await?;
        write_span(&mut self.stream, &mut self.outbound, msg.payload(), self.io_timeout).await
    }

    /// Send a bare fixed-width integer (no frame around it).
    pub async fn send_int(&mut self, value: i64, width: Width, signed: bool) -> Result<()> {
        let encoded = codec::encode_integer(value, Some(width), signed)?;
        write_span(&mut self.stream, &mut self.outbound, &encoded, self.io_timeout).await
    }

    /// Send raw bytes through the cipher with no header.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        write_span(&mut self.stream, &mut self.outbound, bytes, self.io_timeout).await
    }

    /// Send one data chunk: 8-byte signed length header, then the payload.
    pub async fn send_chunk(&mut self, payload: &[u8]) -> Result<()> {
        self.send_int(payload.len() as i64, Width::B8, true).await?;
        self.send_raw(payload).await
    }

    /// Receive and decrypt exactly `len` bytes.
    pub async fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        read_span(
            &mut self.stream,
            &mut self.inbound,
            len,
            self.max_frame_size,
            self.io_timeout,
        )
        .await
    }

    /// Receive and decode a bare fixed-width integer.
    pub async fn recv_int(&mut self, width: Width, signed: bool) -> Result<i64> {
        let bytes = self.recv_exact(width.bytes()).await?;
        Ok(codec::decode_integer(&bytes, signed)?)
    }

    /// Receive one framed reply: a `header_width` declared length followed by
    /// exactly that many body bytes, parsed into a [`Status`].
    pub async fn recv_status(&mut self, header_width: Width, signed: bool) -> Result<Status> {
        let declared = self.recv_int(header_width, signed).await?;
        if declared < 0 {
            return Err(ProtoError::BadFrame(format!(
                "negative declared length {declared}"
            )));
        }
        let body = self.recv_exact(declared as usize).await?;
        let status = Status::from_frame(declared, &body);
        trace!(declared, %status, "recv frame");
        Ok(status)
    }

    /// One request/response exchange; the reply header is read with the same
    /// width and signedness the request used.
    pub async fn translate(&mut self, msg: &Message) -> Result<Status> {
        self.send(msg).await?;
        let width = Width::from_bytes(msg.header_width_bytes())?;
        self.recv_status(width, msg.header_signed()).await
    }

    /// Split into per-direction halves so a transfer's two cooperating tasks
    /// can pump the socket concurrently, each owning one cipher direction.
    pub fn split(&mut self) -> (ChannelReader<'_>, ChannelWriter<'_>) {
        let (rd, wr) = self.stream.split();
        (
            ChannelReader {
                half: rd,
                cipher: &mut self.inbound,
                max_frame_size: self.max_frame_size,
                io_timeout: self.io_timeout,
            },
            ChannelWriter {
                half: wr,
                cipher: &mut self.outbound,
                io_timeout: self.io_timeout,
            },
        )
    }

    /// Access to the underlying socket for connection-level options.
    pub fn socket(&self) -> &TcpStream {
        &self.stream
    }
}

/// Inbound half of a split channel.
pub struct ChannelReader<'a> {
    half: ReadHalf<'a>,
    cipher: &'a mut Option<SessionCipher>,
    max_frame_size: usize,
    io_timeout: Option<Duration>,
}

impl ChannelReader<'_> {
    pub async fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        read_span(
            &mut self.half,
            self.cipher,
            len,
            self.max_frame_size,
            self.io_timeout,
        )
        .await
    }

    pub async fn recv_int(&mut self, width: Width, signed: bool) -> Result<i64> {
        let bytes = self.recv_exact(width.bytes()).await?;
        Ok(codec::decode_integer(&bytes, signed)?)
    }
}

/// Outbound half of a split channel.
pub struct ChannelWriter<'a> {
    half: WriteHalf<'a>,
    cipher: &'a mut Option<SessionCipher>,
    io_timeout: Option<Duration>,
}

impl ChannelWriter<'_> {
    pub async fn send_int(&mut self, value: i64, width: Width, signed: bool) -> Result<()> {
        let encoded = codec::encode_integer(value, Some(width), signed)?;
        write_span(&mut self.half, self.cipher, &encoded, self.io_timeout).await
    }

    /// Send one data chunk: 8-byte signed length header, then the payload.
    pub async fn send_chunk(&mut self, payload: &[u8]) -> Result<()> {
        self.send_int(payload.len() as i64, Width::B8, true).await?;
        write_span(&mut self.half, self.cipher, payload, self.io_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Width;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn recv_reassembles_short_reads() {
        let (client, mut server) = pair().await;
        let mut channel = FrameChannel::new(client);

        let writer = tokio::spawn(async move {
            // 4-byte header declaring 10 bytes, body dribbled in three writes
            server.write_all(&[0, 0, 0, 10]).await.unwrap();
            server.flush().await.unwrap();
            for part in [&b"OK "[..], &b"hell"[..], &b"o j"[..]] {
                tokio::time::sleep(Duration::from_millis(5)).await;
                server.write_all(part).await.unwrap();
                server.flush().await.unwrap();
            }
            server
        });

        let status = channel.recv_status(Width::B4, true).await.unwrap();
        assert!(status.is_ok());
        assert_eq!(status.message, "hello j");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_claim_is_rejected_without_allocation() {
        let (client, mut server) = pair().await;
        let mut channel = FrameChannel::new(client).max_frame_size(1024);

        server.write_all(&[0x7F, 0xFF, 0xFF, 0xFF]).await.unwrap();
        let err = channel.recv_status(Width::B4, true).await.unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn closed_socket_mid_body_errors() {
        let (client, mut server) = pair().await;
        let mut channel = FrameChannel::new(client);

        server.write_all(&[0, 0, 0, 8]).await.unwrap();
        server.write_all(b"par").await.unwrap();
        drop(server);

        let err = channel.recv_status(Width::B4, true).await.unwrap_err();
        assert!(matches!(err, ProtoError::ChannelClosed));
    }

    #[tokio::test]
    async fn encrypted_translate_round_trip() {
        let key: Vec<u8> = (0u8..24).collect();
        let (client, server) = pair().await;
        let mut channel = FrameChannel::new(client);
        channel.install_key(&key).unwrap();

        let key_srv = key.clone();
        let peer = tokio::spawn(async move {
            let mut srv = FrameChannel::new(server);
            srv.install_key(&key_srv).unwrap();
            let req = srv.recv_status(Width::B4, true).await.unwrap();
            // The request is no status; the raw payload comes back UNKNOWN
            assert_eq!(req.message, "ECHO ping");
            srv.send(&Message::new("OK").arg_str("ping")).await.unwrap();
        });

        let status = channel
            .translate(&Message::new("ECHO").arg_str("ping"))
            .await
            .unwrap();
        assert!(status.is_ok());
        assert_eq!(status.message, "ping");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn split_halves_share_cipher_state_with_whole() {
        let key: Vec<u8> = (100u8..120).collect();
        let (client, server) = pair().await;
        let mut channel = FrameChannel::new(client);
        channel.install_key(&key).unwrap();

        let key_srv = key.clone();
        let peer = tokio::spawn(async move {
            let mut srv = FrameChannel::new(server);
            srv.install_key(&key_srv).unwrap();
            let n = srv.recv_int(Width::B8, true).await.unwrap();
            let body = srv.recv_exact(n as usize).await.unwrap();
            assert_eq!(body, b"chunk-one");
            srv.send_int(crate::protocol::sentinel::FINISH, Width::B8, true)
                .await
                .unwrap();
        });

        {
            let (mut rd, mut wr) = channel.split();
            wr.send_chunk(b"chunk-one").await.unwrap();
            let code = rd.recv_int(Width::B8, true).await.unwrap();
            assert_eq!(code, crate::protocol::sentinel::FINISH);
        }
        peer.await.unwrap();
    }
}
