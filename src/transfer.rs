//! Streamed uploads and downloads.
//!
//! Two command families share one shape: negotiate a chunk size through the
//! initial status reply, stream 8-byte-headed chunks, then exchange terminal
//! sentinels. `put`/`get` run as two cooperating tasks over a split channel;
//! `put_with_checkpoints`/`get_with_checkpoints` are single loops that pause
//! every `canpt` chunks to agree on continue-or-cancel.

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::Client;
use crate::codec::Width;
use crate::error::{ProtoError, Result};
use crate::message::Message;
use crate::protocol::sentinel;
use crate::status::Status;

/// Observable snapshot of one transfer, updated each step and returned when
/// the operation ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferState {
    /// Last control code this side sent.
    pub client_command: i64,
    /// Last control code (or chunk header) the server sent.
    pub server_command: i64,
    /// Whether the transfer is currently negotiating a checkpoint.
    pub checkpoint: bool,
    /// Size of the most recently transferred payload chunk.
    pub last_chunk: usize,
}

/// One event per observable transfer step, handed to the caller's observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// Initial status was OK; `buffer_size` is the server-authoritative
    /// chunk size for the rest of the exchange.
    Negotiated { buffer_size: usize },
    /// One payload chunk moved (sent for uploads, received for downloads).
    Chunk(TransferState),
    /// A cancellation point was reached; the returned action decides whether
    /// streaming resumes.
    Checkpoint(TransferState),
    /// The exchange ended normally.
    Finished(TransferState),
    /// The exchange was cancelled by either side.
    Cancelled(TransferState),
}

/// What the observer wants done next. Ignored for terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction {
    Continue,
    /// Stop streaming without discarding what the peer already has.
    Stop,
    /// Abort the transfer at the next possible point.
    Cancel,
}

impl TransferAction {
    fn sentinel(self) -> Option<i64> {
        match self {
            TransferAction::Continue => None,
            TransferAction::Stop => Some(sentinel::STOP),
            TransferAction::Cancel => Some(sentinel::CANCEL),
        }
    }
}

/// Flags serializing the pump task and the control task of a simple
/// transfer. Both tasks share one instance behind a mutex.
#[derive(Debug, Default)]
struct SignalState {
    /// Cleared once a terminal control code has been seen or sent; the pump
    /// winds down instead of touching the socket again.
    streaming: bool,
    /// Set after the terminal FINISH goes out; no control send may follow.
    blocked: bool,
    last_sent: i64,
    last_recv: i64,
}

fn negotiated_buffer_size(status: &Status, max: usize) -> Result<usize> {
    if !status.is_ok() {
        return Err(ProtoError::Server(status.clone()));
    }
    let size: usize = status
        .message
        .trim()
        .parse()
        .map_err(|_| ProtoError::BufferSizeMismatch(status.message.clone()))?;
    if size == 0 || size > max {
        return Err(ProtoError::BufferSizeMismatch(format!(
            "server proposed {size} bytes"
        )));
    }
    Ok(size)
}

fn transfer_request(
    command: &str,
    path: &str,
    offset: u64,
    buffer_size: usize,
    canpt: Option<u32>,
) -> Result<Message> {
    let mut msg = Message::new(command)
        .arg_str(path)
        .arg_int(offset as i64, Width::B8, false)?
        .push_int(buffer_size as i64, Width::B8, false)?
        .header_width(Width::B8);
    if let Some(canpt) = canpt {
        msg = msg.push_int(canpt as i64, Width::B4, false)?;
    }
    Ok(msg)
}

impl Client {
    /// Upload from `source` to the server file at `path`, starting at
    /// `offset`. `buffer_size` is a proposal; the server's reply fixes the
    /// real chunk size. Runs until the source is drained, the observer asks
    /// to stop or cancel, or the server sends a terminal code.
    pub async fn put<S, F>(
        &mut self,
        mut source: S,
        path: &str,
        offset: u64,
        buffer_size: usize,
        mut observer: F,
    ) -> Result<TransferState>
    where
        S: AsyncRead + Unpin,
        F: FnMut(&TransferEvent) -> TransferAction,
    {
        let max = self.config.max_buffer_size;
        let request = transfer_request("PUT", path, offset, buffer_size, None)?;
        let status = self.translate(&request).await?;
        let chunk_size = negotiated_buffer_size(&status, max)?;
        observer(&TransferEvent::Negotiated {
            buffer_size: chunk_size,
        });
        debug!(path, offset, chunk_size, "put negotiated");

        let signals = Mutex::new(SignalState {
            streaming: true,
            ..SignalState::default()
        });
        let mut state = TransferState::default();
        let channel = self.channel();
        let (mut rd, mut wr) = channel.split();

        let pump = async {
            let mut buf = vec![0u8; chunk_size];
            loop {
                if !signals.lock().streaming {
                    break;
                }
                let n = source.read(&mut buf).await.map_err(ProtoError::Io)?;
                if n == 0 {
                    wr.send_int(sentinel::END, Width::B8, true).await?;
                    signals.lock().last_sent = sentinel::END;
                    state.client_command = sentinel::END;
                    break;
                }
                wr.send_chunk(&buf[..n]).await?;
                state.last_chunk = n;
                let action = observer(&TransferEvent::Chunk(state));
                if let Some(code) = action.sentinel() {
                    wr.send_int(code, Width::B8, true).await?;
                    let mut s = signals.lock();
                    s.last_sent = code;
                    s.streaming = false;
                    state.client_command = code;
                    break;
                }
            }
            Ok::<(), ProtoError>(())
        };

        // The server only ever speaks control codes during an upload; the
        // first non-positive header ends the control loop.
        let control = async {
            loop {
                let code = rd.recv_int(Width::B8, true).await?;
                let mut s = signals.lock();
                s.last_recv = code;
                if code <= sentinel::END {
                    s.streaming = false;
                    return Ok::<i64, ProtoError>(code);
                }
            }
        };

        let (_, last_recv) = tokio::try_join!(pump, control)?;
        state.server_command = last_recv;

        // Mutual FINISH: both directions must see it before the connection
        // is reusable. The drained trailing code is not a transfer outcome.
        if last_recv != sentinel::FINISH {
            let _ = rd.recv_int(Width::B8, true).await?;
        }
        let send_finish = {
            let mut s = signals.lock();
            let pending = s.last_sent != sentinel::FINISH && !s.blocked;
            s.blocked = true;
            pending
        };
        if send_finish {
            wr.send_int(sentinel::FINISH, Width::B8, true).await?;
            state.client_command = sentinel::FINISH;
        }

        if state.server_command == sentinel::CANCEL {
            observer(&TransferEvent::Cancelled(state));
        } else {
            observer(&TransferEvent::Finished(state));
        }
        Ok(state)
    }

    /// Download the server file at `path` into `sink`, starting at `offset`.
    /// The observer may request stop or cancel after any chunk; the control
    /// code travels to the server through the outbound half while the pump
    /// keeps draining inbound data.
    pub async fn get<S, F>(
        &mut self,
        mut sink: S,
        path: &str,
        offset: u64,
        buffer_size: usize,
        mut observer: F,
    ) -> Result<TransferState>
    where
        S: AsyncWrite + Unpin,
        F: FnMut(&TransferEvent) -> TransferAction,
    {
        let max = self.config.max_buffer_size;
        let request = transfer_request("GET", path, offset, buffer_size, None)?;
        let status = self.translate(&request).await?;
        let chunk_size = negotiated_buffer_size(&status, max)?;
        observer(&TransferEvent::Negotiated {
            buffer_size: chunk_size,
        });
        debug!(path, offset, chunk_size, "get negotiated");

        let signals = Mutex::new(SignalState {
            streaming: true,
            ..SignalState::default()
        });
        let (code_tx, mut code_rx) = mpsc::unbounded_channel::<i64>();
        let mut state = TransferState::default();
        let channel = self.channel();
        let (mut rd, mut wr) = channel.split();

        let pump = async {
            let mut signalled = false;
            loop {
                let header = rd.recv_int(Width::B8, true).await?;
                {
                    let mut s = signals.lock();
                    s.last_recv = header;
                    if header <= sentinel::END {
                        s.streaming = false;
                        state.server_command = header;
                        break;
                    }
                }
                let chunk = rd.recv_exact(header as usize).await?;
                // Once a stop or cancel signal is in flight, in-flight chunks
                // are drained off the socket but no longer reach the sink.
                if signalled {
                    continue;
                }
                sink.write_all(&chunk).await.map_err(ProtoError::Io)?;
                state.last_chunk = chunk.len();
                let action = observer(&TransferEvent::Chunk(state));
                if let Some(code) = action.sentinel() {
                    signalled = true;
                    state.client_command = code;
                    // Routed to the writer task; this task keeps draining
                    // until the server acknowledges with a terminal code.
                    let _ = code_tx.send(code);
                }
            }
            drop(code_tx);
            Ok::<(), ProtoError>(())
        };

        let control = async {
            while let Some(code) = code_rx.recv().await {
                wr.send_int(code, Width::B8, true).await?;
                signals.lock().last_sent = code;
            }
            Ok::<(), ProtoError>(())
        };

        tokio::try_join!(pump, control)?;
        sink.flush().await.map_err(ProtoError::Io)?;

        let (send_finish, last_recv) = {
            let mut s = signals.lock();
            let pending = s.last_sent != sentinel::FINISH && !s.blocked;
            s.blocked = true;
            (pending, s.last_recv)
        };
        if send_finish {
            wr.send_int(sentinel::FINISH, Width::B8, true).await?;
            state.client_command = sentinel::FINISH;
        }
        if last_recv != sentinel::FINISH {
            let _ = rd.recv_int(Width::B8, true).await?;
        }

        if state.server_command == sentinel::CANCEL {
            observer(&TransferEvent::Cancelled(state));
        } else {
            observer(&TransferEvent::Finished(state));
        }
        Ok(state)
    }

    /// Upload with cooperative cancellation points. After every `canpt`
    /// chunks the client reads one control header from the server: `CONT`
    /// resumes streaming, `CANCEL` ends the transfer, anything else is a
    /// protocol violation.
    pub async fn put_with_checkpoints<S, F>(
        &mut self,
        mut source: S,
        path: &str,
        offset: u64,
        buffer_size: usize,
        canpt: u32,
        mut observer: F,
    ) -> Result<TransferState>
    where
        S: AsyncRead + Unpin,
        F: FnMut(&TransferEvent) -> TransferAction,
    {
        let max = self.config.max_buffer_size;
        let request = transfer_request("PUTCAN", path, offset, buffer_size, Some(canpt))?;
        let status = self.translate(&request).await?;
        let chunk_size = negotiated_buffer_size(&status, max)?;
        observer(&TransferEvent::Negotiated {
            buffer_size: chunk_size,
        });
        debug!(path, offset, chunk_size, canpt, "putcan negotiated");

        let mut state = TransferState::default();
        let mut buf = vec![0u8; chunk_size];
        let mut since_checkpoint: u32 = 0;
        loop {
            let n = source.read(&mut buf).await.map_err(ProtoError::Io)?;
            if n == 0 {
                self.channel().send_int(sentinel::END, Width::B8, true).await?;
                state.client_command = sentinel::END;
                observer(&TransferEvent::Finished(state));
                return Ok(state);
            }
            self.channel().send_chunk(&buf[..n]).await?;
            state.last_chunk = n;
            let action = observer(&TransferEvent::Chunk(state));
            if let Some(code) = action.sentinel() {
                self.channel().send_int(code, Width::B8, true).await?;
                state.client_command = code;
                observer(&TransferEvent::Cancelled(state));
                return Ok(state);
            }

            since_checkpoint += 1;
            if canpt > 0 && since_checkpoint == canpt {
                since_checkpoint = 0;
                state.checkpoint = true;
                observer(&TransferEvent::Checkpoint(state));
                let code = self.channel().recv_int(Width::B8, true).await?;
                state.server_command = code;
                state.checkpoint = false;
                match code {
                    sentinel::CONT => {}
                    sentinel::CANCEL => {
                        observer(&TransferEvent::Cancelled(state));
                        return Ok(state);
                    }
                    other => return Err(ProtoError::UnexpectedControl(other)),
                }
            }
        }
    }

    /// Download with cooperative cancellation points. After every `canpt`
    /// chunks the client writes one control header: the observer decides
    /// between `CONT` and `CANCEL` at each checkpoint.
    pub async fn get_with_checkpoints<S, F>(
        &mut self,
        mut sink: S,
        path: &str,
        offset: u64,
        buffer_size: usize,
        canpt: u32,
        mut observer: F,
    ) -> Result<TransferState>
    where
        S: AsyncWrite + Unpin,
        F: FnMut(&TransferEvent) -> TransferAction,
    {
        let max = self.config.max_buffer_size;
        let request = transfer_request("GETCAN", path, offset, buffer_size, Some(canpt))?;
        let status = self.translate(&request).await?;
        let chunk_size = negotiated_buffer_size(&status, max)?;
        observer(&TransferEvent::Negotiated {
            buffer_size: chunk_size,
        });
        debug!(path, offset, chunk_size, canpt, "getcan negotiated");

        let mut state = TransferState::default();
        let mut since_checkpoint: u32 = 0;
        loop {
            let header = self.channel().recv_int(Width::B8, true).await?;
            if header == sentinel::END || header == sentinel::CANCEL {
                state.server_command = header;
                sink.flush().await.map_err(ProtoError::Io)?;
                if header == sentinel::CANCEL {
                    observer(&TransferEvent::Cancelled(state));
                } else {
                    observer(&TransferEvent::Finished(state));
                }
                return Ok(state);
            }
            if header < 0 {
                return Err(ProtoError::UnexpectedControl(header));
            }
            let chunk = self.channel().recv_exact(header as usize).await?;
            sink.write_all(&chunk).await.map_err(ProtoError::Io)?;
            state.last_chunk = chunk.len();
            observer(&TransferEvent::Chunk(state));

            since_checkpoint += 1;
            if canpt > 0 && since_checkpoint == canpt {
                since_checkpoint = 0;
                state.checkpoint = true;
                let action = observer(&TransferEvent::Checkpoint(state));
                let code = action.sentinel().unwrap_or(sentinel::CONT);
                self.channel().send_int(code, Width::B8, true).await?;
                state.client_command = code;
                state.checkpoint = false;
                if code == sentinel::CANCEL {
                    sink.flush().await.map_err(ProtoError::Io)?;
                    observer(&TransferEvent::Cancelled(state));
                    return Ok(state);
                }
            }
        }
    }
}
