//! Async client for the TF Protocol, a banking-grade file transfer protocol
//! spoken over TCP with a session-keyed stream cipher.
//!
//! The crate is layered bottom-up:
//!
//! - [`codec`] encodes protocol values (fixed-width big-endian integers,
//!   text, raw bytes) and [`message`] assembles framed requests.
//! - [`cipher`] is the per-direction stateful XOR stream cipher installed
//!   after the key exchange.
//! - [`channel`] frames and encrypts messages over one TCP socket;
//!   [`status`] parses server replies.
//! - [`client`] owns the connection lifecycle (resolve, connect, three-step
//!   handshake) and the small command surface; [`transfer`] streams uploads
//!   and downloads on top of it; [`keepalive`] monitors liveness.
//!
//! ```no_run
//! use tfproto::client::{Client, ClientConfig};
//!
//! # async fn run(config: ClientConfig) -> tfproto::error::Result<()> {
//! let mut client = Client::connect(config).await?;
//! let status = client.echo("hello").await?;
//! assert_eq!(status.message, "hello");
//! client.end().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod cipher;
pub mod client;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod keepalive;
pub mod message;
pub mod protocol;
pub mod status;
pub mod transfer;

pub use client::{Client, ClientConfig};
pub use error::{ProtoError, Result};
pub use status::{Status, StatusKind};
pub use transfer::{TransferAction, TransferEvent, TransferState};
