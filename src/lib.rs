//! An embeddable TFTP server (RFC 1350) with option negotiation
//! (RFC 2347) supporting the `blksize`, `tsize` and `timeout` options
//! (RFC 2348/2349) and the netascii transfer mode.
//!
//! One tokio task per transfer, each on its own ephemeral UDP socket;
//! the well-known port only ever carries requests. Embedders plug in
//! storage by implementing [`Handler`], or serve a directory with
//! [`FsHandler`].

pub mod error;
pub mod netascii;
pub mod protocol;
pub mod server;
pub mod session;
pub mod target;

pub use error::SessionError;
pub use protocol::{ErrorCode, Mode, Packet, ParseError};
pub use server::{Server, ServerConfig};
pub use session::{ReadSession, Request, WriteSession};
pub use target::{FileReader, FsHandler, Handler, ReadTarget};
