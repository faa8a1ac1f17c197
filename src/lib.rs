//! ApeFtp protocol engine
//!
//! Resumable, segmented file transfer over any ordered byte transport. The
//! crate is transport-agnostic: engines emit frames through a send callback
//! and consume raw bytes through [`Sender::input`] / [`Receiver::input`];
//! wiring those to a TCP stream (or anything else ordered and reliable) is
//! the caller's job.

pub mod dispatch;
pub mod framer;
pub mod logger;
pub mod message;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod store;

pub use framer::StreamFramer;
pub use logger::{NoopLogger, TextLogger, TransferLogger};
pub use message::{DemandRequest, Frame, SessionKey, TransferRequest, TransferResponse};
pub use protocol::{FunctionCode, ResultCode};
pub use receiver::{Receiver, ReceiverConfig};
pub use sender::{SendBytes, Sender, SenderConfig, SessionState};
pub use store::{DirectoryStore, TaskState, TransferStore};
