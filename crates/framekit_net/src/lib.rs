//! # framekit_net
//!
//! Packet handling for frame-driven services.
//!
//! This crate provides:
//!
//! - [`packet`] — the packet record moved through the pipeline.
//! - [`session`] — per-connection bookkeeping.
//! - [`codec`] — Binary (MessagePack), Json and Raw payload codecs.
//! - [`pipeline`] — opcode-indexed dispatch with pre-subscriber filters.
//! - [`transport`] — the transport contract and an inert implementation.
//! - [`loopback`] — in-memory transport for tests and demos.

pub mod codec;
pub mod loopback;
pub mod packet;
pub mod pipeline;
pub mod session;
pub mod transport;

pub use codec::{Codec, CodecError, CodecStrategy, MsgPackCoder, PacketCoder, ServiceType, decode, encode};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use packet::{Opcode, Packet, PacketMeta, SessionId};
pub use pipeline::{DispatchCommand, DispatchContext, DispatchQueue, PacketHandler, PacketPipeline, PreHandler};
pub use session::{Session, SessionState};
pub use transport::{NullTransport, SendError, Transport, TransportEvent, TransportFactory};
