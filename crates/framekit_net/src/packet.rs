//! Packets exchanged between a service and its transport.

use std::any::Any;

use framekit_core::Poolable;
use serde::de::DeserializeOwned;

use crate::codec::{self, CodecError};

/// Transport session identifier.
pub type SessionId = i32;

/// Packet opcode; selects the handler in the dispatch pipeline.
pub type Opcode = i32;

/// Header fields carried next to the opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    pub status: i32,
    pub ext1: i64,
    pub ext2: i64,
    pub ext3: i64,
}

impl PacketMeta {
    #[must_use]
    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_ext(mut self, ext1: i64, ext2: i64, ext3: i64) -> Self {
        self.ext1 = ext1;
        self.ext2 = ext2;
        self.ext3 = ext3;
        self
    }
}

/// A unit of traffic: header fields, raw payload, and an optional decoded
/// value attached by the pipeline.
#[derive(Default)]
pub struct Packet {
    pub session_id: SessionId,
    pub opcode: Opcode,
    pub status: i32,
    pub ext1: i64,
    pub ext2: i64,
    pub ext3: i64,
    pub payload: Vec<u8>,
    decoded: Option<Box<dyn Any + Send>>,
}

impl Packet {
    #[must_use]
    pub fn new(session_id: SessionId, opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            session_id,
            opcode,
            payload,
            ..Self::default()
        }
    }

    /// Returns the header fields other than session and opcode.
    #[must_use]
    pub fn meta(&self) -> PacketMeta {
        PacketMeta {
            status: self.status,
            ext1: self.ext1,
            ext2: self.ext2,
            ext3: self.ext3,
        }
    }

    pub fn set_meta(&mut self, meta: PacketMeta) {
        self.status = meta.status;
        self.ext1 = meta.ext1;
        self.ext2 = meta.ext2;
        self.ext3 = meta.ext3;
    }

    /// Returns the value the pipeline decoded from the payload, if it is a `T`.
    #[must_use]
    pub fn decoded<T: Any>(&self) -> Option<&T> {
        self.decoded.as_ref()?.downcast_ref::<T>()
    }

    /// Returns `true` if a decoded value is attached.
    #[must_use]
    pub fn has_decoded(&self) -> bool {
        self.decoded.is_some()
    }

    /// Detach the decoded value if it is a `T`.
    pub fn take_decoded<T: Any>(&mut self) -> Option<Box<T>> {
        match self.decoded.take()?.downcast::<T>() {
            Ok(value) => Some(value),
            Err(other) => {
                self.decoded = Some(other);
                None
            }
        }
    }

    pub fn set_decoded(&mut self, value: Box<dyn Any + Send>) {
        self.decoded = Some(value);
    }

    /// Decode the payload as MessagePack.
    pub fn decode_msgpack<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        codec::decode(&self.payload)
    }

    /// Decode the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_slice(&self.payload).map_err(CodecError::Json)
    }
}

impl Poolable for Packet {
    fn reset(&mut self) {
        self.session_id = 0;
        self.opcode = 0;
        self.set_meta(PacketMeta::default());
        self.payload.clear();
        self.decoded = None;
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("session_id", &self.session_id)
            .field("opcode", &self.opcode)
            .field("status", &self.status)
            .field("ext", &(self.ext1, self.ext2, self.ext3))
            .field("payload_len", &self.payload.len())
            .field("decoded", &self.decoded.is_some())
            .finish()
    }
}
