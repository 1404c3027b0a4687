//! Payload codecs.
//!
//! A service picks one [`CodecStrategy`] before it starts:
//!
//! - `Binary`: per-opcode [`PacketCoder`]s; MessagePack via `rmp-serde` is
//!   both the default coder and the fallback when an opcode has none.
//! - `Json`: the whole payload is a `serde_json` document.
//! - `Raw`: payload bytes pass through untouched and the opcode must be 0.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::marker::PhantomData;

use framekit_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::packet::{Opcode, Packet};

/// Errors produced while encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a message to MessagePack.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a message from MessagePack.
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding failed.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The value handed to a coder is not the type it was registered for.
    #[error("coder expects {expected}")]
    TypeMismatch { expected: &'static str },
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Error::Codec(err.to_string())
    }
}

/// Encode a value to MessagePack bytes.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialisation fails.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec(value).map_err(CodecError::Encode)
}

/// Decode a value from MessagePack bytes.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if deserialisation fails.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(CodecError::Decode)
}

/// Payload encoding used by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CodecStrategy {
    #[default]
    Binary,
    Json,
    Raw,
}

/// Whether a service carries framed packets or raw byte streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    Normal,
    /// Byte-stream service: every packet uses opcode 0 and the Raw codec.
    Raw,
}

/// Converts between one opcode's payload bytes and a typed value.
pub trait PacketCoder: Send + Sync {
    /// Name of the value type, for diagnostics.
    fn type_name(&self) -> &'static str;

    fn encode(&self, value: &dyn Any) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>, CodecError>;
}

/// MessagePack coder for a serde type.
pub struct MsgPackCoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> MsgPackCoder<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for MsgPackCoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PacketCoder for MsgPackCoder<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn encode(&self, value: &dyn Any) -> Result<Vec<u8>, CodecError> {
        let value = value
            .downcast_ref::<T>()
            .ok_or(CodecError::TypeMismatch {
                expected: type_name::<T>(),
            })?;
        encode(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>, CodecError> {
        let value: T = decode(bytes)?;
        Ok(Box::new(value))
    }
}

/// The codec configuration of one service.
pub struct Codec {
    service_type: ServiceType,
    strategy: CodecStrategy,
    coders: HashMap<Opcode, Box<dyn PacketCoder>>,
    suppress_not_found_warning: bool,
    frozen: bool,
}

impl Codec {
    /// Create a codec for `service_type`. Raw services always use the Raw
    /// strategy; other services default to Binary.
    #[must_use]
    pub fn new(service_type: ServiceType) -> Self {
        let strategy = match service_type {
            ServiceType::Raw => CodecStrategy::Raw,
            ServiceType::Normal => CodecStrategy::Binary,
        };
        Self {
            service_type,
            strategy,
            coders: HashMap::new(),
            suppress_not_found_warning: false,
            frozen: false,
        }
    }

    #[must_use]
    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    #[must_use]
    pub fn strategy(&self) -> CodecStrategy {
        self.strategy
    }

    /// Change the codec strategy.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyInitialized`] once the service has started.
    /// - [`Error::InvalidArgument`] when the strategy does not match the
    ///   service type.
    pub fn set_strategy(&mut self, strategy: CodecStrategy) -> Result<()> {
        if self.frozen {
            return Err(Error::AlreadyInitialized(
                "codec strategy cannot change after start".into(),
            ));
        }
        match (self.service_type, strategy) {
            (ServiceType::Raw, CodecStrategy::Raw) | (ServiceType::Normal, CodecStrategy::Binary | CodecStrategy::Json) => {
                self.strategy = strategy;
                Ok(())
            }
            (ServiceType::Raw, _) => Err(Error::InvalidArgument(
                "raw services only support the raw codec".into(),
            )),
            (ServiceType::Normal, CodecStrategy::Raw) => Err(Error::InvalidArgument(
                "the raw codec requires a raw service".into(),
            )),
        }
    }

    /// Register the coder for `opcode`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] unless the strategy is Binary on a normal
    ///   service.
    /// - [`Error::DuplicateRegistration`] if `opcode` already has a coder.
    /// - [`Error::AlreadyInitialized`] once the service has started.
    pub fn register_coder(&mut self, opcode: Opcode, coder: Box<dyn PacketCoder>) -> Result<()> {
        if self.service_type == ServiceType::Raw {
            return Err(Error::InvalidArgument(
                "raw services do not use coders".into(),
            ));
        }
        if self.strategy != CodecStrategy::Binary {
            return Err(Error::InvalidArgument(format!(
                "coders require the binary codec, current codec is {:?}",
                self.strategy
            )));
        }
        if self.frozen {
            return Err(Error::AlreadyInitialized(format!(
                "cannot register coder for opcode {opcode} after start"
            )));
        }
        if self.coders.contains_key(&opcode) {
            return Err(Error::DuplicateRegistration(format!(
                "coder for opcode {opcode}"
            )));
        }
        debug!(opcode, coder = coder.type_name(), "coder registered");
        self.coders.insert(opcode, coder);
        Ok(())
    }

    /// Register a [`MsgPackCoder`] for `T` under `opcode`.
    pub fn register<T>(&mut self, opcode: Opcode) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.register_coder(opcode, Box::new(MsgPackCoder::<T>::new()))
    }

    #[must_use]
    pub fn has_coder(&self, opcode: Opcode) -> bool {
        self.coders.contains_key(&opcode)
    }

    /// Stop warning when a Binary payload has no registered coder.
    pub fn suppress_coder_not_found_warning(&mut self) {
        self.suppress_not_found_warning = true;
    }

    #[must_use]
    pub fn is_coder_not_found_warning_suppressed(&self) -> bool {
        self.suppress_not_found_warning
    }

    /// Serialize `value` as the payload of an `opcode` packet.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] on a Raw codec when `opcode` is not 0 or
    ///   `value` is not a `Vec<u8>`.
    /// - [`Error::Codec`] if serialisation fails.
    pub fn encode<T: Serialize + Any>(&self, opcode: Opcode, value: &T) -> Result<Vec<u8>> {
        match self.strategy {
            CodecStrategy::Raw => {
                if opcode != 0 {
                    return Err(Error::InvalidArgument(format!(
                        "raw services only send opcode 0, got {opcode}"
                    )));
                }
                let bytes = (value as &dyn Any).downcast_ref::<Vec<u8>>().ok_or_else(|| {
                    Error::InvalidArgument("raw services only send byte payloads".into())
                })?;
                Ok(bytes.clone())
            }
            CodecStrategy::Json => Ok(serde_json::to_vec(value)?),
            CodecStrategy::Binary => match self.coders.get(&opcode) {
                Some(coder) => Ok(coder.encode(value)?),
                None => {
                    if !self.suppress_not_found_warning {
                        warn!(opcode, "no coder registered, encoding as MessagePack");
                    }
                    Ok(encode(value)?)
                }
            },
        }
    }

    /// Attach the decoded payload to `packet` where the strategy allows it.
    ///
    /// Binary packets are decoded only when their opcode has a coder; Json
    /// packets decode to a [`serde_json::Value`]; Raw packets are untouched.
    pub fn decode_into(&self, packet: &mut Packet) -> Result<()> {
        match self.strategy {
            CodecStrategy::Raw => Ok(()),
            CodecStrategy::Json => {
                if !packet.payload.is_empty() {
                    let value: serde_json::Value = serde_json::from_slice(&packet.payload)?;
                    packet.set_decoded(Box::new(value));
                }
                Ok(())
            }
            CodecStrategy::Binary => {
                match self.coders.get(&packet.opcode) {
                    Some(coder) => {
                        let value = coder.decode(&packet.payload)?;
                        packet.set_decoded(value);
                    }
                    None if !self.suppress_not_found_warning => {
                        debug!(opcode = packet.opcode, "no coder registered, payload left encoded");
                    }
                    None => {}
                }
                Ok(())
            }
        }
    }

    /// Drop every registered coder. The strategy is kept.
    pub fn clear_coders(&mut self) {
        self.coders.clear();
    }

    /// Lock the strategy and coder table.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(ServiceType::Normal)
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<_> = self.coders.keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("Codec")
            .field("service_type", &self.service_type)
            .field("strategy", &self.strategy)
            .field("coders", &opcodes)
            .field("frozen", &self.frozen)
            .finish()
    }
}
