//! Error categories shared across the protocol engine, matching the five
//! buckets of the error handling design: protocol, auth, persistence,
//! transport, and invariant violations.

use std::fmt;

#[derive(Debug)]
pub enum ProtocolError {
    UnknownFrame(u8),
    Malformed(&'static str),
    Unauthenticated,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownFrame(id) => write!(f, "unknown frame identifier {}", id),
            ProtocolError::Malformed(why) => write!(f, "malformed frame: {}", why),
            ProtocolError::Unauthenticated => write!(f, "frame requires an authenticated connection"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    NoDevice,
    VersionMismatch,
    UnknownActor,
    Account,
    AlreadyConnected,
    Maintenance,
    Generic,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AuthError::NoDevice => "no matching device",
            AuthError::VersionMismatch => "protocol version mismatch",
            AuthError::UnknownActor => "unknown actor type",
            AuthError::Account => "unknown or invalid account",
            AuthError::AlreadyConnected => "device already has a connected platform",
            AuthError::Maintenance => "server in maintenance mode",
            AuthError::Generic => "authentication failed",
        };
        write!(f, "{}", text)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug)]
pub enum PersistenceError {
    NotFound,
    Backend(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::NotFound => write!(f, "no matching row"),
            PersistenceError::Backend(msg) => write!(f, "persistence backend error: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<PersistenceError> for AuthError {
    fn from(_: PersistenceError) -> Self {
        AuthError::Generic
    }
}

#[derive(Debug)]
pub enum TransportError {
    SendFailed,
    StreamOpenFailed,
    ConnectionClosed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::SendFailed => write!(f, "send failed"),
            TransportError::StreamOpenFailed => write!(f, "could not open stream"),
            TransportError::ConnectionClosed => write!(f, "connection already closed"),
        }
    }
}

impl std::error::Error for TransportError {}
