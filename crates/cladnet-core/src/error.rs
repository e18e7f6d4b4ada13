//! Core errors

use thiserror::Error;

use crate::address_space::AddressSpaceError;
use crate::policy::PolicyError;

/// Core errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Destination selection failed
    #[error("Destination selection failed: {0}")]
    Policy(#[from] PolicyError),

    /// Address space recommendation failed
    #[error("Address space recommendation failed: {0}")]
    AddressSpace(#[from] AddressSpaceError),

    /// This host has no usable row in the networking rule
    #[error("Host {0} has no CLADNet address in the networking rule")]
    HostNotInRule(String),

    /// Invalid state transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted state could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Crypto error
    #[error("Crypto error: {0}")]
    CryptoError(#[from] cladnet_crypto::CryptoError),

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(#[from] cladnet_network::NetworkError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
