//! Error types for authority operations.
//!
//! The library surfaces a typed error taxonomy instead of stringly-typed
//! failures: callers can match on the outcome of a generate or revoke
//! without parsing messages. Backend and PKI faults keep their causes
//! attached as sources.

use thiserror::Error;

use crate::api::Certificate;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the authority API and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// No configuration has been stored in the backend.
    #[error("configuration is not available, has it been set?")]
    ConfigMissing,

    /// The stored or provided configuration document failed to decode.
    #[error("invalid configuration: {0}")]
    MalformedConfig(String),

    /// The requested certificate has no material in the backend.
    #[error("certificate {0} does not exist")]
    CertNotFound(String),

    /// A generate was issued for a name that already has material. The
    /// existing view is carried so callers still receive the original
    /// certificate, key and (empty) token.
    #[error("certificate {name} already exists")]
    CertAlreadyExists {
        name: String,
        existing: Box<Certificate>,
    },

    /// The caller-supplied name collides with a command or resource
    /// keyword.
    #[error("{0} is a restricted name")]
    RestrictedName(String),

    /// A certificate name canonicalized to the empty string.
    #[error("certificate name cannot be empty")]
    InvalidName,

    /// The signing parent could not be loaded.
    #[error("parent certificate {0} cannot be loaded")]
    ParentUnavailable(String),

    /// A revocation was attempted but the signing certificate cannot
    /// produce its private key.
    #[error("cannot load private key for {0}")]
    OwnerKeyMissing(String),

    /// Storage fault: I/O, permissions, or secret-store transport.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Cryptographic fault: key generation, DER codec, or signing.
    #[error(transparent)]
    Pki(#[from] PkiError),
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Error {
        Error::Pki(PkiError::OpenSsl(e))
    }
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Error {
        Error::Pki(PkiError::CrlBuild(e))
    }
}

/// Faults raised by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("secret store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend is not connected")]
    NotConnected,

    #[error("no value stored at {0}")]
    Missing(String),

    #[error("unexpected response from secret store: {0}")]
    Protocol(String),

    #[error("stored material is malformed: {0}")]
    Codec(#[from] openssl::error::ErrorStack),

    #[error("stored serial counter is malformed: {0}")]
    Serial(String),
}

/// Faults raised while building or signing certificates and CRLs.
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("openssl error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("crl build error: {0}")]
    CrlBuild(#[from] rcgen::Error),

    #[error("malformed crl: {0}")]
    CrlDecode(String),
}
