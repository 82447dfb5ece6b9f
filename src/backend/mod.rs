//! Storage backends for certificates, keys, configuration and CRLs.
//!
//! A backend is a uniform key/value contract over six kinds of material:
//! the config document, per-name certificates and private keys, the
//! global serial counter, per-owner revocation lists, and per-name
//! capability tokens. Two implementations are provided: a local
//! filesystem tree and a remote secret store reached over HTTP.

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use crate::error::BackendError;

mod file;
mod vault;

pub use file::FileBackend;
pub use vault::VaultBackend;

/// Uniform storage contract for authority material.
///
/// Names handed to a backend are already canonical; backends never
/// canonicalize. Absence is reported as `false` from the existence
/// checks, `Ok(None)` from `get_config`, and an empty vector from
/// `get_crl_raw`; fetching a missing certificate or key is a
/// [`BackendError::Missing`].
pub trait Backend {
    /// Prepare the backend for use (create directories, build the HTTP
    /// client). Must be called before any other operation.
    fn connect(&mut self) -> Result<(), BackendError>;

    fn check_certificate_exists(&self, name: &str) -> bool;

    fn check_private_key_exists(&self, name: &str) -> bool;

    /// Mint a capability token whose bearer may read this certificate's
    /// material plus the shared config and CRL. Backends without a
    /// capability concept return the empty string.
    fn create_token_for_certificate(&self, name: &str) -> Result<String, BackendError>;

    /// The stored configuration document, or `None` if never set.
    fn get_config(&self) -> Result<Option<String>, BackendError>;

    fn get_certificate(&self, name: &str) -> Result<X509, BackendError>;

    fn get_private_key(&self, name: &str) -> Result<PKey<Private>, BackendError>;

    /// DER bytes of the revocation list owned by `owner`; empty if the
    /// owner has never revoked anything.
    fn get_crl_raw(&self, owner: &str) -> Result<Vec<u8>, BackendError>;

    /// Allocate the next serial number. Strictly increasing within this
    /// backend's lifetime; the first allocation returns 1.
    fn next_serial_number(&self) -> Result<u64, BackendError>;

    fn put_config(&self, config: &str) -> Result<(), BackendError>;

    fn put_certificate(&self, name: &str, cert: &X509) -> Result<(), BackendError>;

    fn put_private_key(&self, name: &str, key: &PKey<Private>) -> Result<(), BackendError>;

    fn put_crl(&self, owner: &str, crl: &[u8]) -> Result<(), BackendError>;
}
