//! Authority - Private Certificate Authority Library
//!
//! A small certificate authority that issues, stores, revokes and
//! retrieves x509 certificates keyed by a human-readable common name.
//! Certificates form a hierarchy: a self-signed root, and signed
//! children which may themselves sign further descendants.
//!
//! ```text
//! ca (self-signed root)
//!   └── svc (signed by ca, CA-capable)
//!       └── leaf (signed by svc, CA-capable)
//! ```
//!
//! # Storage
//!
//! All artifacts live in a pluggable backend behind the [`Backend`]
//! trait:
//!
//! - certificates and private keys, keyed by canonical name
//! - the configuration document (TOML)
//! - a monotonic serial counter shared by every issuance
//! - per-owner certificate revocation lists
//!
//! Two backends are provided: a local filesystem tree
//! ([`FileBackend`]) and a remote secret store ([`VaultBackend`]).
//! The secret-store backend can also mint capability tokens whose
//! bearers may read exactly one certificate's material.
//!
//! # Quick start
//!
//! ```no_run
//! use authority::{Authority, Config};
//!
//! fn main() -> authority::Result<()> {
//!     let mut authority = Authority::new_local("/var/lib/authority")?;
//!
//!     let mut config = Config::default();
//!     config.set_item("org", "Example Corp");
//!     config.set_item("country", "us");
//!     authority.set_config(&config)?;
//!
//!     // the root is created implicitly on first use
//!     let (cert, token) = authority.generate("web-server")?;
//!     println!("issued {} (token: {})", cert.common_name, token);
//!
//!     authority.revoke("web-server")?;
//!     Ok(())
//! }
//! ```
//!
//! # Names
//!
//! Names are canonicalized to lowercase with spaces replaced by
//! hyphens; `"Foo Bar"` and `"foo-bar"` are the same record. A few
//! names (`ca`, `cert`, `config`, `crl`, `generate`, `get`, `key`,
//! `revoke`) are reserved.

pub mod api;
pub mod backend;
pub mod cert;
pub mod config;
pub mod error;
pub mod pki;

pub use api::{name_is_valid, Authority, CaCertificate, Certificate, RESTRICTED_NAMES};
pub use backend::{Backend, FileBackend, VaultBackend};
pub use cert::{canonicalize, certificate_pem, crl_pem, private_key_pem, Cert, CA_NAME};
pub use config::Config;
pub use error::{BackendError, Error, PkiError, Result};
pub use pki::revoked_serials;
