//! Remote secret-store backend.
//!
//! Material lives in a flat key/value namespace under `secret/authority`:
//!
//! ```text
//! secret/authority/cert/<name>   PEM certificate
//! secret/authority/key/<name>    PEM private key
//! secret/authority/crl/<owner>   PEM revocation list
//! secret/authority/config        TOML text
//! secret/authority/serial        decimal counter
//! ```
//!
//! Every value is a map with a single `value` field holding the raw
//! string. Reads and writes go over the store's HTTP API with the
//! caller's token; certificate consumers get their own read-only token
//! minted against a per-certificate policy. Root revocation lists
//! written by older deployments live at `secret/authority/crl` and are
//! consulted on read when the per-owner entry is absent.

use std::time::Duration;

use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::X509;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use super::Backend;
use crate::cert::CA_NAME;
use crate::error::BackendError;

const MOUNT: &str = "secret/authority";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Backend speaking to a remote secret store.
pub struct VaultBackend {
    server: String,
    token: String,
    client: Option<Client>,
}

impl VaultBackend {
    pub fn new(server: impl Into<String>, token: impl Into<String>) -> VaultBackend {
        VaultBackend {
            server: server.into(),
            token: token.into(),
            client: None,
        }
    }

    fn client(&self) -> Result<&Client, BackendError> {
        self.client.as_ref().ok_or(BackendError::NotConnected)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.server.trim_end_matches('/'), path)
    }

    /// Read the `value` field stored at `path`, `None` when absent.
    fn read_value(&self, path: &str) -> Result<Option<String>, BackendError> {
        let response = self.client()?.get(self.url(path)).send()?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: serde_json::Value = response.json()?;
                match body.pointer("/data/value").and_then(|v| v.as_str()) {
                    Some(value) => Ok(Some(value.to_string())),
                    None => Err(BackendError::Protocol(format!(
                        "no value field at {path}"
                    ))),
                }
            }
            status => Err(BackendError::Protocol(format!(
                "read of {path} failed with status {status}"
            ))),
        }
    }

    fn write_value(&self, path: &str, value: &str) -> Result<(), BackendError> {
        let response = self
            .client()?
            .post(self.url(path))
            .json(&json!({ "value": value }))
            .send()?;
        if !response.status().is_success() {
            return Err(BackendError::Protocol(format!(
                "write of {path} failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn require_value(&self, path: &str) -> Result<String, BackendError> {
        self.read_value(path)?
            .ok_or_else(|| BackendError::Missing(path.to_string()))
    }
}

/// The read capabilities granted to a certificate's consumer token.
fn policy_rules(name: &str) -> String {
    format!(
        r#"path "{MOUNT}/cert" {{
  policy = "read"
}}
path "{MOUNT}/config" {{
  policy = "read"
}}
path "{MOUNT}/crl" {{
  policy = "read"
}}
path "{MOUNT}/crl/*" {{
  policy = "read"
}}
path "{MOUNT}/key/{name}" {{
  policy = "read"
}}
"#
    )
}

fn wrap_crl(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("X509 CRL", der.to_vec()))
}

fn unwrap_crl(text: &str) -> Result<Vec<u8>, BackendError> {
    let block = pem::parse(text)
        .map_err(|e| BackendError::Protocol(format!("stored crl is not pem: {e}")))?;
    Ok(block.contents().to_vec())
}

impl Backend for VaultBackend {
    fn connect(&mut self) -> Result<(), BackendError> {
        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(&self.token)
            .map_err(|_| BackendError::Protocol("token contains invalid characters".into()))?;
        headers.insert("X-Vault-Token", token);

        // the store commonly fronts itself with a self-signed certificate
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()?;

        self.client = Some(client);
        debug!(server = %self.server, "secret store backend connected");
        Ok(())
    }

    fn check_certificate_exists(&self, name: &str) -> bool {
        matches!(self.read_value(&format!("{MOUNT}/cert/{name}")), Ok(Some(_)))
    }

    fn check_private_key_exists(&self, name: &str) -> bool {
        matches!(self.read_value(&format!("{MOUNT}/key/{name}")), Ok(Some(_)))
    }

    fn create_token_for_certificate(&self, name: &str) -> Result<String, BackendError> {
        let policy = format!("authority_{name}");
        let response = self
            .client()?
            .put(self.url(&format!("sys/policies/acl/{policy}")))
            .json(&json!({ "policy": policy_rules(name) }))
            .send()?;
        if !response.status().is_success() {
            return Err(BackendError::Protocol(format!(
                "policy install failed with status {}",
                response.status()
            )));
        }

        let response = self
            .client()?
            .post(self.url("auth/token/create"))
            .json(&json!({
                "no_parent": true,
                "policies": [policy],
                "display_name": format!("authority: ro token for {name}"),
            }))
            .send()?;
        if !response.status().is_success() {
            return Err(BackendError::Protocol(format!(
                "token create failed with status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response.json()?;
        body.pointer("/auth/client_token")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Protocol("token create returned no token".into()))
    }

    fn get_config(&self) -> Result<Option<String>, BackendError> {
        self.read_value(&format!("{MOUNT}/config"))
    }

    fn get_certificate(&self, name: &str) -> Result<X509, BackendError> {
        let pem = self.require_value(&format!("{MOUNT}/cert/{name}"))?;
        Ok(X509::from_pem(pem.as_bytes())?)
    }

    fn get_private_key(&self, name: &str) -> Result<PKey<Private>, BackendError> {
        let pem = self.require_value(&format!("{MOUNT}/key/{name}"))?;
        let rsa = Rsa::private_key_from_pem(pem.as_bytes())?;
        Ok(PKey::from_rsa(rsa)?)
    }

    fn get_crl_raw(&self, owner: &str) -> Result<Vec<u8>, BackendError> {
        if let Some(text) = self.read_value(&format!("{MOUNT}/crl/{owner}"))? {
            return unwrap_crl(&text);
        }
        if owner == CA_NAME {
            // pre-per-owner deployments stored the root list unscoped
            if let Some(text) = self.read_value(&format!("{MOUNT}/crl"))? {
                return unwrap_crl(&text);
            }
        }
        Ok(Vec::new())
    }

    fn next_serial_number(&self) -> Result<u64, BackendError> {
        // read-increment-write; the store offers no CAS on this API
        let path = format!("{MOUNT}/serial");
        let current: u64 = match self.read_value(&path)? {
            Some(text) if text.trim().is_empty() => 0,
            Some(text) => text
                .trim()
                .parse()
                .map_err(|_| BackendError::Serial(text.trim().to_string()))?,
            None => 0,
        };
        let next = current + 1;
        self.write_value(&path, &next.to_string())?;
        Ok(next)
    }

    fn put_config(&self, config: &str) -> Result<(), BackendError> {
        self.write_value(&format!("{MOUNT}/config"), config)
    }

    fn put_certificate(&self, name: &str, cert: &X509) -> Result<(), BackendError> {
        let pem = String::from_utf8(cert.to_pem()?)
            .map_err(|_| BackendError::Protocol("certificate pem is not utf-8".into()))?;
        self.write_value(&format!("{MOUNT}/cert/{name}"), &pem)
    }

    fn put_private_key(&self, name: &str, key: &PKey<Private>) -> Result<(), BackendError> {
        let pem = String::from_utf8(key.rsa()?.private_key_to_pem()?)
            .map_err(|_| BackendError::Protocol("key pem is not utf-8".into()))?;
        self.write_value(&format!("{MOUNT}/key/{name}"), &pem)
    }

    fn put_crl(&self, owner: &str, crl: &[u8]) -> Result<(), BackendError> {
        self.write_value(&format!("{MOUNT}/crl/{owner}"), &wrap_crl(crl))
    }
}
