//! Certificate configuration document.
//!
//! The authority stores one TOML document in its backend under a single
//! `[defaults]` table. The ten recognized keys feed subject assembly and
//! validity windows during issuance; everything else in the document is
//! ignored on decode. Item access is gated by a fixed key whitelist so
//! callers cannot smuggle arbitrary keys into the stored document.

use openssl::hash::MessageDigest;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Validity window applied when `cert_expiry` / `crl_days` are unset.
pub const DEFAULT_VALIDITY_DAYS: u32 = 3650;

/// The keys recognized in the `[defaults]` table, in canonical order.
pub const CONFIG_KEYS: [&str; 10] = [
    "root_domain",
    "email",
    "org",
    "org_unit",
    "city",
    "region",
    "country",
    "crl_days",
    "digest",
    "cert_expiry",
];

/// x509 certificate configuration, decoded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
}

/// The `[defaults]` table. All fields are stored as strings, matching the
/// stored document; numeric fields are parsed on use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub root_domain: String,
    pub email: String,
    pub org: String,
    pub org_unit: String,
    pub city: String,
    pub region: String,
    pub country: String,
    pub crl_days: String,
    pub digest: String,
    pub cert_expiry: String,
}

impl Config {
    /// Decode a TOML document. Unknown keys are ignored, not rejected.
    pub fn parse(text: &str) -> Result<Config> {
        toml::from_str(text).map_err(|e| Error::MalformedConfig(e.to_string()))
    }

    /// Re-emit the canonical TOML document under the `[defaults]` header.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::MalformedConfig(e.to_string()))
    }

    /// True if `key` is one of the ten recognized configuration keys.
    pub fn key_is_valid(key: &str) -> bool {
        CONFIG_KEYS.contains(&key)
    }

    /// Set a whitelisted item. Unknown keys are a no-op and return false.
    pub fn set_item(&mut self, key: &str, value: &str) -> bool {
        let d = &mut self.defaults;
        let slot = match key {
            "root_domain" => &mut d.root_domain,
            "email" => &mut d.email,
            "org" => &mut d.org,
            "org_unit" => &mut d.org_unit,
            "city" => &mut d.city,
            "region" => &mut d.region,
            "country" => &mut d.country,
            "crl_days" => &mut d.crl_days,
            "digest" => &mut d.digest,
            "cert_expiry" => &mut d.cert_expiry,
            _ => return false,
        };
        *slot = value.to_string();
        true
    }

    /// Read a whitelisted item. Unknown or unset keys read as "".
    pub fn get_item(&self, key: &str) -> String {
        let d = &self.defaults;
        match key {
            "root_domain" => d.root_domain.clone(),
            "email" => d.email.clone(),
            "org" => d.org.clone(),
            "org_unit" => d.org_unit.clone(),
            "city" => d.city.clone(),
            "region" => d.region.clone(),
            "country" => d.country.clone(),
            "crl_days" => d.crl_days.clone(),
            "digest" => d.digest.clone(),
            "cert_expiry" => d.cert_expiry.clone(),
            _ => String::new(),
        }
    }

    /// Certificate validity in days; `cert_expiry` when it parses,
    /// ten years otherwise.
    pub fn cert_expiry_days(&self) -> u32 {
        self.defaults
            .cert_expiry
            .parse()
            .unwrap_or(DEFAULT_VALIDITY_DAYS)
    }

    /// CRL validity in days; `crl_days` when it parses, ten years
    /// otherwise.
    pub fn crl_days(&self) -> u32 {
        self.defaults
            .crl_days
            .parse()
            .unwrap_or(DEFAULT_VALIDITY_DAYS)
    }

    /// Signature digest; the `digest` field when it names a supported
    /// algorithm, SHA-256 otherwise.
    pub fn message_digest(&self) -> MessageDigest {
        match self.defaults.digest.as_str() {
            "sha1" => MessageDigest::sha1(),
            "sha384" => MessageDigest::sha384(),
            "sha512" => MessageDigest::sha512(),
            _ => MessageDigest::sha256(),
        }
    }
}
