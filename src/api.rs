//! Authority API.
//!
//! [`Authority`] orchestrates the certificate entity, the PKI engine and
//! a storage backend behind one surface: store and retrieve
//! configuration, generate certificates (chained to any CA-capable
//! parent), retrieve them, revoke them, and import externally produced
//! material. The root is created implicitly the first time anything
//! needs it.
//!
//! A handful of names are reserved so certificate records can never
//! collide with command or resource keywords.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::info;

use crate::backend::{Backend, FileBackend, VaultBackend};
use crate::cert::{canonicalize, Cert, CA_NAME};
use crate::config::Config;
use crate::error::{Error, Result};

/// Names that can never be used for certificate records.
pub const RESTRICTED_NAMES: [&str; 8] = [
    "ca", "cert", "config", "crl", "generate", "get", "key", "revoke",
];

/// True if `name` may be used for a new certificate record.
pub fn name_is_valid(name: &str) -> bool {
    !RESTRICTED_NAMES.contains(&canonicalize(name).as_str())
}

/// A retrieved certificate: the record's canonical name plus its x509
/// certificate and RSA private key.
#[derive(Clone)]
pub struct Certificate {
    pub common_name: String,
    pub certificate: X509,
    pub private_key: PKey<Private>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

/// The root view: certificate material plus the root's revocation list
/// (DER, empty when nothing has been revoked).
#[derive(Clone, Debug)]
pub struct CaCertificate {
    pub cert: Certificate,
    pub crl: Vec<u8>,
}

/// Client for creating, storing, retrieving and revoking x509
/// certificates against a pluggable backend.
pub struct Authority {
    backend: Box<dyn Backend>,
    config: Option<Config>,
}

impl Authority {
    /// Connect to the given backend.
    pub fn new(mut backend: Box<dyn Backend>) -> Result<Authority> {
        backend.connect()?;
        Ok(Authority {
            backend,
            config: None,
        })
    }

    /// Connect to a filesystem backend rooted at `path`.
    pub fn new_local(path: impl AsRef<Path>) -> Result<Authority> {
        Self::new(Box::new(FileBackend::new(path.as_ref())))
    }

    /// Connect to a remote secret store.
    pub fn new_remote(server: &str, token: &str) -> Result<Authority> {
        Self::new(Box::new(VaultBackend::new(server, token)))
    }

    /// Connect and store `config` in one step.
    pub fn with_config(backend: Box<dyn Backend>, config: Config) -> Result<Authority> {
        let mut authority = Self::new(backend)?;
        authority.set_config(&config)?;
        Ok(authority)
    }

    /// Serialize and store the configuration document.
    pub fn set_config(&mut self, config: &Config) -> Result<()> {
        let text = config.to_toml()?;
        self.backend.put_config(&text)?;
        self.config = Some(config.clone());
        Ok(())
    }

    /// Load the stored configuration document from the backend.
    pub fn get_config(&mut self) -> Result<Config> {
        let text = self
            .backend
            .get_config()?
            .ok_or(Error::ConfigMissing)?;
        let config = Config::parse(&text)?;
        self.config = Some(config.clone());
        Ok(config)
    }

    /// Generate a certificate signed by the root.
    pub fn generate(&mut self, name: &str) -> Result<(Certificate, String)> {
        self.generate_with_options(name, "", &[], &[])
    }

    /// Generate a certificate signed by `parent`; an empty parent means
    /// the root.
    pub fn generate_with_parent(
        &mut self,
        name: &str,
        parent: &str,
    ) -> Result<(Certificate, String)> {
        self.generate_with_options(name, parent, &[], &[])
    }

    /// Generate a certificate and a backend capability token for it.
    ///
    /// The certificate is signed by `parent` (empty for the root) and
    /// carries the given Subject Alternative Names. If a record with
    /// the same canonical name already exists, the call fails with
    /// [`Error::CertAlreadyExists`] carrying the existing view, and
    /// nothing is written.
    pub fn generate_with_options(
        &mut self,
        name: &str,
        parent: &str,
        dns_names: &[String],
        ip_addresses: &[IpAddr],
    ) -> Result<(Certificate, String)> {
        if !name_is_valid(name) {
            return Err(Error::RestrictedName(name.to_string()));
        }

        let config = self.require_config()?;
        let backend = self.backend.as_ref();

        let mut cert = Cert::new(backend, config.clone(), name)
            .with_parent(parent)
            .with_subject_alt_names(dns_names.to_vec(), ip_addresses.to_vec());

        if cert.exists() {
            let existing = view_of(backend, &config, name)?;
            return Err(Error::CertAlreadyExists {
                name: cert.storage_name(),
                existing: Box::new(existing),
            });
        }

        ensure_root(backend, &config)?;
        cert.create()?;

        let token = backend.create_token_for_certificate(&cert.storage_name())?;
        let view = view_of(backend, &config, name)?;
        Ok((view, token))
    }

    /// Retrieve a previously generated certificate.
    pub fn get(&mut self, name: &str) -> Result<Certificate> {
        let config = self.config_or_default()?;
        view_of(self.backend.as_ref(), &config, name)
    }

    /// Retrieve the root certificate, key and revocation list, creating
    /// the root first if this authority has never issued anything.
    pub fn get_ca(&mut self) -> Result<CaCertificate> {
        let config = self.require_config()?;
        let backend = self.backend.as_ref();

        ensure_root(backend, &config)?;
        let cert = view_of(backend, &config, CA_NAME)?;
        let crl = backend.get_crl_raw(CA_NAME)?;
        Ok(CaCertificate { cert, crl })
    }

    /// Add the named certificate to the root's revocation list.
    pub fn revoke(&mut self, name: &str) -> Result<()> {
        self.revoke_with_parent(name, "")
    }

    /// Add the named certificate to `parent`'s revocation list; an
    /// empty parent means the root.
    pub fn revoke_with_parent(&mut self, name: &str, parent: &str) -> Result<()> {
        let config = self.config_or_default()?;
        let backend = self.backend.as_ref();

        let mut victim = Cert::new(backend, config.clone(), name);
        if !victim.exists() {
            return Err(Error::CertNotFound(victim.storage_name()));
        }
        let victim_cert = victim.certificate()?.clone();

        let owner_name = if parent.is_empty() { CA_NAME } else { parent };
        let mut owner = Cert::new(backend, config, owner_name);
        if !owner.exists() {
            return Err(Error::CertNotFound(owner.storage_name()));
        }
        owner.revoke(&victim_cert)?;

        info!(name = %victim.storage_name(), owner = %owner.storage_name(), "certificate revoked");
        Ok(())
    }

    /// DER bytes of the revocation list owned by `name`; empty when the
    /// owner has never revoked anything.
    pub fn get_crl(&mut self, name: &str) -> Result<Vec<u8>> {
        let config = self.config_or_default()?;
        let cert = Cert::new(self.backend.as_ref(), config, name);
        if !cert.exists() {
            return Err(Error::CertNotFound(cert.storage_name()));
        }
        cert.crl_raw()
    }

    /// Store externally produced material under `name`, bypassing the
    /// PKI engine. Reserved names and existing records are refused.
    pub fn set_certificate(
        &mut self,
        name: &str,
        certificate: &X509,
        private_key: &PKey<Private>,
    ) -> Result<()> {
        if !name_is_valid(name) {
            return Err(Error::RestrictedName(name.to_string()));
        }
        let canonical = canonicalize(name);
        if canonical.is_empty() {
            return Err(Error::InvalidName);
        }

        let config = self.config_or_default()?;
        let backend = self.backend.as_ref();
        if backend.check_certificate_exists(&canonical) {
            let existing = view_of(backend, &config, name)?;
            return Err(Error::CertAlreadyExists {
                name: canonical,
                existing: Box::new(existing),
            });
        }

        backend.put_certificate(&canonical, certificate)?;
        backend.put_private_key(&canonical, private_key)?;
        info!(name = %canonical, "certificate imported");
        Ok(())
    }

    /// Install a previously generated root certificate and key, for
    /// migrating an existing hierarchy into this backend. Refused when
    /// a root already exists.
    pub fn set_ca_certificate(
        &mut self,
        certificate: &X509,
        private_key: &PKey<Private>,
    ) -> Result<()> {
        let config = self.config_or_default()?;
        let backend = self.backend.as_ref();
        if backend.check_certificate_exists(CA_NAME) {
            let existing = view_of(backend, &config, CA_NAME)?;
            return Err(Error::CertAlreadyExists {
                name: CA_NAME.to_string(),
                existing: Box::new(existing),
            });
        }

        backend.put_certificate(CA_NAME, certificate)?;
        backend.put_private_key(CA_NAME, private_key)?;
        info!("root certificate imported");
        Ok(())
    }

    /// Cached config, else the stored document, else `ConfigMissing`.
    fn require_config(&mut self) -> Result<Config> {
        if let Some(config) = &self.config {
            return Ok(config.clone());
        }
        match self.backend.get_config()? {
            Some(text) => {
                let config = Config::parse(&text)?;
                self.config = Some(config.clone());
                Ok(config)
            }
            None => Err(Error::ConfigMissing),
        }
    }

    /// Like [`Self::require_config`], but operations that never issue
    /// certificates tolerate a missing document.
    fn config_or_default(&mut self) -> Result<Config> {
        match self.require_config() {
            Ok(config) => Ok(config),
            Err(Error::ConfigMissing) => Ok(Config::default()),
            Err(e) => Err(e),
        }
    }
}

fn ensure_root(backend: &dyn Backend, config: &Config) -> Result<()> {
    let mut ca = Cert::new(backend, config.clone(), CA_NAME);
    if !ca.exists() {
        ca.create()?;
    }
    Ok(())
}

fn view_of(backend: &dyn Backend, config: &Config, name: &str) -> Result<Certificate> {
    let mut cert = Cert::new(backend, config.clone(), name);
    if !cert.exists() {
        return Err(Error::CertNotFound(cert.storage_name()));
    }
    let certificate = cert.certificate()?.clone();
    let private_key = cert.private_key()?.clone();
    Ok(Certificate {
        common_name: cert.storage_name(),
        certificate,
        private_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::revoked_serials;
    use openssl::nid::Nid;

    fn open_authority(dir: &std::path::Path) -> Authority {
        Authority::new(Box::new(FileBackend::new(dir))).unwrap()
    }

    fn default_config() -> Config {
        let mut cfg = Config::default();
        cfg.set_item("root_domain", "authority.root");
        cfg.set_item("email", "user@example.com");
        cfg.set_item("org", "foo");
        cfg.set_item("org_unit", "bar");
        cfg.set_item("city", "sf");
        cfg.set_item("region", "ca");
        cfg.set_item("country", "us");
        cfg
    }

    fn serial_of(cert: &X509) -> u64 {
        let bn = cert.serial_number().to_bn().unwrap();
        bn.to_dec_str().unwrap().parse().unwrap()
    }

    fn cn_of(name: &openssl::x509::X509NameRef) -> String {
        name.entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string()
    }

    #[test]
    fn root_init_on_empty_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        authority.set_config(&default_config()).unwrap();

        let ca = authority.get_ca().unwrap();
        assert_eq!(ca.cert.common_name, "ca");
        assert_eq!(cn_of(ca.cert.certificate.subject_name()), "ca");
        assert_eq!(cn_of(ca.cert.certificate.issuer_name()), "ca");
        assert_eq!(serial_of(&ca.cert.certificate), 1);
        assert!(ca.crl.is_empty());

        // the root carries the CA basic constraint
        let der = ca.cert.certificate.to_der().unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(&der).unwrap();
        let is_ca = parsed.iter_extensions().any(|ext| {
            matches!(
                ext.parsed_extension(),
                x509_parser::extensions::ParsedExtension::BasicConstraints(bc) if bc.ca
            )
        });
        assert!(is_ca);
    }

    #[test]
    fn generation_requires_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        assert!(matches!(
            authority.generate("svc"),
            Err(Error::ConfigMissing)
        ));
        assert!(matches!(authority.get_config(), Err(Error::ConfigMissing)));
    }

    #[test]
    fn chain_of_three() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        authority.set_config(&default_config()).unwrap();

        let (svc, token) = authority.generate("svc").unwrap();
        assert_eq!(token, "");
        assert_eq!(serial_of(&svc.certificate), 2);
        assert_eq!(cn_of(svc.certificate.issuer_name()), "ca");

        let (leaf, _) = authority
            .generate_with_options(
                "leaf",
                "svc",
                &["api.example.com".to_string()],
                &["127.0.0.1".parse().unwrap()],
            )
            .unwrap();
        assert_eq!(serial_of(&leaf.certificate), 3);
        assert_eq!(cn_of(leaf.certificate.issuer_name()), "svc");

        let sans = leaf.certificate.subject_alt_names().unwrap();
        assert!(sans.iter().any(|g| g.dnsname() == Some("api.example.com")));
        assert!(sans.iter().any(|g| g.ipaddress() == Some(&[127, 0, 0, 1][..])));
    }

    #[test]
    fn duplicate_generate_returns_original_material() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        authority.set_config(&default_config()).unwrap();

        let (first, _) = authority.generate("svc").unwrap();
        match authority.generate("svc") {
            Err(Error::CertAlreadyExists { name, existing }) => {
                assert_eq!(name, "svc");
                assert_eq!(
                    existing.certificate.to_der().unwrap(),
                    first.certificate.to_der().unwrap()
                );
            }
            other => panic!("expected CertAlreadyExists, got {other:?}"),
        }
    }

    #[test]
    fn reserved_names_are_rejected_without_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        authority.set_config(&default_config()).unwrap();

        for name in RESTRICTED_NAMES {
            assert!(matches!(
                authority.generate(name),
                Err(Error::RestrictedName(_))
            ));
        }
        // uppercase forms canonicalize into the reserved set
        assert!(matches!(
            authority.generate("Config"),
            Err(Error::RestrictedName(_))
        ));
        assert!(!dir.path().join("certs/config.crt").exists());
    }

    #[test]
    fn canonical_names_refer_to_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        authority.set_config(&default_config()).unwrap();

        let (created, _) = authority.generate("Foo Bar").unwrap();
        assert_eq!(created.common_name, "foo-bar");

        let fetched = authority.get("foo-bar").unwrap();
        assert_eq!(
            fetched.certificate.to_der().unwrap(),
            created.certificate.to_der().unwrap()
        );
    }

    #[test]
    fn get_reports_missing_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        authority.set_config(&default_config()).unwrap();
        assert!(matches!(
            authority.get("ghost"),
            Err(Error::CertNotFound(name)) if name == "ghost"
        ));
    }

    #[test]
    fn revocations_land_in_the_root_crl() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        authority.set_config(&default_config()).unwrap();

        authority.generate("svc").unwrap();
        authority
            .generate_with_parent("leaf", "svc")
            .unwrap();

        authority.revoke("leaf").unwrap();
        let ca = authority.get_ca().unwrap();
        assert_eq!(revoked_serials(&ca.crl).unwrap(), [3]);

        authority.revoke("svc").unwrap();
        let ca = authority.get_ca().unwrap();
        let mut serials = revoked_serials(&ca.crl).unwrap();
        serials.sort_unstable();
        assert_eq!(serials, [2, 3]);
    }

    #[test]
    fn per_owner_revocation_keeps_the_root_crl_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        authority.set_config(&default_config()).unwrap();

        authority.generate("svc").unwrap();
        let (leaf, _) = authority.generate_with_parent("leaf", "svc").unwrap();

        authority.revoke_with_parent("leaf", "svc").unwrap();

        let svc_crl = FileBackend::new(dir.path()).get_crl_raw("svc").unwrap();
        assert_eq!(
            revoked_serials(&svc_crl).unwrap(),
            [serial_of(&leaf.certificate)]
        );

        let ca = authority.get_ca().unwrap();
        assert!(ca.crl.is_empty());
    }

    #[test]
    fn revoking_a_missing_certificate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        authority.set_config(&default_config()).unwrap();
        assert!(matches!(
            authority.revoke("ghost"),
            Err(Error::CertNotFound(_))
        ));
    }

    #[test]
    fn imported_material_is_served_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        authority.set_config(&default_config()).unwrap();

        // issue in one authority, import into a fresh one
        let (view, _) = authority.generate("donor").unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let mut other = open_authority(dir2.path());
        other.set_config(&default_config()).unwrap();
        other
            .set_certificate("imported", &view.certificate, &view.private_key)
            .unwrap();

        let fetched = other.get("imported").unwrap();
        assert_eq!(
            fetched.certificate.to_der().unwrap(),
            view.certificate.to_der().unwrap()
        );

        // second import of the same name is refused
        assert!(matches!(
            other.set_certificate("imported", &view.certificate, &view.private_key),
            Err(Error::CertAlreadyExists { .. })
        ));

        // reserved names are refused
        assert!(matches!(
            other.set_certificate("crl", &view.certificate, &view.private_key),
            Err(Error::RestrictedName(_))
        ));
    }

    #[test]
    fn an_imported_root_signs_new_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let mut donor = open_authority(dir.path());
        donor.set_config(&default_config()).unwrap();
        let donor_ca = donor.get_ca().unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let mut fresh = open_authority(dir2.path());
        fresh.set_config(&default_config()).unwrap();
        fresh
            .set_ca_certificate(&donor_ca.cert.certificate, &donor_ca.cert.private_key)
            .unwrap();

        let (svc, _) = fresh.generate("svc").unwrap();
        assert_eq!(cn_of(svc.certificate.issuer_name()), "ca");
        assert_eq!(serial_of(&svc.certificate), 1);

        // a second root cannot be installed over the first
        assert!(matches!(
            fresh.set_ca_certificate(&donor_ca.cert.certificate, &donor_ca.cert.private_key),
            Err(Error::CertAlreadyExists { .. })
        ));
    }

    #[test]
    fn config_round_trips_through_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut authority = open_authority(dir.path());
        let cfg = default_config();
        authority.set_config(&cfg).unwrap();

        // a second authority over the same backend observes the document
        let mut other = open_authority(dir.path());
        assert_eq!(other.get_config().unwrap(), cfg);
    }
}
