//! PKI engine: key generation, certificate assembly, revocation lists.
//!
//! Issuance follows one template for every record: RSA-2048 key, subject
//! assembled from the configured defaults, serial from the backend's
//! allocator, CA-capable extensions. The root signs itself; everything
//! else is signed by its parent's key, which permits multi-level
//! hierarchies because every issued certificate carries the CA bit.
//! Consumers decide trust scope out-of-band.
//!
//! Revocation is append-and-re-sign: the owner's stored list is decoded,
//! the victim's serial appended (no deduplication), and a fresh list is
//! signed with the owner's key.

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509, X509Builder, X509Name, X509NameBuilder};
use rcgen::{
    CertificateRevocationListParams, Issuer, KeyIdMethod, KeyPair, RevokedCertParams, SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;

use crate::cert::{certificate_pem, Cert, CA_NAME};
use crate::config::Config;
use crate::error::{Error, PkiError, Result};

const KEY_BITS: u32 = 2048;

/// Backdating applied to NotBefore to absorb clock skew between the
/// authority and certificate consumers.
const NOT_BEFORE_SKEW_SECS: i64 = 5 * 60;

/// Issue a certificate and private key for `owner`.
///
/// The root record signs itself; any other record is signed by its
/// parent, which must already exist with loadable material. A missing
/// root parent is created on the fly, so the first issuance against an
/// empty backend bootstraps the hierarchy.
pub fn create_certificate(owner: &Cert<'_>) -> Result<(X509, PKey<Private>)> {
    let config = owner.config();

    let rsa = Rsa::generate(KEY_BITS)?;
    let key = PKey::from_rsa(rsa)?;

    let subject = build_subject(config, &owner.storage_name())?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;

    let serial = owner.backend().next_serial_number()?;
    let serial_bn = BigNum::from_dec_str(&serial.to_string())?;
    let serial_asn1 = serial_bn.to_asn1_integer()?;
    builder.set_serial_number(&serial_asn1)?;

    builder.set_subject_name(&subject)?;
    builder.set_pubkey(&key)?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let not_before = Asn1Time::from_unix(now - NOT_BEFORE_SKEW_SECS)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(config.cert_expiry_days())?;
    builder.set_not_after(&not_after)?;

    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_cert_sign()
            .crl_sign()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().client_auth().server_auth().build()?)?;

    if !owner.dns_names.is_empty() || !owner.ip_addresses.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for dns in &owner.dns_names {
            san.dns(dns);
        }
        for ip in &owner.ip_addresses {
            san.ip(&ip.to_string());
        }
        let ext = san.build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ext)?;
    }

    let digest = config.message_digest();
    if owner.is_root() {
        builder.set_issuer_name(&subject)?;
        builder.sign(&key, digest)?;
    } else {
        let parent_name = owner.parent_storage_name();
        let (parent_cert, parent_key) = load_parent(owner, &parent_name)?;
        builder.set_issuer_name(parent_cert.subject_name())?;
        builder.sign(&parent_key, digest)?;
    }

    // round-trip through DER so a malformed build never reaches storage
    let der = builder.build().to_der()?;
    let certificate = X509::from_der(&der)?;

    debug!(name = %owner.storage_name(), serial, "issued certificate");
    Ok((certificate, key))
}

/// Append `victim` to the revocation list owned by `owner` and re-sign.
///
/// Prior entries are preserved in insertion order; a serial revoked
/// twice appears twice. Consumers must treat any listed serial as
/// revoked.
pub fn append_revocation(owner: &mut Cert<'_>, victim: &X509) -> Result<()> {
    let owner_name = owner.storage_name();

    let existing = owner.crl_raw()?;
    let mut revoked = decode_entries(&existing)?;

    let victim_serial = victim.serial_number().to_bn()?;
    revoked.push(RevokedCertParams {
        serial_number: SerialNumber::from(victim_serial.to_vec()),
        revocation_time: OffsetDateTime::now_utc(),
        reason_code: None,
        invalidity_date: None,
    });

    let this_update = OffsetDateTime::now_utc();
    let next_update = this_update + Duration::days(i64::from(owner.config().crl_days()));
    let params = CertificateRevocationListParams {
        this_update,
        next_update,
        crl_number: SerialNumber::from(serial_bytes(revoked.len() as u64)),
        issuing_distribution_point: None,
        revoked_certs: revoked,
        key_identifier_method: KeyIdMethod::Sha256,
    };

    let owner_cert_pem = certificate_pem(owner.certificate()?)?;
    let owner_key_pkcs8 = owner
        .private_key()
        .map_err(|_| Error::OwnerKeyMissing(owner_name.clone()))?
        .private_key_to_pem_pkcs8()
        .map_err(PkiError::from)?;

    let key_pair = KeyPair::from_pem(&String::from_utf8_lossy(&owner_key_pkcs8))?;
    let issuer = Issuer::from_ca_cert_pem(&owner_cert_pem, key_pair)?;
    let crl = params.signed_by(&issuer)?;

    owner.backend().put_crl(&owner_name, crl.der().as_ref())?;
    info!(owner = %owner_name, "revocation list re-signed");
    Ok(())
}

/// Serial numbers listed in a DER revocation list; empty input decodes
/// to an empty list.
pub fn revoked_serials(der: &[u8]) -> Result<Vec<u64>> {
    if der.is_empty() {
        return Ok(Vec::new());
    }
    let (_, crl) = CertificateRevocationList::from_der(der)
        .map_err(|e| PkiError::CrlDecode(format!("{e:?}")))?;
    Ok(crl
        .iter_revoked_certificates()
        .map(|rc| {
            rc.user_certificate
                .to_bytes_be()
                .iter()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
        })
        .collect())
}

fn decode_entries(der: &[u8]) -> Result<Vec<RevokedCertParams>> {
    if der.is_empty() {
        return Ok(Vec::new());
    }
    let (_, crl) = CertificateRevocationList::from_der(der)
        .map_err(|e| PkiError::CrlDecode(format!("{e:?}")))?;

    let mut entries = Vec::new();
    for rc in crl.iter_revoked_certificates() {
        let revoked_at = OffsetDateTime::from_unix_timestamp(rc.revocation_date.timestamp())
            .map_err(|e| PkiError::CrlDecode(e.to_string()))?;
        entries.push(RevokedCertParams {
            serial_number: SerialNumber::from(rc.user_certificate.to_bytes_be()),
            revocation_time: revoked_at,
            reason_code: None,
            invalidity_date: None,
        });
    }
    Ok(entries)
}

/// Subject assembled from the configured defaults. Empty fields are
/// skipped rather than encoded as empty attributes.
fn build_subject(config: &Config, common_name: &str) -> Result<X509Name> {
    let d = &config.defaults;
    let mut name = X509NameBuilder::new()?;
    for (nid, value) in [
        (Nid::COUNTRYNAME, &d.country),
        (Nid::ORGANIZATIONNAME, &d.org),
        (Nid::ORGANIZATIONALUNITNAME, &d.org_unit),
        (Nid::LOCALITYNAME, &d.city),
        (Nid::STATEORPROVINCENAME, &d.region),
    ] {
        if !value.is_empty() {
            name.append_entry_by_nid(nid, value)?;
        }
    }
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name.build())
}

fn load_parent(owner: &Cert<'_>, parent_name: &str) -> Result<(X509, PKey<Private>)> {
    let mut parent = Cert::new(owner.backend(), owner.config().clone(), parent_name);

    if !parent.exists() {
        if parent_name == CA_NAME {
            // first issuance against an empty backend: bootstrap the root
            parent.create()?;
        } else {
            return Err(Error::ParentUnavailable(parent_name.to_string()));
        }
    }

    let certificate = parent
        .certificate()
        .map_err(|_| Error::ParentUnavailable(parent_name.to_string()))?
        .clone();
    let private_key = parent
        .private_key()
        .map_err(|_| Error::ParentUnavailable(parent_name.to_string()))?
        .clone();
    Ok((certificate, private_key))
}

fn serial_bytes(n: u64) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, FileBackend};
    use openssl::stack::Stack;
    use openssl::x509::store::X509StoreBuilder;
    use openssl::x509::X509StoreContext;

    fn test_backend(dir: &std::path::Path) -> FileBackend {
        let mut backend = FileBackend::new(dir);
        backend.connect().unwrap();
        backend
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
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
    fn root_is_self_signed_with_serial_one() {
        let dir = tempfile::tempdir().unwrap();
        let backend = test_backend(dir.path());
        let mut ca = Cert::new(&backend, test_config(), CA_NAME);
        ca.create().unwrap();

        let cert = ca.certificate().unwrap();
        assert_eq!(cn_of(cert.subject_name()), "ca");
        assert_eq!(cn_of(cert.issuer_name()), "ca");
        assert_eq!(serial_of(cert), 1);
    }

    #[test]
    fn serial_numbers_increase_across_issuances() {
        let dir = tempfile::tempdir().unwrap();
        let backend = test_backend(dir.path());

        let mut ca = Cert::new(&backend, test_config(), CA_NAME);
        ca.create().unwrap();
        let mut one = Cert::new(&backend, test_config(), "one");
        one.create().unwrap();
        let mut two = Cert::new(&backend, test_config(), "two");
        two.create().unwrap();

        let serials = [
            serial_of(ca.certificate().unwrap()),
            serial_of(one.certificate().unwrap()),
            serial_of(two.certificate().unwrap()),
        ];
        assert_eq!(serials, [1, 2, 3]);
    }

    #[test]
    fn first_issuance_bootstraps_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = test_backend(dir.path());

        let mut cert = Cert::new(&backend, test_config(), "foo");
        cert.create().unwrap();

        let ca = Cert::new(&backend, test_config(), CA_NAME);
        assert!(ca.exists());
    }

    #[test]
    fn chained_certificates_verify_against_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = test_backend(dir.path());

        let mut parent = Cert::new(&backend, test_config(), "inter");
        parent.create().unwrap();
        let mut child = Cert::new(&backend, test_config(), "leaf").with_parent("inter");
        child.create().unwrap();

        let parent_cert = parent.certificate().unwrap().clone();
        let child_cert = child.certificate().unwrap().clone();
        assert_eq!(cn_of(child_cert.issuer_name()), "inter");

        let mut ca = Cert::new(&backend, test_config(), CA_NAME);
        let ca_cert = ca.certificate().unwrap().clone();

        let mut roots = X509StoreBuilder::new().unwrap();
        roots.add_cert(ca_cert).unwrap();
        let roots = roots.build();

        let mut intermediates = Stack::new().unwrap();
        intermediates.push(parent_cert).unwrap();

        let mut ctx = X509StoreContext::new().unwrap();
        let verified = ctx
            .init(&roots, &child_cert, &intermediates, |c| c.verify_cert())
            .unwrap();
        assert!(verified);
    }

    #[test]
    fn missing_parent_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = test_backend(dir.path());
        let mut ca = Cert::new(&backend, test_config(), CA_NAME);
        ca.create().unwrap();

        let mut orphan = Cert::new(&backend, test_config(), "orphan").with_parent("nope");
        assert!(matches!(
            orphan.create(),
            Err(Error::ParentUnavailable(name)) if name == "nope"
        ));
    }

    #[test]
    fn subject_alt_names_are_issued() {
        let dir = tempfile::tempdir().unwrap();
        let backend = test_backend(dir.path());

        let mut cert = Cert::new(&backend, test_config(), "api").with_subject_alt_names(
            vec!["api.example.com".to_string()],
            vec!["127.0.0.1".parse().unwrap()],
        );
        cert.create().unwrap();

        let sans = cert.certificate().unwrap().subject_alt_names().unwrap();
        let dns: Vec<_> = sans.iter().filter_map(|g| g.dnsname()).collect();
        assert_eq!(dns, ["api.example.com"]);
        let ips: Vec<_> = sans.iter().filter_map(|g| g.ipaddress()).collect();
        assert_eq!(ips, [&[127u8, 0, 0, 1][..]]);
    }

    #[test]
    fn cert_expiry_config_controls_validity() {
        let dir = tempfile::tempdir().unwrap();
        let backend = test_backend(dir.path());
        let mut cfg = test_config();
        cfg.set_item("cert_expiry", "365");

        let mut cert = Cert::new(&backend, cfg, CA_NAME);
        cert.create().unwrap();

        let expected = Asn1Time::days_from_now(365).unwrap();
        let diff = expected.diff(cert.certificate().unwrap().not_after()).unwrap();
        assert_eq!(diff.days, 0);
        assert!(diff.secs.abs() < 60);
    }

    #[test]
    fn revocations_append_without_deduplication() {
        let dir = tempfile::tempdir().unwrap();
        let backend = test_backend(dir.path());

        let mut ca = Cert::new(&backend, test_config(), CA_NAME);
        ca.create().unwrap();
        let mut one = Cert::new(&backend, test_config(), "one");
        one.create().unwrap();
        let mut two = Cert::new(&backend, test_config(), "two");
        two.create().unwrap();
        let one_cert = one.certificate().unwrap().clone();
        let two_cert = two.certificate().unwrap().clone();

        assert!(ca.crl_raw().unwrap().is_empty());

        ca.revoke(&one_cert).unwrap();
        assert_eq!(revoked_serials(&ca.crl_raw().unwrap()).unwrap(), [2]);

        ca.revoke(&two_cert).unwrap();
        let mut serials = revoked_serials(&ca.crl_raw().unwrap()).unwrap();
        serials.sort_unstable();
        assert_eq!(serials, [2, 3]);

        // revoking the same certificate again appends a second entry
        ca.revoke(&one_cert).unwrap();
        assert_eq!(revoked_serials(&ca.crl_raw().unwrap()).unwrap().len(), 3);
    }

    #[test]
    fn intermediates_own_their_revocation_lists() {
        let dir = tempfile::tempdir().unwrap();
        let backend = test_backend(dir.path());

        let mut parent = Cert::new(&backend, test_config(), "inter");
        parent.create().unwrap();
        let mut child = Cert::new(&backend, test_config(), "leaf").with_parent("inter");
        child.create().unwrap();
        let child_cert = child.certificate().unwrap().clone();
        let child_serial = serial_of(&child_cert);

        parent.revoke(&child_cert).unwrap();

        let serials = revoked_serials(&parent.crl_raw().unwrap()).unwrap();
        assert_eq!(serials, [child_serial]);

        let ca = Cert::new(&backend, test_config(), CA_NAME);
        assert!(ca.crl_raw().unwrap().is_empty());
    }
}
