//! Certificate fixtures for the test modules. Only compiled for tests.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Extension, X509NameBuilder, X509};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn make_keypair() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("curve");
    PKey::from_ec_key(EcKey::generate(&group).expect("keygen")).expect("pkey")
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_secs() as i64
}

pub struct CertSpec<'a> {
    pub common_name: &'a str,
    pub issuer: Option<(&'a X509, &'a PKey<Private>)>,
    pub is_ca: bool,
    /// Offsets of the validity window relative to now, in days.
    pub not_before_days: i64,
    pub not_after_days: i64,
    pub responder_url: Option<&'a str>,
}

impl<'a> CertSpec<'a> {
    pub fn new(common_name: &'a str) -> Self {
        CertSpec {
            common_name,
            issuer: None,
            is_ca: false,
            not_before_days: -1,
            not_after_days: 365,
            responder_url: None,
        }
    }
}

pub fn build_certificate(spec: &CertSpec<'_>) -> (X509, PKey<Private>) {
    let key = make_keypair();
    let certificate = build_certificate_with_key(spec, &key);
    (certificate, key)
}

/// Builds a certificate over an existing subject key, the way a CA answers a
/// CSR.
pub fn build_certificate_with_key(spec: &CertSpec<'_>, key: &PKey<Private>) -> X509 {
    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("C", "DE").expect("C");
    name.append_entry_by_text("O", "EVerest").expect("O");
    name.append_entry_by_text("CN", spec.common_name).expect("CN");
    let name = name.build();

    let mut builder = X509::builder().expect("builder");
    builder.set_version(2).expect("version");

    let mut serial = BigNum::new().expect("bn");
    serial.rand(64, MsbOption::MAYBE_ZERO, false).expect("serial");
    builder
        .set_serial_number(&serial.to_asn1_integer().expect("asn1 serial"))
        .expect("set serial");

    builder.set_subject_name(&name).expect("subject");
    builder.set_pubkey(key).expect("pubkey");

    let not_before =
        Asn1Time::from_unix(unix_now() + spec.not_before_days * 86400).expect("not before");
    let not_after =
        Asn1Time::from_unix(unix_now() + spec.not_after_days * 86400).expect("not after");
    builder.set_not_before(&not_before).expect("set nb");
    builder.set_not_after(&not_after).expect("set na");

    if spec.is_ca || spec.issuer.is_none() {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().expect("bc"))
            .expect("append bc");
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()
                    .expect("ku"),
            )
            .expect("append ku");
    } else {
        builder
            .append_extension(BasicConstraints::new().critical().build().expect("bc"))
            .expect("append bc");
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_agreement()
                    .build()
                    .expect("ku"),
            )
            .expect("append ku");
    }

    if let Some(url) = spec.responder_url {
        let context = match spec.issuer {
            Some((issuer_cert, _)) => builder.x509v3_context(Some(issuer_cert), None),
            None => builder.x509v3_context(None, None),
        };
        #[allow(deprecated)]
        let aia = X509Extension::new_nid(
            None,
            Some(&context),
            Nid::INFO_ACCESS,
            &format!("OCSP;URI:{}", url),
        )
        .expect("aia");
        builder.append_extension(aia).expect("append aia");
    }

    match spec.issuer {
        Some((issuer_cert, issuer_key)) => {
            builder
                .set_issuer_name(issuer_cert.subject_name())
                .expect("issuer name");
            builder
                .sign(issuer_key, MessageDigest::sha256())
                .expect("sign");
        }
        None => {
            builder.set_issuer_name(&name).expect("issuer name");
            builder.sign(key, MessageDigest::sha256()).expect("self sign");
        }
    }

    builder.build()
}

/// Self-signed CA valid for ten years.
pub fn make_root(common_name: &str) -> (X509, PKey<Private>) {
    let mut spec = CertSpec::new(common_name);
    spec.is_ca = true;
    spec.not_after_days = 3650;
    build_certificate(&spec)
}

/// Certificate signed by `issuer`. Negative `valid_days` produces an already
/// expired certificate.
pub fn make_signed(
    common_name: &str,
    issuer: &X509,
    issuer_key: &PKey<Private>,
    is_ca: bool,
    valid_days: i64,
) -> (X509, PKey<Private>) {
    let mut spec = CertSpec::new(common_name);
    spec.issuer = Some((issuer, issuer_key));
    spec.is_ca = is_ca;
    if valid_days < 0 {
        spec.not_before_days = valid_days - 30;
        spec.not_after_days = valid_days;
    } else {
        spec.not_after_days = valid_days;
    }
    build_certificate(&spec)
}

pub fn pem_of(certificate: &X509) -> String {
    String::from_utf8(certificate.to_pem().expect("pem")).expect("utf8")
}

pub fn key_pem_of(key: &PKey<Private>) -> Vec<u8> {
    key.private_key_to_pem_pkcs8().expect("key pem")
}
