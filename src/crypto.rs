//! The crypto provider seam.
//!
//! Every cryptographic capability the store needs is expressed as an
//! associated function on [`CryptoSupplier`]; the rest of the crate only talks
//! to the [`Crypto`] alias, which selects the implementation at build time.
//! Nothing outside the supplier module touches a crypto library directly.

use std::path::Path;

use crate::error::CertStoreError;
use crate::types::{CertificateValidationResult, EncodingFormat};

/// Outcome of pairing a private key against a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyValidationResult {
    Valid,
    /// The key bytes could not be loaded at all (bad data or wrong password).
    KeyLoadFailure,
    /// The key loaded but does not belong to the certificate.
    Invalid,
    Unknown,
}

/// Outcome of CSR generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateSignRequestResult {
    Valid,
    KeyGenerationError,
    VersioningError,
    PubkeyError,
    ExtensionsError,
    FormatError,
    Unknown,
}

/// Key algorithms supported for CSR key generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoKeyType {
    EcPrime256v1,
    EcSecp384r1,
    Rsa2048,
    Rsa3072,
    Rsa7680,
}

/// Key usage and extended key usage flags readable from a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CertificateKeyUsageFlags {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
    SslServer,
    SslClient,
    Smime,
    CodeSign,
    OcspSign,
    Timestamp,
    Dvcs,
    AnyEku,
}

/// Parameters for generating the CSR key pair.
#[derive(Debug, Clone)]
pub struct KeyGenerationInfo {
    pub key_type: CryptoKeyType,
    /// Request the custom (e.g. hardware-backed) provider for generation.
    pub generate_on_custom: bool,
    pub public_key_file: Option<std::path::PathBuf>,
    pub private_key_file: Option<std::path::PathBuf>,
    pub private_key_pass: Option<String>,
}

/// Full CSR request description.
#[derive(Debug, Clone)]
pub struct CertificateSigningRequestInfo {
    pub n_version: i32,
    pub country: String,
    pub organization: String,
    pub common_name: String,
    pub dns_name: Option<String>,
    pub ip_address: Option<String>,
    pub key_info: KeyGenerationInfo,
}

/// Capability set every crypto supplier must provide. All functions are
/// associated (no instance state); the supplier is chosen once at build time
/// through the [`Crypto`] alias.
pub trait CryptoSupplier {
    /// Opaque, cheaply clonable handle to a parsed X.509 certificate.
    type X509Handle: Clone;

    fn supplier_name() -> &'static str;

    /// Whether a custom (hardware-backed) key provider is available for key
    /// generation. Pairing against `.tkey` files works regardless.
    fn supports_custom_key_creation() -> bool;

    /// Parses all certificates contained in `data`. PEM input may hold many
    /// blocks; DER input holds exactly one certificate.
    fn load_certificates(
        data: &[u8],
        encoding: EncodingFormat,
    ) -> Result<Vec<Self::X509Handle>, CertStoreError>;

    fn x509_to_pem(handle: &Self::X509Handle) -> String;
    fn x509_get_common_name(handle: &Self::X509Handle) -> String;
    /// OCSP responder URL from the authority-information-access extension, or
    /// empty when absent.
    fn x509_get_responder_url(handle: &Self::X509Handle) -> String;
    /// Lowercase hex serial without leading zeroes.
    fn x509_get_serial_number(handle: &Self::X509Handle) -> String;
    /// SHA-256 over the DER encoded issuer name, lowercase hex.
    fn x509_get_issuer_name_hash(handle: &Self::X509Handle) -> String;
    /// SHA-256 over the subject public key bits (excluding tag and length),
    /// lowercase hex.
    fn x509_get_key_hash(handle: &Self::X509Handle) -> String;
    /// Seconds from now to not-before (`valid_in`) and not-after (`valid_to`).
    /// Negative values are in the past.
    fn x509_get_validity(handle: &Self::X509Handle) -> (i64, i64);
    fn x509_is_selfsigned(handle: &Self::X509Handle) -> bool;
    /// True when `child` verifies against `parent` as its issuer. A
    /// certificate is never considered its own child.
    fn x509_is_child(child: &Self::X509Handle, parent: &Self::X509Handle) -> bool;
    fn x509_is_equal(a: &Self::X509Handle, b: &Self::X509Handle) -> bool;
    fn x509_get_key_usage_flags(handle: &Self::X509Handle) -> Vec<CertificateKeyUsageFlags>;

    /// Verifies `target` against the trusted anchors, allowing the given
    /// untrusted intermediates to participate in chain building. When
    /// `allow_future_certificates` is set, expiry is still rejected but
    /// not-yet-valid certificates pass.
    fn x509_verify_certificate_chain(
        target: &Self::X509Handle,
        trusted: &[Self::X509Handle],
        untrusted_intermediates: &[Self::X509Handle],
        allow_future_certificates: bool,
    ) -> CertificateValidationResult;

    /// Trial-decrypts the key bytes and checks consistency with the
    /// certificate's public key.
    fn x509_check_private_key(
        handle: &Self::X509Handle,
        private_key: &[u8],
        password: Option<&str>,
    ) -> KeyValidationResult;

    /// Verifies `signature` over `digest` with the certificate public key.
    fn x509_verify_signature(
        handle: &Self::X509Handle,
        signature: &[u8],
        digest: &[u8],
    ) -> bool;

    /// Generates the key pair (written to `info.key_info.private_key_file`)
    /// and the PEM CSR.
    fn x509_generate_csr(
        info: &CertificateSigningRequestInfo,
    ) -> (CertificateSignRequestResult, Option<String>);

    fn digest_sha256_file(path: &Path) -> Option<Vec<u8>>;

    fn base64_decode_to_bytes(data: &str) -> Option<Vec<u8>>;
    fn base64_decode_to_string(data: &str) -> Option<String>;
    fn base64_encode_from_bytes(bytes: &[u8]) -> Option<String>;
    fn base64_encode_from_string(data: &str) -> Option<String>;

    /// Populates `dir` with `<subject-name-hash>.N` symlinks the way
    /// `openssl rehash` does, so a TLS stack can use it as a CApath. Returns
    /// true on success.
    fn hash_dir(dir: &Path) -> bool;
}

/// The supplier selected for this build.
pub type Crypto = crate::openssl_supplier::OpensslSupplier;

/// The certificate handle type of the selected supplier.
pub type X509Handle = <Crypto as CryptoSupplier>::X509Handle;
