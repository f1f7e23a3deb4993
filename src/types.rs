//! Public vocabulary of the certificate store.
//!
//! These types mirror what the OCPP and ISO 15118 layers consume: trust-anchor
//! and leaf classifications, hash identifiers, and the status enums returned by
//! every store operation.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Encoding of certificate input/output data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingFormat {
    Der,
    Pem,
}

/// The four classes of trust anchors held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CaCertificateType {
    V2g,
    Mo,
    Csms,
    Mf,
}

impl fmt::Display for CaCertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaCertificateType::V2g => "V2G",
            CaCertificateType::Mo => "MO",
            CaCertificateType::Csms => "CSMS",
            CaCertificateType::Mf => "MF",
        };
        write!(f, "{}", s)
    }
}

/// Leaf (end-entity) certificate classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafCertificateType {
    Csms,
    V2g,
    Mf,
    Mo,
}

impl LeafCertificateType {
    /// Prefix used when naming leaf certificate and key files on disk.
    pub fn filename_prefix(&self) -> &'static str {
        match self {
            LeafCertificateType::Csms => "CSMS_LEAF_",
            LeafCertificateType::V2g => "SECC_LEAF_",
            LeafCertificateType::Mf => "MF_LEAF_",
            LeafCertificateType::Mo => "MO_LEAF_",
        }
    }
}

impl fmt::Display for LeafCertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeafCertificateType::Csms => "CSMS",
            LeafCertificateType::V2g => "V2G",
            LeafCertificateType::Mf => "MF",
            LeafCertificateType::Mo => "MO",
        };
        write!(f, "{}", s)
    }
}

/// Certificate classification used by the installed-certificates queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateType {
    V2gRootCertificate,
    MoRootCertificate,
    CsmsRootCertificate,
    V2gCertificateChain,
    MfRootCertificate,
}

impl From<CaCertificateType> for CertificateType {
    fn from(value: CaCertificateType) -> Self {
        match value {
            CaCertificateType::V2g => CertificateType::V2gRootCertificate,
            CaCertificateType::Mo => CertificateType::MoRootCertificate,
            CaCertificateType::Csms => CertificateType::CsmsRootCertificate,
            CaCertificateType::Mf => CertificateType::MfRootCertificate,
        }
    }
}

/// Hash algorithm used in a [`CertificateHashData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha384 => "SHA384",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "SHA256" => Some(HashAlgorithm::Sha256),
            "SHA384" => Some(HashAlgorithm::Sha384),
            "SHA512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }
}

/// Result of a chain verification against the installed trust anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateValidationResult {
    Valid,
    Expired,
    InvalidSignature,
    IssuerNotFound,
    InvalidLeafSignature,
    InvalidChain,
    Unknown,
}

/// Result of installing a CA or leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallCertificateResult {
    InvalidSignature,
    InvalidCertificateChain,
    InvalidFormat,
    InvalidCommonName,
    NoRootCertificateInstalled,
    Expired,
    CertificateStoreMaxLengthExceeded,
    WriteError,
    Accepted,
}

/// Outcome of a delete-by-hash request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteCertificateResult {
    Accepted,
    Failed,
    NotFound,
}

/// Delete outcome plus the certificate class(es) the hash resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    pub result: DeleteCertificateResult,
    pub ca_certificate_type: Option<CaCertificateType>,
    pub leaf_certificate_type: Option<LeafCertificateType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetInstalledCertificatesStatus {
    Accepted,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetCertificateInfoStatus {
    Accepted,
    Rejected,
    NotFound,
    NotFoundValid,
    PrivateKeyNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetCertificateSignRequestStatus {
    Accepted,
    InvalidRequestedType,
    KeyGenError,
    GenerationError,
}

/// Status plus the PEM encoded CSR when generation succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCertificateSignRequestResult {
    pub status: GetCertificateSignRequestStatus,
    pub csr: Option<String>,
}

/// OCPP-style certificate hash identifier.
///
/// For a self-signed certificate both hashes derive from the certificate
/// itself; for an issued certificate the `issuer_key_hash` is computed over the
/// issuer's public key, so producing one requires the issuer to be at hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateHashData {
    pub hash_algorithm: HashAlgorithm,
    /// Hash over the DER encoding of the issuer's distinguished name.
    pub issuer_name_hash: String,
    /// Hash over the issuer's public key bits (excluding tag and length).
    pub issuer_key_hash: String,
    /// Lowercase hex serial, no `0x` prefix, no leading zeroes.
    pub serial_number: String,
}

impl CertificateHashData {
    /// Compares the hex fields ignoring ASCII case. Some backends report the
    /// hashes uppercased.
    pub fn case_insensitive_eq(&self, other: &CertificateHashData) -> bool {
        self.hash_algorithm == other.hash_algorithm
            && self
                .issuer_name_hash
                .eq_ignore_ascii_case(&other.issuer_name_hash)
            && self
                .issuer_key_hash
                .eq_ignore_ascii_case(&other.issuer_key_hash)
            && self
                .serial_number
                .eq_ignore_ascii_case(&other.serial_number)
    }

    pub fn is_complete(&self) -> bool {
        !self.issuer_name_hash.is_empty()
            && !self.issuer_key_hash.is_empty()
            && !self.serial_number.is_empty()
    }
}

/// A root (or leaf-first chain head) hash together with its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateHashDataChain {
    pub certificate_type: CertificateType,
    pub certificate_hash_data: CertificateHashData,
    pub child_certificate_hash_data: Vec<CertificateHashData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetInstalledCertificatesResult {
    pub status: GetInstalledCertificatesStatus,
    pub certificate_hash_data_chain: Vec<CertificateHashDataChain>,
}

/// One entry of an OCSP request: the certificate identity plus where to ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcspRequestData {
    pub certificate_hash_data: Option<CertificateHashData>,
    pub responder_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OcspRequestDataList {
    pub ocsp_request_data_list: Vec<OcspRequestData>,
}

/// Cached OCSP response location for one certificate of a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateOcsp {
    pub hash: CertificateHashData,
    pub ocsp_data: Option<PathBuf>,
}

/// A leaf key-pair record: private key, single-leaf file, optional full chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Path of the PEM or DER encoded private key.
    pub key: PathBuf,
    /// Path of the full certificate chain file, if one exists.
    pub certificate: Option<PathBuf>,
    /// Path of the single leaf certificate file, if one exists.
    pub certificate_single: Option<PathBuf>,
    /// Number of certificates in the chain (1 for a single leaf).
    pub certificate_count: usize,
    /// Password for the private key when it is encrypted.
    pub password: Option<String>,
    /// OCSP data ordered by the chain file order.
    pub ocsp: Vec<CertificateOcsp>,
    /// PEM of the root this leaf chains up to, when requested.
    pub certificate_root: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCertificateInfoResult {
    pub status: GetCertificateInfoStatus,
    pub info: Option<CertificateInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetCertificateFullInfoResult {
    pub status: GetCertificateInfoStatus,
    pub info: Vec<CertificateInfo>,
}

/// Parameters of the leaf-info engine behind the certificate info queries.
#[derive(Debug, Clone, Copy)]
pub struct CertificateQueryParams {
    pub certificate_type: LeafCertificateType,
    pub encoding: EncodingFormat,
    pub include_ocsp: bool,
    pub include_root: bool,
    /// Collect every valid leaf instead of stopping at the newest.
    pub include_all_valid: bool,
    /// Treat not-yet-valid leafs as acceptable.
    pub include_future_valid: bool,
    /// Drop leafs that appear both in a single file and inside a chain file.
    pub remove_duplicates: bool,
}

impl CertificateQueryParams {
    pub fn new(certificate_type: LeafCertificateType) -> Self {
        CertificateQueryParams {
            certificate_type,
            encoding: EncodingFormat::Pem,
            include_ocsp: false,
            include_root: false,
            include_all_valid: false,
            include_future_valid: false,
            remove_duplicates: false,
        }
    }
}

pub const PEM_EXTENSION: &str = "pem";
pub const DER_EXTENSION: &str = "der";
pub const KEY_EXTENSION: &str = "key";
/// Keys produced by a custom (e.g. hardware-backed) provider.
pub const CUSTOM_KEY_EXTENSION: &str = "tkey";
pub const CERT_HASH_EXTENSION: &str = "hash";
