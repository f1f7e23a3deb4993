//! Wrapper around one parsed X.509 certificate.
//!
//! A [`Certificate`] exclusively owns its parsed handle, remembers the file it
//! was loaded from (if any) and caches its validity window at parse time.

use std::path::{Path, PathBuf};

use crate::crypto::{CertificateKeyUsageFlags, Crypto, CryptoSupplier, X509Handle};
use crate::error::CertStoreError;
use crate::types::{CertificateHashData, EncodingFormat, HashAlgorithm};

/// Where a certificate was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateSource {
    File,
    Directory,
    String,
}

#[derive(Clone)]
pub struct Certificate {
    x509: X509Handle,
    /// Seconds until not-before; negative values are in the past.
    valid_in: i64,
    /// Seconds until not-after; negative values mean expired.
    valid_to: i64,
    /// File this certificate resides in, when loaded from disk.
    file: Option<PathBuf>,
}

impl Certificate {
    /// Parses exactly one certificate from raw data.
    pub fn parse(data: &[u8], encoding: EncodingFormat) -> Result<Self, CertStoreError> {
        let mut loaded = Crypto::load_certificates(data, encoding)?;
        if loaded.len() != 1 {
            return Err(CertStoreError::CertificateLoad(format!(
                "expected a single certificate, loaded: {}",
                loaded.len()
            )));
        }

        Ok(Self::from_handle(loaded.remove(0)))
    }

    /// Parses exactly one certificate from a file, recording the path.
    pub fn parse_file(file: &Path, encoding: EncodingFormat) -> Result<Self, CertStoreError> {
        if !file.is_file() {
            return Err(CertStoreError::CertificateLoad(format!(
                "not a regular file: {}",
                file.display()
            )));
        }

        let data = std::fs::read(file).map_err(|e| CertStoreError::io(file, e))?;
        let mut certificate = Self::parse(&data, encoding)?;
        certificate.file = Some(file.to_path_buf());
        Ok(certificate)
    }

    pub fn from_handle(x509: X509Handle) -> Self {
        let (valid_in, valid_to) = Crypto::x509_get_validity(&x509);
        Certificate {
            x509,
            valid_in,
            valid_to,
            file: None,
        }
    }

    pub fn from_handle_with_file(x509: X509Handle, file: PathBuf) -> Self {
        let mut certificate = Self::from_handle(x509);
        certificate.file = Some(file);
        certificate
    }

    pub fn handle(&self) -> &X509Handle {
        &self.x509
    }

    pub fn get_file(&self) -> Option<&PathBuf> {
        self.file.as_ref()
    }

    /// Reassigns the originating file, used when a certificate is placed into
    /// a directory bundle before export.
    pub fn set_file(&mut self, path: PathBuf) {
        self.file = Some(path);
    }

    pub fn source(&self) -> CertificateSource {
        if self.file.is_some() {
            CertificateSource::File
        } else {
            CertificateSource::String
        }
    }

    pub fn valid_in(&self) -> i64 {
        self.valid_in
    }

    pub fn valid_to(&self) -> i64 {
        self.valid_to
    }

    /// Within the validity window: not-before reached and not expired.
    pub fn is_valid(&self) -> bool {
        self.valid_in <= 0 && self.valid_to >= 0
    }

    /// Becomes valid in the future and is not expired.
    pub fn is_valid_in_future(&self) -> bool {
        self.valid_in > 0 && self.valid_to > 0
    }

    pub fn is_expired(&self) -> bool {
        self.valid_to < 0
    }

    pub fn common_name(&self) -> String {
        Crypto::x509_get_common_name(&self.x509)
    }

    /// OCSP responder URL; empty when the certificate carries none.
    pub fn responder_url(&self) -> String {
        Crypto::x509_get_responder_url(&self.x509)
    }

    pub fn serial_number(&self) -> String {
        Crypto::x509_get_serial_number(&self.x509)
    }

    pub fn issuer_name_hash(&self) -> String {
        Crypto::x509_get_issuer_name_hash(&self.x509)
    }

    pub fn key_hash(&self) -> String {
        Crypto::x509_get_key_hash(&self.x509)
    }

    pub fn is_selfsigned(&self) -> bool {
        Crypto::x509_is_selfsigned(&self.x509)
    }

    /// True when this certificate was issued by `parent`. A certificate is
    /// never its own child; use [`Certificate::is_selfsigned`] for that.
    pub fn is_child(&self, parent: &Certificate) -> bool {
        if std::ptr::eq(self, parent) {
            return false;
        }

        Crypto::x509_is_child(&self.x509, &parent.x509)
    }

    pub fn key_usage_flags(&self) -> Vec<CertificateKeyUsageFlags> {
        Crypto::x509_get_key_usage_flags(&self.x509)
    }

    /// Hash data of a self-signed certificate: both hashes derive from itself.
    pub fn hash_data(&self) -> CertificateHashData {
        CertificateHashData {
            hash_algorithm: HashAlgorithm::Sha256,
            issuer_name_hash: self.issuer_name_hash(),
            issuer_key_hash: self.issuer_key_hash(),
            serial_number: self.serial_number(),
        }
    }

    /// Hash data of an issued certificate: the issuer key hash is computed
    /// over the issuer's public key, so the issuer must actually have signed
    /// this certificate.
    pub fn hash_data_with_issuer(
        &self,
        issuer: &Certificate,
    ) -> Result<CertificateHashData, CertStoreError> {
        if !self.is_child(issuer) {
            return Err(CertStoreError::InvalidState(
                "the specified issuer is not the issuer of this certificate".to_string(),
            ));
        }

        Ok(CertificateHashData {
            hash_algorithm: HashAlgorithm::Sha256,
            issuer_name_hash: self.issuer_name_hash(),
            issuer_key_hash: issuer.key_hash(),
            serial_number: self.serial_number(),
        })
    }

    fn issuer_key_hash(&self) -> String {
        // Only meaningful on a self-signed certificate, where the issuer key
        // is our own key. Issued certificates go through hash_data_with_issuer.
        self.key_hash()
    }

    /// PEM export form of this certificate.
    pub fn export_string(&self) -> String {
        Crypto::x509_to_pem(&self.x509)
    }

    /// Compares against hash data computed from this certificate alone.
    pub fn matches_hash(&self, hash: &CertificateHashData) -> bool {
        self.issuer_name_hash() == hash.issuer_name_hash
            && self.key_hash() == hash.issuer_key_hash
            && self.serial_number() == hash.serial_number
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        Crypto::x509_is_equal(&self.x509, &other.x509)
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("common_name", &self.common_name())
            .field("serial", &self.serial_number())
            .field("valid_in", &self.valid_in)
            .field("valid_to", &self.valid_to)
            .field("file", &self.file)
            .finish()
    }
}
