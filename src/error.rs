use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the certificate parsing and bundle layers.
///
/// None of these cross the [`EvseSecurity`](crate::store::EvseSecurity)
/// boundary; the store collapses them into the public status enums.
#[derive(Debug, Error)]
pub enum CertStoreError {
    /// Data could not be parsed into the expected number of certificates.
    #[error("certificate load error: {0}")]
    CertificateLoad(String),

    /// A PEM block did not match the single-block structure.
    #[error("malformed PEM: {0}")]
    MalformedPem(String),

    /// A private key file could not be read or parsed.
    #[error("no private key: {0}")]
    NoPrivateKey(String),

    /// No certificate matching a private key could be located.
    #[error("no valid certificate: {0}")]
    NoCertificateValid(String),

    /// The requested operation is not supported for the bundle source.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An internal invariant was broken. Treated as a programmer error.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CertStoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CertStoreError::Io {
            path: path.into(),
            source,
        }
    }
}
