//! EVSE certificate and key management store.
//!
//! This library maintains the trust material of an EVSE (Electric Vehicle
//! Supply Equipment) controller: four classes of CA trust anchors (V2G,
//! Mobility Operator, CSMS, Manufacturer), leaf certificates with their
//! private keys for CSMS client authentication and ISO 15118 SECC
//! communication, and a cached store of OCSP responses. It is consumed by the
//! OCPP and ISO 15118 protocol layers.
//!
//! # Overview
//!
//! ```text
//! OCPP / ISO 15118
//!       |
//!       v
//! EvseSecurity (one mutex, all operations)
//!       |
//!       +-- CertificateBundle ---- file / directory / in-memory chain view
//!       +-- CertificateHierarchy - parent/child forest reconstruction
//!       +-- pairing -------------- key <-> certificate trial decryption
//!       +-- ocsp ----------------- <certdir>/ocsp sidecar cache
//!       +-- Crypto (seam) -------- OpenSSL-backed provider
//! ```
//!
//! Certificates live on the filesystem as PEM files: CA bundles either as one
//! file holding several certificates or as a directory with one file per
//! root; leaf certificates as `<TYPE>_LEAF_<random>.pem` single files plus
//! `CPO_CERT_<TYPE>_LEAF_CHAIN_<random>.pem` full chains. A periodic garbage
//! collector reaps expired leaf chains beyond a protected minimum, private
//! keys of certificate signing requests that never got an answer, and OCSP
//! data whose certificate is gone.
//!
//! # Example
//!
//! ```no_run
//! use evse_certstore::{EvseSecurity, StoreConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = StoreConfig::from_file("certstore.toml")?;
//! let security = EvseSecurity::from_config(config)?;
//!
//! let result = security.install_ca_certificate(
//!     "-----BEGIN CERTIFICATE-----...",
//!     evse_certstore::CaCertificateType::V2g,
//! );
//! println!("install: {:?}", result);
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod certificate;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs_utils;
pub mod hierarchy;
pub mod ocsp;
pub mod openssl_supplier;
pub mod pairing;
pub mod pem;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use bundle::{BundleSource, CertificateBundle};
pub use certificate::Certificate;
pub use config::{DirectoryPaths, FilePaths, LinkPaths, SecurityLimits, StoreConfig};
pub use error::CertStoreError;
pub use hierarchy::CertificateHierarchy;
pub use pem::fix_pem_string;
pub use store::EvseSecurity;
pub use types::{
    CaCertificateType, CertificateHashData, CertificateHashDataChain, CertificateInfo,
    CertificateOcsp, CertificateQueryParams, CertificateType, CertificateValidationResult,
    DeleteCertificateResult, DeleteResult, EncodingFormat, GetCertificateFullInfoResult,
    GetCertificateInfoResult, GetCertificateInfoStatus, GetCertificateSignRequestResult,
    GetCertificateSignRequestStatus, GetInstalledCertificatesResult,
    GetInstalledCertificatesStatus, HashAlgorithm, InstallCertificateResult,
    LeafCertificateType, OcspRequestData, OcspRequestDataList,
};
