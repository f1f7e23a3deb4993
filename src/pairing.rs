//! Pairing of private keys with certificates by trial decryption.
//!
//! Keys and certificates are stored in separate directories without a shared
//! index; the association is recovered by checking each key against the
//! certificate's public key. A stem match between the certificate and key
//! file names is tried first to avoid walking the whole directory.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::bundle::CertificateBundle;
use crate::certificate::Certificate;
use crate::crypto::{Crypto, CryptoSupplier, KeyValidationResult};
use crate::error::CertStoreError;
use crate::types::{CUSTOM_KEY_EXTENSION, EncodingFormat, KEY_EXTENSION, PEM_EXTENSION};

pub fn is_keyfile(file_path: &Path) -> bool {
    file_path.is_file()
        && matches!(
            file_path.extension().and_then(|e| e.to_str()),
            Some(KEY_EXTENSION) | Some(CUSTOM_KEY_EXTENSION)
        )
}

fn key_matches(certificate: &Certificate, key_path: &Path, password: Option<&str>) -> bool {
    match fs::read(key_path) {
        Ok(key_bytes) => {
            Crypto::x509_check_private_key(certificate.handle(), &key_bytes, password)
                == KeyValidationResult::Valid
        }
        Err(e) => {
            debug!("Could not load private key at {}: {}", key_path.display(), e);
            false
        }
    }
}

/// Searches `key_directory` for the private key belonging to `certificate`.
/// `None` is a legitimate outcome, not an error.
pub fn get_private_key_path_of_certificate(
    certificate: &Certificate,
    key_directory: &Path,
    password: Option<&str>,
) -> Option<PathBuf> {
    // Fast path: a key file sharing the certificate's file stem
    if let Some(certificate_file) = certificate.get_file() {
        for extension in [KEY_EXTENSION, CUSTOM_KEY_EXTENSION] {
            let mut potential_keyfile = certificate_file.clone();
            potential_keyfile.set_extension(extension);

            if potential_keyfile.exists() && key_matches(certificate, &potential_keyfile, password)
            {
                debug!(
                    "Key found for certificate ({}) at path: {}",
                    certificate.common_name(),
                    potential_keyfile.display()
                );
                return Some(potential_keyfile);
            }
        }
    }

    let mut pending = vec![key_directory.to_path_buf()];
    while let Some(directory) = pending.pop() {
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Could not iterate key directory {}: {}", directory.display(), e);
                continue;
            }
        };

        for entry in entries.flatten() {
            let entry_path = entry.path();

            if entry_path.is_dir() {
                pending.push(entry_path);
                continue;
            }

            if is_keyfile(&entry_path) && key_matches(certificate, &entry_path, password) {
                debug!(
                    "Key found for certificate ({}) at path: {}",
                    certificate.common_name(),
                    entry_path.display()
                );
                return Some(entry_path);
            }
        }
    }

    error!(
        "Could not find private key for certificate {} ({}) in key path: {}",
        certificate
            .get_file()
            .map(|f| f.display().to_string())
            .unwrap_or_else(|| "N/A".to_string()),
        certificate.common_name(),
        key_directory.display()
    );

    None
}

/// Searches `certificate_directory` for bundles containing a certificate that
/// matches the private key at `key`. A single leaf file and a chain file can
/// both match, so a set of paths is returned.
pub fn get_certificate_path_of_key(
    key: &Path,
    certificate_directory: &Path,
    password: Option<&str>,
) -> Result<BTreeSet<PathBuf>, CertStoreError> {
    let key_bytes = fs::read(key).map_err(|_| {
        CertStoreError::NoPrivateKey(format!(
            "could not read private key from path: {}",
            key.display()
        ))
    })?;

    let collect_matches = |bundle: &CertificateBundle| -> BTreeSet<PathBuf> {
        let mut bundles = BTreeSet::new();

        bundle.for_each_chain(|chain_path, certificates| {
            for certificate in certificates {
                if Crypto::x509_check_private_key(certificate.handle(), &key_bytes, password)
                    == KeyValidationResult::Valid
                {
                    bundles.insert(chain_path.to_path_buf());
                }
            }
            true
        });

        bundles
    };

    // Fast path: the certificate sharing the key's file stem
    let mut stem_certificate = key.to_path_buf();
    stem_certificate.set_extension(PEM_EXTENSION);

    if stem_certificate.exists() {
        match CertificateBundle::from_path(&stem_certificate, EncodingFormat::Pem) {
            Ok(bundle) => {
                let matches = collect_matches(&bundle);
                if !matches.is_empty() {
                    return Ok(matches);
                }
            }
            Err(e) => {
                debug!(
                    "Could not load certificate bundle at {}: {}",
                    stem_certificate.display(),
                    e
                );
            }
        }
    }

    match CertificateBundle::from_path(certificate_directory, EncodingFormat::Pem) {
        Ok(bundle) => {
            let matches = collect_matches(&bundle);
            if !matches.is_empty() {
                return Ok(matches);
            }
        }
        Err(e) => {
            debug!(
                "Could not load certificate bundle at {}: {}",
                certificate_directory.display(),
                e
            );
        }
    }

    Err(CertStoreError::NoCertificateValid(format!(
        "could not find certificate for private key {} in certificates path {}",
        key.display(),
        certificate_directory.display()
    )))
}
