//! OCSP sidecar layout: for a certificate stored at `…/X.pem`, cached OCSP
//! artifacts live in `…/ocsp/` as pairs of `<stem>.hash` (the certificate
//! hash identity, line per field) and `<stem>.der` (the response bytes).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::certificate::Certificate;
use crate::fs_utils;
use crate::types::{CertificateHashData, DER_EXTENSION};

/// OCSP directory for a certificate file: the sibling `ocsp` directory.
pub fn ocsp_directory_of_file(certificate_file: &Path) -> PathBuf {
    certificate_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
        .join("ocsp")
}

/// Locates the cached OCSP entry matching `hash` next to the certificate's
/// file. Returns the `(<stem>.hash, <stem>.der)` pair when both exist.
pub fn find_ocsp_data(
    certificate: &Certificate,
    hash: &CertificateHashData,
) -> Option<(PathBuf, PathBuf)> {
    let certificate_file = certificate.get_file()?;
    let ocsp_path = ocsp_directory_of_file(certificate_file);

    if !ocsp_path.exists() {
        return None;
    }

    let entries = match fs::read_dir(&ocsp_path) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Could not iterate over ocsp cache {}: {}", ocsp_path.display(), e);
            return None;
        }
    };

    for entry in entries.flatten() {
        let hash_path = entry.path();
        if !hash_path.is_file() {
            continue;
        }

        let Some(read_hash) = fs_utils::read_hash_from_file(&hash_path) else {
            continue;
        };

        if read_hash != *hash {
            continue;
        }

        debug!(
            "OCSP certificate hash found for certificate: {}",
            certificate.common_name()
        );

        let mut data_path = hash_path.clone();
        data_path.set_extension(DER_EXTENSION);

        if !data_path.exists() {
            error!(
                "OCSP certificate hash found at {} but no data named {} present",
                hash_path.display(),
                data_path.display()
            );
            return None;
        }

        return Some((hash_path, data_path));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::Certificate;
    use crate::test_support::{make_root, pem_of};
    use crate::types::EncodingFormat;

    fn certificate_on_disk(dir: &Path) -> Certificate {
        let (root, _) = make_root("Ocsp Root");
        let path = dir.join("root.pem");
        fs::write(&path, pem_of(&root)).unwrap();
        Certificate::parse_file(&path, EncodingFormat::Pem).unwrap()
    }

    #[test]
    fn missing_ocsp_directory_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let certificate = certificate_on_disk(dir.path());
        assert!(find_ocsp_data(&certificate, &certificate.hash_data()).is_none());
    }

    #[test]
    fn finds_matching_hash_and_der_pair() {
        let dir = tempfile::tempdir().unwrap();
        let certificate = certificate_on_disk(dir.path());
        let hash = certificate.hash_data();

        let ocsp_dir = dir.path().join("ocsp");
        fs::create_dir(&ocsp_dir).unwrap();
        assert!(fs_utils::write_hash_to_file(&ocsp_dir.join("entry.hash"), &hash));
        fs::write(ocsp_dir.join("entry.der"), [1u8, 2, 3]).unwrap();

        let (hash_path, der_path) = find_ocsp_data(&certificate, &hash).unwrap();
        assert_eq!(hash_path, ocsp_dir.join("entry.hash"));
        assert_eq!(der_path, ocsp_dir.join("entry.der"));
    }

    #[test]
    fn hash_without_der_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let certificate = certificate_on_disk(dir.path());
        let hash = certificate.hash_data();

        let ocsp_dir = dir.path().join("ocsp");
        fs::create_dir(&ocsp_dir).unwrap();
        assert!(fs_utils::write_hash_to_file(&ocsp_dir.join("entry.hash"), &hash));

        assert!(find_ocsp_data(&certificate, &hash).is_none());
    }

    #[test]
    fn non_matching_hash_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let certificate = certificate_on_disk(dir.path());

        let ocsp_dir = dir.path().join("ocsp");
        fs::create_dir(&ocsp_dir).unwrap();

        let mut other = certificate.hash_data();
        other.serial_number = "deadbeef".to_string();
        assert!(fs_utils::write_hash_to_file(&ocsp_dir.join("entry.hash"), &other));
        fs::write(ocsp_dir.join("entry.der"), [0u8]).unwrap();

        assert!(find_ocsp_data(&certificate, &certificate.hash_data()).is_none());
    }
}
