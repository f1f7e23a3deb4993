//! Uniform view over a collection of certificates backed by a single PEM
//! file, a directory of PEM/DER files, or an in-memory string.
//!
//! Internally a map of chain path to the ordered certificates parsed from that
//! file; for a string source the key is the empty path. All mutations are in
//! memory until [`CertificateBundle::export`] writes them back.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::certificate::Certificate;
use crate::crypto::{Crypto, CryptoSupplier};
use crate::error::CertStoreError;
use crate::fs_utils;
use crate::hierarchy::CertificateHierarchy;
use crate::types::{CertificateHashData, EncodingFormat, DER_EXTENSION, PEM_EXTENSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleSource {
    String,
    File,
    Directory,
}

pub struct CertificateBundle {
    /// Maps each chain file to the certificates parsed from it. String
    /// sources use a single entry keyed by the empty path.
    certificates: BTreeMap<PathBuf, Vec<Certificate>>,
    path: PathBuf,
    source: BundleSource,
    /// Lazily built, dropped on every mutation.
    hierarchy: Option<CertificateHierarchy>,
}

impl CertificateBundle {
    /// Parses an in-memory certificate (chain). Export operations are invalid
    /// for this source.
    pub fn from_data(data: &[u8], encoding: EncodingFormat) -> Result<Self, CertStoreError> {
        let mut bundle = CertificateBundle {
            certificates: BTreeMap::new(),
            path: PathBuf::new(),
            source: BundleSource::String,
            hierarchy: None,
        };
        bundle.add_certificates(data, encoding, None)?;
        Ok(bundle)
    }

    /// Opens a bundle file or a directory of certificate files, creating the
    /// location when it does not exist yet.
    pub fn from_path(path: &Path, encoding: EncodingFormat) -> Result<Self, CertStoreError> {
        fs_utils::create_file_or_dir_if_nonexistent(path)
            .map_err(|e| CertStoreError::CertificateLoad(e.to_string()))?;

        let mut bundle = CertificateBundle {
            certificates: BTreeMap::new(),
            path: path.to_path_buf(),
            source: BundleSource::File,
            hierarchy: None,
        };

        if path.is_dir() {
            bundle.source = BundleSource::Directory;

            // Top level only: the ocsp sub-directory holds response blobs,
            // not certificates
            let entries = fs::read_dir(path).map_err(|e| CertStoreError::io(path, e))?;
            for entry in entries.flatten() {
                let entry_path = entry.path();
                if !Self::is_certificate_file(&entry_path) {
                    continue;
                }

                match fs::read(&entry_path) {
                    Ok(data) => {
                        if let Err(e) = bundle.add_certificates(&data, encoding, Some(&entry_path))
                        {
                            warn!(
                                "Skipping unparsable certificate file {}: {}",
                                entry_path.display(),
                                e
                            );
                        }
                    }
                    Err(e) => {
                        warn!("Could not read certificate file {}: {}", entry_path.display(), e);
                    }
                }
            }
        } else if Self::is_certificate_file(path) {
            let data = fs::read(path).map_err(|e| CertStoreError::io(path, e))?;
            bundle.add_certificates(&data, encoding, Some(path))?;
        } else {
            return Err(CertStoreError::CertificateLoad(format!(
                "failed to create certificate bundle from path: {}",
                path.display()
            )));
        }

        Ok(bundle)
    }

    pub fn is_certificate_file(file: &Path) -> bool {
        file.is_file()
            && matches!(
                file.extension().and_then(|e| e.to_str()),
                Some(PEM_EXTENSION) | Some(DER_EXTENSION)
            )
    }

    fn add_certificates(
        &mut self,
        data: &[u8],
        encoding: EncodingFormat,
        path: Option<&Path>,
    ) -> Result<(), CertStoreError> {
        let loaded = Crypto::load_certificates(data, encoding)?;

        let key = path.map(Path::to_path_buf).unwrap_or_default();
        let list = self.certificates.entry(key).or_default();

        for handle in loaded {
            let certificate = match path {
                Some(path) => Certificate::from_handle_with_file(handle, path.to_path_buf()),
                None => Certificate::from_handle(handle),
            };
            list.push(certificate);
        }

        Ok(())
    }

    pub fn source(&self) -> BundleSource {
        self.source
    }

    pub fn is_using_bundle_file(&self) -> bool {
        self.source == BundleSource::File
    }

    pub fn is_using_directory(&self) -> bool {
        self.source == BundleSource::Directory
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    /// True when no certificates are held. An existing but empty bundle file
    /// still produces a chain entry, so the certificate count is what counts.
    pub fn is_empty(&self) -> bool {
        self.get_certificate_count() == 0
    }

    pub fn get_certificate_count(&self) -> usize {
        self.certificates.values().map(Vec::len).sum()
    }

    pub fn get_certificate_chains_count(&self) -> usize {
        self.certificates.len()
    }

    /// Flattens all chains into a single list of certificates.
    pub fn split(&self) -> Vec<Certificate> {
        self.certificates.values().flatten().cloned().collect()
    }

    /// Iterates all `(chain path, certificates)` entries while the visitor
    /// returns true.
    pub fn for_each_chain(&self, mut visit: impl FnMut(&Path, &[Certificate]) -> bool) {
        for (path, chain) in &self.certificates {
            if !visit(path, chain) {
                break;
            }
        }
    }

    /// Same as [`CertificateBundle::for_each_chain`] with the chains visited
    /// in the order induced by `compare`.
    pub fn for_each_chain_ordered(
        &self,
        mut visit: impl FnMut(&Path, &[Certificate]) -> bool,
        compare: impl Fn(&[Certificate], &[Certificate]) -> Ordering,
    ) {
        let mut ordered: Vec<(&PathBuf, &Vec<Certificate>)> = self.certificates.iter().collect();
        ordered.sort_by(|a, b| compare(a.1, b.1));

        for (path, chain) in ordered {
            if !visit(path, chain) {
                break;
            }
        }
    }

    pub fn contains_certificate(&self, certificate: &Certificate) -> bool {
        self.certificates
            .values()
            .flatten()
            .any(|existing| existing == certificate)
    }

    /// Hash lookup. Roots answer from their own hash data; everything else
    /// requires the hierarchy to resolve the issuer.
    pub fn contains_certificate_hash(&mut self, hash: &CertificateHashData) -> bool {
        for chain in self.certificates.values() {
            for certificate in chain {
                if certificate.is_selfsigned() && certificate.matches_hash(hash) {
                    return true;
                }
            }
        }

        self.hierarchy().contains_certificate_hash(hash, true)
    }

    pub fn find_certificate(
        &mut self,
        hash: &CertificateHashData,
        case_insensitive: bool,
    ) -> Option<Certificate> {
        for chain in self.certificates.values() {
            for certificate in chain {
                if !certificate.is_selfsigned() {
                    continue;
                }

                let matches = if case_insensitive {
                    certificate.hash_data().case_insensitive_eq(hash)
                } else {
                    certificate.matches_hash(hash)
                };

                if matches {
                    return Some(certificate.clone());
                }
            }
        }

        self.hierarchy().find_certificate(hash, case_insensitive)
    }

    /// Adds a certificate in memory. Directory bundles require the new
    /// certificate's file path to lie under the bundle directory.
    pub fn add_certificate(&mut self, certificate: Certificate) -> Result<(), CertStoreError> {
        match self.source {
            BundleSource::Directory => {
                let certificate_path = certificate
                    .get_file()
                    .cloned()
                    .unwrap_or_default();

                if !fs_utils::is_subdirectory(&self.path, &certificate_path) {
                    return Err(CertStoreError::InvalidOperation(format!(
                        "added certificate must be within the bundle directory: {}",
                        self.path.display()
                    )));
                }

                self.certificates
                    .entry(certificate_path)
                    .or_default()
                    .push(certificate);
            }
            BundleSource::File | BundleSource::String => {
                let key = self.path.clone();
                self.certificates.entry(key).or_default().push(certificate);
            }
        }

        self.invalidate_hierarchy();
        Ok(())
    }

    /// Adds only when an equal certificate is not already contained.
    pub fn add_certificate_unique(
        &mut self,
        certificate: Certificate,
    ) -> Result<(), CertStoreError> {
        if self.contains_certificate(&certificate) {
            return Ok(());
        }
        self.add_certificate(certificate)
    }

    /// Replaces an equal certificate in place. Returns false when no match
    /// exists.
    pub fn update_certificate(&mut self, certificate: Certificate) -> bool {
        for chain in self.certificates.values_mut() {
            for existing in chain.iter_mut() {
                if *existing == certificate {
                    *existing = certificate;
                    self.hierarchy = None;
                    return true;
                }
            }
        }

        false
    }

    /// Deletes all instances of the certificate, and of its descendants when
    /// `include_issued` is set. Returns what was deleted.
    pub fn delete_certificate(
        &mut self,
        certificate: &Certificate,
        include_issued: bool,
    ) -> Vec<Certificate> {
        let mut to_delete = Vec::new();

        if include_issued {
            to_delete = self.hierarchy().collect_descendants(certificate);
        }
        to_delete.push(certificate.clone());

        let mut deleted = Vec::new();
        for chain in self.certificates.values_mut() {
            chain.retain(|existing| {
                let found = to_delete.contains(existing);
                if found {
                    deleted.push(existing.clone());
                }
                !found
            });
        }

        if !deleted.is_empty() {
            self.invalidate_hierarchy();
        }

        deleted
    }

    /// Deletes by hash, resolving the certificate through the hierarchy.
    pub fn delete_certificate_by_hash(
        &mut self,
        hash: &CertificateHashData,
        include_issued: bool,
        case_insensitive: bool,
    ) -> Vec<Certificate> {
        match self.hierarchy().find_certificate(hash, case_insensitive) {
            Some(certificate) => self.delete_certificate(&certificate, include_issued),
            None => Vec::new(),
        }
    }

    pub fn delete_all_certificates(&mut self) {
        self.certificates.clear();
        self.invalidate_hierarchy();
    }

    /// Concatenated PEM of every contained certificate, chain order preserved.
    pub fn to_export_string(&self) -> String {
        self.certificates
            .values()
            .flatten()
            .map(Certificate::export_string)
            .collect()
    }

    /// Concatenated PEM of a single chain, empty when the chain is unknown.
    pub fn chain_export_string(&self, chain: &Path) -> String {
        self.certificates
            .get(chain)
            .map(|certificates| {
                certificates
                    .iter()
                    .map(Certificate::export_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Writes the in-memory state back to disk.
    ///
    /// File source: atomically overwrites the bundle file (delete when empty).
    /// Directory source: removes on-disk files missing from memory, deletes
    /// files of emptied chains, rewrites every non-empty chain, then purges
    /// empty chains from the map.
    pub fn export(&mut self) -> Result<(), CertStoreError> {
        match self.source {
            BundleSource::String => Err(CertStoreError::InvalidOperation(
                "export for a string sourced bundle is invalid".to_string(),
            )),
            BundleSource::File => self.export_file(),
            BundleSource::Directory => self.export_directory(),
        }
    }

    fn export_file(&mut self) -> Result<(), CertStoreError> {
        if self.get_certificate_count() == 0 {
            self.certificates.clear();
            if self.path.exists() && !fs_utils::delete_file(&self.path) {
                return Err(CertStoreError::InvalidOperation(format!(
                    "could not delete emptied bundle file: {}",
                    self.path.display()
                )));
            }
            return Ok(());
        }

        // Write to a separate file then rename, to minimise corruption on
        // interrupted writes
        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push("$");
        let temp_path = PathBuf::from(temp_path);

        if temp_path.exists() {
            fs_utils::delete_file(&temp_path);
        }

        fs::write(&temp_path, self.to_export_string())
            .map_err(|e| CertStoreError::io(&temp_path, e))?;

        fs::rename(&temp_path, &self.path).map_err(|e| CertStoreError::io(&self.path, e))?;
        Ok(())
    }

    fn export_directory(&mut self) -> Result<(), CertStoreError> {
        let mut success = true;

        // Delete on-disk certificate files that are no longer represented
        let disk_state = CertificateBundle::from_path(&self.path, EncodingFormat::Pem)?;
        for (disk_path, _) in &disk_state.certificates {
            if !self.certificates.contains_key(disk_path) && !fs_utils::delete_file(disk_path) {
                success = false;
            }
        }

        for (chain_path, chain) in &self.certificates {
            if chain.is_empty() {
                if chain_path.exists() && !fs_utils::delete_file(chain_path) {
                    success = false;
                }
                continue;
            }

            if let Err(e) =
                fs_utils::write_to_file(chain_path, &self.chain_export_string(chain_path))
            {
                error!("Could not write certificate chain {}: {}", chain_path.display(), e);
                success = false;
            }
        }

        // Emptied chains are gone from disk now, drop them from memory too
        self.certificates.retain(|_, chain| !chain.is_empty());

        if success {
            Ok(())
        } else {
            Err(CertStoreError::InvalidOperation(format!(
                "sync to certificate store failed for: {}",
                self.path.display()
            )))
        }
    }

    /// The contained valid certificate whose validity started most recently.
    pub fn get_latest_valid_certificate(&self) -> Result<Certificate, CertStoreError> {
        Self::latest_valid_certificate(&self.split())
    }

    pub fn latest_valid_certificate(
        certificates: &[Certificate],
    ) -> Result<Certificate, CertStoreError> {
        certificates
            .iter()
            .filter(|certificate| certificate.is_valid())
            .max_by_key(|certificate| certificate.valid_in())
            .cloned()
            .ok_or_else(|| {
                CertStoreError::NoCertificateValid("no valid certificates available".to_string())
            })
    }

    fn invalidate_hierarchy(&mut self) {
        self.hierarchy = None;
    }

    /// The certificate hierarchy of this bundle, rebuilt lazily after
    /// mutations.
    pub fn hierarchy(&mut self) -> &CertificateHierarchy {
        if self.hierarchy.is_none() {
            debug!("Building new certificate hierarchy");
            let certificates = self.split();
            self.hierarchy = Some(CertificateHierarchy::build(certificates));
        }

        self.hierarchy.get_or_insert_with(CertificateHierarchy::default)
    }
}
