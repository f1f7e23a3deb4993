//! The certificate store façade consumed by the OCPP and ISO 15118 layers.
//!
//! [`EvseSecurity`] owns the filesystem locations of the four trust-anchor
//! bundles, the leaf certificate/key directories and the TLS symlinks. Every
//! public operation acquires one coarse mutex for its full duration; the
//! periodic garbage collector runs through the same lock. Internal helpers
//! operate on the locked context and presume the lock is held.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::bundle::CertificateBundle;
use crate::certificate::Certificate;
use crate::config::{
    DirectoryPaths, FilePaths, LinkPaths, SecurityLimits, StoreConfig,
    DEFAULT_MINIMUM_CERTIFICATE_ENTRIES,
};
use crate::crypto::{
    CertificateSignRequestResult, CertificateSigningRequestInfo, Crypto, CryptoKeyType,
    CryptoSupplier, KeyGenerationInfo,
};
use crate::error::CertStoreError;
use crate::fs_utils;
use crate::hierarchy::CertificateHierarchy;
use crate::ocsp;
use crate::pairing;
use crate::types::*;

/// Optional subject-alternative-name fields baked in at compile time.
const CSR_DNS_NAME: Option<&str> = option_env!("CSR_DNS_NAME");
const CSR_IP_ADDRESS: Option<&str> = option_env!("CSR_IP_ADDRESS");

fn to_install_certificate_result(result: CertificateValidationResult) -> InstallCertificateResult {
    match result {
        CertificateValidationResult::Valid => {
            info!("Certificate accepted");
            InstallCertificateResult::Accepted
        }
        CertificateValidationResult::Expired => {
            warn!("Certificate has expired");
            InstallCertificateResult::Expired
        }
        CertificateValidationResult::InvalidSignature => {
            warn!("Invalid signature");
            InstallCertificateResult::InvalidSignature
        }
        CertificateValidationResult::InvalidChain => {
            warn!("Invalid certificate chain");
            InstallCertificateResult::InvalidCertificateChain
        }
        CertificateValidationResult::InvalidLeafSignature => {
            warn!("Unable to verify leaf signature");
            InstallCertificateResult::InvalidSignature
        }
        CertificateValidationResult::IssuerNotFound => {
            warn!("Issuer not found");
            InstallCertificateResult::NoRootCertificateInstalled
        }
        CertificateValidationResult::Unknown => InstallCertificateResult::InvalidFormat,
    }
}

fn ca_certificate_types(certificate_types: &[CertificateType]) -> Vec<CaCertificateType> {
    let mut ca_types = Vec::new();
    for certificate_type in certificate_types {
        match certificate_type {
            CertificateType::V2gRootCertificate => ca_types.push(CaCertificateType::V2g),
            CertificateType::MoRootCertificate => ca_types.push(CaCertificateType::Mo),
            CertificateType::CsmsRootCertificate => ca_types.push(CaCertificateType::Csms),
            CertificateType::MfRootCertificate => ca_types.push(CaCertificateType::Mf),
            CertificateType::V2gCertificateChain => {}
        }
    }
    ca_types
}

struct StoreContext {
    ca_bundle_path_map: BTreeMap<CaCertificateType, PathBuf>,
    directories: DirectoryPaths,
    links: LinkPaths,

    /// CSR keys awaiting a signed certificate, by first-seen time. In-memory
    /// only: after a restart the GC re-observes unpaired keys, so reaping is
    /// delayed across restarts, never lost.
    managed_csr: HashMap<PathBuf, Instant>,

    max_fs_usage_bytes: u64,
    max_fs_certificate_store_entries: u64,
    csr_expiry: Duration,

    private_key_password: Option<String>,
}

/// Certificate and key management store for one EVSE controller.
pub struct EvseSecurity {
    context: Arc<Mutex<StoreContext>>,
    gc_timer: Option<GcTimer>,
}

impl EvseSecurity {
    /// Initializes the store over the given filesystem layout, creating
    /// missing leaf directories and CA bundle files. Rejects configurations
    /// where a leaf directory coincides with a CA bundle path, since garbage
    /// collection could then reap trust anchors.
    pub fn new(
        paths: FilePaths,
        private_key_password: Option<String>,
        limits: SecurityLimits,
    ) -> Result<Self> {
        let leaf_dirs = [
            paths.directories.csms_leaf_cert_directory.clone(),
            paths.directories.csms_leaf_key_directory.clone(),
            paths.directories.secc_leaf_cert_directory.clone(),
            paths.directories.secc_leaf_key_directory.clone(),
        ];

        for dir in &leaf_dirs {
            if !dir.exists() {
                warn!(
                    "Could not find configured leaf directory at: {}, creating default dir!",
                    dir.display()
                );
                fs::create_dir_all(dir)?;
            } else if !dir.is_dir() {
                anyhow::bail!("{} is not a directory", dir.display());
            }
        }

        let mut ca_bundle_path_map = BTreeMap::new();
        ca_bundle_path_map.insert(CaCertificateType::Csms, paths.csms_ca_bundle);
        ca_bundle_path_map.insert(CaCertificateType::Mf, paths.mf_ca_bundle);
        ca_bundle_path_map.insert(CaCertificateType::Mo, paths.mo_ca_bundle);
        ca_bundle_path_map.insert(CaCertificateType::V2g, paths.v2g_ca_bundle);

        for (certificate_type, bundle_path) in &ca_bundle_path_map {
            if !bundle_path.exists() {
                warn!(
                    "Could not find configured {} bundle file at: {}, creating default!",
                    certificate_type,
                    bundle_path.display()
                );
                if let Err(e) = fs_utils::create_file_or_dir_if_nonexistent(bundle_path) {
                    error!(
                        "Could not create default bundle for path {}: {}",
                        bundle_path.display(),
                        e
                    );
                }
            }
        }

        for leaf_dir in &leaf_dirs {
            for bundle_path in ca_bundle_path_map.values() {
                if bundle_path == leaf_dir {
                    anyhow::bail!(
                        "{} leaf directory can not overlap CA directory: {}",
                        leaf_dir.display(),
                        bundle_path.display()
                    );
                }
            }
        }

        let context = Arc::new(Mutex::new(StoreContext {
            ca_bundle_path_map,
            directories: paths.directories,
            links: paths.links,
            managed_csr: HashMap::new(),
            max_fs_usage_bytes: limits.max_fs_usage_bytes,
            max_fs_certificate_store_entries: limits.max_fs_certificate_store_entries,
            csr_expiry: limits.csr_expiry(),
            private_key_password,
        }));

        let gc_timer = GcTimer::start(Arc::downgrade(&context), limits.garbage_collect_time());

        Ok(EvseSecurity {
            context,
            gc_timer: Some(gc_timer),
        })
    }

    pub fn from_config(config: StoreConfig) -> Result<Self> {
        Self::new(config.paths, config.private_key_password, config.limits)
    }

    fn lock(&self) -> MutexGuard<'_, StoreContext> {
        match self.context.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Installs a CA certificate into the bundle for its type. An already
    /// installed certificate is updated in place.
    pub fn install_ca_certificate(
        &self,
        certificate_pem: &str,
        certificate_type: CaCertificateType,
    ) -> InstallCertificateResult {
        let mut context = self.lock();

        info!("Installing ca certificate: {}", certificate_type);

        if context.is_filesystem_full() {
            error!("Filesystem full, can't install new CA certificate!");
            return InstallCertificateResult::CertificateStoreMaxLengthExceeded;
        }

        context.install_ca_certificate_internal(certificate_pem, certificate_type)
    }

    /// Deletes the certificate with the given hash from the CA bundles or,
    /// failing that, from the leaf directories including the whole chain
    /// files, private key and OCSP sidecar entries.
    pub fn delete_certificate(&self, certificate_hash_data: &CertificateHashData) -> DeleteResult {
        let mut context = self.lock();
        context.delete_certificate_internal(certificate_hash_data)
    }

    /// Verifies a received chain and installs the leaf (plus the full chain
    /// file when intermediates are present) into the leaf directory.
    pub fn update_leaf_certificate(
        &self,
        chain_pem: &str,
        certificate_type: LeafCertificateType,
    ) -> InstallCertificateResult {
        let mut context = self.lock();

        if context.is_filesystem_full() {
            error!("Filesystem full, can't install new leaf certificate!");
            return InstallCertificateResult::CertificateStoreMaxLengthExceeded;
        }

        context.update_leaf_certificate_internal(chain_pem, certificate_type)
    }

    /// Verifies a chain against the union of the trust anchors installed for
    /// the given leaf types.
    pub fn verify_certificate(
        &self,
        chain_pem: &str,
        certificate_types: &[LeafCertificateType],
    ) -> CertificateValidationResult {
        let mut context = self.lock();
        context.verify_certificate_internal(chain_pem, certificate_types)
    }

    pub fn get_installed_certificate(
        &self,
        certificate_type: CertificateType,
    ) -> GetInstalledCertificatesResult {
        self.get_installed_certificates(&[certificate_type])
    }

    /// Hash-data chains of all certificates installed for the requested
    /// types.
    pub fn get_installed_certificates(
        &self,
        certificate_types: &[CertificateType],
    ) -> GetInstalledCertificatesResult {
        let mut context = self.lock();
        context.get_installed_certificates_internal(certificate_types)
    }

    pub fn get_count_of_installed_certificates(
        &self,
        certificate_types: &[CertificateType],
    ) -> usize {
        let context = self.lock();
        context.count_installed_certificates_internal(certificate_types)
    }

    /// OCSP request data for the stored V2G leaf chains.
    pub fn get_v2g_ocsp_request_data(&self) -> OcspRequestDataList {
        let mut context = self.lock();
        context.get_v2g_ocsp_request_data_internal()
    }

    /// OCSP request data for a received contract certificate chain, matched
    /// against both the V2G and MO trust anchors.
    pub fn get_mo_ocsp_request_data(&self, chain_pem: &str) -> OcspRequestDataList {
        let context = self.lock();

        match CertificateBundle::from_data(chain_pem.as_bytes(), EncodingFormat::Pem) {
            Ok(chain) => generate_ocsp_request_data(
                &context.ca_bundle_path_map,
                &[CaCertificateType::V2g, CaCertificateType::Mo],
                chain.split(),
            ),
            Err(e) => {
                error!("Could not load mo ocsp cache leaf chain: {}", e);
                OcspRequestDataList::default()
            }
        }
    }

    /// Caches an OCSP response next to the certificate it belongs to.
    pub fn update_ocsp_cache(&self, certificate_hash_data: &CertificateHashData, response: &[u8]) {
        let context = self.lock();
        context.update_ocsp_cache_internal(certificate_hash_data, response);
    }

    /// Path of the cached OCSP response for the certificate, if any.
    pub fn retrieve_ocsp_cache(
        &self,
        certificate_hash_data: &CertificateHashData,
    ) -> Option<PathBuf> {
        let context = self.lock();
        context.retrieve_ocsp_cache_internal(certificate_hash_data)
    }

    /// True when a currently valid self-signed root is installed for the
    /// type.
    pub fn is_ca_certificate_installed(&self, certificate_type: CaCertificateType) -> bool {
        let context = self.lock();
        context.is_ca_certificate_installed_internal(certificate_type)
    }

    /// Generates a CSR for the given leaf type. The generated private key is
    /// placed in the leaf key directory and tracked until the signed
    /// certificate arrives or the CSR expires.
    pub fn generate_certificate_signing_request(
        &self,
        certificate_type: LeafCertificateType,
        country: &str,
        organization: &str,
        common_name: &str,
        use_custom_provider: bool,
    ) -> GetCertificateSignRequestResult {
        let mut context = self.lock();
        context.generate_csr_internal(
            certificate_type,
            country,
            organization,
            common_name,
            use_custom_provider,
        )
    }

    /// Newest valid leaf key-pair record for the type.
    pub fn get_leaf_certificate_info(
        &self,
        certificate_type: LeafCertificateType,
        encoding: EncodingFormat,
        include_ocsp: bool,
    ) -> GetCertificateInfoResult {
        let mut context = self.lock();
        context.get_leaf_certificate_info_internal(certificate_type, encoding, include_ocsp)
    }

    /// Newest valid leaf per distinct root, newest first. Needed because a
    /// query parameter is not available during the TLS handshake.
    pub fn get_all_valid_certificates_info(
        &self,
        certificate_type: LeafCertificateType,
        encoding: EncodingFormat,
        include_ocsp: bool,
    ) -> GetCertificateFullInfoResult {
        let mut context = self.lock();

        let mut params = CertificateQueryParams::new(certificate_type);
        params.encoding = encoding;
        params.include_ocsp = include_ocsp;
        params.include_root = true;
        params.include_all_valid = true;
        params.remove_duplicates = true;

        let result = context.get_full_leaf_certificate_info_internal(&params);
        if result.status != GetCertificateInfoStatus::Accepted {
            return result;
        }

        // Keep only the newest leaf per distinct root; the engine returns
        // them newest first
        let mut unique_roots = BTreeSet::new();
        let mut filtered = GetCertificateFullInfoResult {
            status: result.status,
            info: Vec::new(),
        };

        for chain in result.info {
            let Some(root) = chain.certificate_root.clone() else {
                continue;
            };

            if unique_roots.insert(root) {
                filtered.info.push(chain);
            }
        }

        filtered
    }

    /// Refreshes the V2G leaf symlinks to the currently selected key-pair
    /// record; removes them when no valid leaf exists. Returns whether any
    /// link changed.
    pub fn update_certificate_links(
        &self,
        certificate_type: LeafCertificateType,
    ) -> Result<bool, CertStoreError> {
        if certificate_type != LeafCertificateType::V2g {
            return Err(CertStoreError::InvalidOperation(
                "link updating only supported for V2G certificates".to_string(),
            ));
        }

        let mut context = self.lock();
        Ok(context.update_certificate_links_internal())
    }

    /// File usable by a TLS stack as a trust store for the type, or empty.
    pub fn get_verify_file(&self, certificate_type: CaCertificateType) -> String {
        let mut context = self.lock();

        let result = context.get_ca_certificate_info_internal(certificate_type);
        if result.status == GetCertificateInfoStatus::Accepted {
            if let Some(info) = result.info {
                if let Some(certificate) = info.certificate {
                    return certificate.display().to_string();
                }
            }
        }

        String::new()
    }

    /// File or directory usable by a TLS stack as the trust location. For a
    /// directory the rehash symlinks must be producible, otherwise empty is
    /// returned.
    pub fn get_verify_location(&self, certificate_type: CaCertificateType) -> String {
        let context = self.lock();

        let Some(bundle_path) = context.ca_bundle_path_map.get(&certificate_type) else {
            return String::new();
        };

        match CertificateBundle::from_path(bundle_path, EncodingFormat::Pem) {
            Ok(bundle) => {
                info!(
                    "Requesting certificate location: [{}] location: {}",
                    certificate_type,
                    bundle.get_path().display()
                );

                if !bundle.is_empty()
                    && (!bundle.is_using_directory() || Crypto::hash_dir(bundle.get_path()))
                {
                    return bundle.get_path().display().to_string();
                }
            }
            Err(e) => {
                error!(
                    "Could not obtain verify location, wrong format for certificate {}: {}",
                    bundle_path.display(),
                    e
                );
            }
        }

        error!("Could not find any CA certificate for: {}", certificate_type);
        String::new()
    }

    /// Bundle or root file information for a CA type, with error handling.
    pub fn get_ca_certificate_info(
        &self,
        certificate_type: CaCertificateType,
    ) -> GetCertificateInfoResult {
        let mut context = self.lock();
        context.get_ca_certificate_info_internal(certificate_type)
    }

    /// Days until the selected leaf expires, 0 when unavailable.
    pub fn get_leaf_expiry_days_count(&self, certificate_type: LeafCertificateType) -> i64 {
        let mut context = self.lock();

        info!("Requesting certificate expiry: {}", certificate_type);

        let result = context.get_leaf_certificate_info_internal(
            certificate_type,
            EncodingFormat::Pem,
            false,
        );
        if result.status != GetCertificateInfoStatus::Accepted {
            return 0;
        }

        let Some(info) = result.info else {
            return 0;
        };
        let Some(certificate_path) = info.certificate.or(info.certificate_single) else {
            return 0;
        };

        // In case it is a chain file the leaf is always the first entry
        match CertificateBundle::from_path(&certificate_path, EncodingFormat::Pem) {
            Ok(bundle) => match bundle.split().first() {
                Some(leaf) => leaf.valid_to() / 86400,
                None => 0,
            },
            Err(e) => {
                error!("Could not obtain leaf expiry certificate: {}", e);
                0
            }
        }
    }

    /// Collects expired leaf chains beyond the protected minimum, quarantines
    /// unpaired CSR keys and reaps dangling OCSP entries. Runs only when the
    /// filesystem quota is exceeded.
    pub fn garbage_collect(&self) {
        let mut context = self.lock();
        context.garbage_collect_internal();
    }

    /// Verifies a detached signature over the file at `path` with the given
    /// signing certificate.
    pub fn verify_file_signature(
        path: &Path,
        signing_certificate_pem: &str,
        signature_base64: &str,
    ) -> bool {
        info!("Verifying file signature for {}", path.display());

        let Some(digest) = Crypto::digest_sha256_file(path) else {
            error!("Error during digesting file: {}", path.display());
            return false;
        };

        let Some(signature) = Crypto::base64_decode_to_bytes(signature_base64) else {
            error!("Error during decoding signature: {}", signature_base64);
            return false;
        };

        match Certificate::parse(signing_certificate_pem.as_bytes(), EncodingFormat::Pem) {
            Ok(certificate) => {
                Crypto::x509_verify_signature(certificate.handle(), &signature, &digest)
            }
            Err(e) => {
                error!("Could not parse signing certificate: {}", e);
                false
            }
        }
    }

    pub fn base64_decode_to_bytes(data: &str) -> Vec<u8> {
        Crypto::base64_decode_to_bytes(data).unwrap_or_default()
    }

    pub fn base64_decode_to_string(data: &str) -> String {
        Crypto::base64_decode_to_string(data).unwrap_or_default()
    }

    pub fn base64_encode_from_bytes(bytes: &[u8]) -> String {
        Crypto::base64_encode_from_bytes(bytes).unwrap_or_default()
    }

    pub fn base64_encode_from_string(data: &str) -> String {
        Crypto::base64_encode_from_string(data).unwrap_or_default()
    }
}

impl StoreContext {
    fn leaf_directories(
        &self,
        certificate_type: LeafCertificateType,
    ) -> Option<(PathBuf, PathBuf, CaCertificateType)> {
        match certificate_type {
            LeafCertificateType::Csms => Some((
                self.directories.csms_leaf_cert_directory.clone(),
                self.directories.csms_leaf_key_directory.clone(),
                CaCertificateType::Csms,
            )),
            LeafCertificateType::V2g => Some((
                self.directories.secc_leaf_cert_directory.clone(),
                self.directories.secc_leaf_key_directory.clone(),
                CaCertificateType::V2g,
            )),
            _ => None,
        }
    }

    fn install_ca_certificate_internal(
        &mut self,
        certificate_pem: &str,
        certificate_type: CaCertificateType,
    ) -> InstallCertificateResult {
        let mut new_certificate =
            match Certificate::parse(certificate_pem.as_bytes(), EncodingFormat::Pem) {
                Ok(certificate) => certificate,
                Err(e) => {
                    error!("Certificate load error: {}", e);
                    return InstallCertificateResult::InvalidFormat;
                }
            };

        if !new_certificate.is_valid() {
            return InstallCertificateResult::Expired;
        }

        let Some(bundle_path) = self.ca_bundle_path_map.get(&certificate_type).cloned() else {
            return InstallCertificateResult::WriteError;
        };

        if !bundle_path.is_dir() {
            if let Err(e) = fs_utils::create_file_if_nonexistent(&bundle_path) {
                error!("Could not create CA bundle file: {}", e);
                return InstallCertificateResult::WriteError;
            }
        }

        let mut existing = match CertificateBundle::from_path(&bundle_path, EncodingFormat::Pem) {
            Ok(existing) => existing,
            Err(e) => {
                error!("Certificate load error: {}", e);
                return InstallCertificateResult::InvalidFormat;
            }
        };

        if existing.is_using_directory() {
            let filename = format!(
                "{}_ROOT_{}",
                certificate_type,
                fs_utils::get_random_file_name(&format!(".{}", PEM_EXTENSION))
            );
            new_certificate.set_file(bundle_path.join(filename));
        }

        if !existing.contains_certificate(&new_certificate) {
            if existing.add_certificate(new_certificate).is_err() {
                return InstallCertificateResult::WriteError;
            }
        } else if !existing.update_certificate(new_certificate) {
            return InstallCertificateResult::WriteError;
        }

        match existing.export() {
            Ok(()) => InstallCertificateResult::Accepted,
            Err(e) => {
                error!("Could not export certificate bundle: {}", e);
                InstallCertificateResult::WriteError
            }
        }
    }

    fn delete_certificate_internal(
        &mut self,
        certificate_hash_data: &CertificateHashData,
    ) -> DeleteResult {
        info!("Deleting certificate: {}", certificate_hash_data.serial_number);

        let mut response = DeleteResult {
            result: DeleteCertificateResult::NotFound,
            ca_certificate_type: None,
            leaf_certificate_type: None,
        };

        let mut found_certificate = false;
        let mut failed_to_write = false;
        let mut deleted_root_certificate = false;
        let mut deleted_roots: Vec<Certificate> = Vec::new();

        for (certificate_type, bundle_path) in self.ca_bundle_path_map.clone() {
            let mut ca_bundle = match CertificateBundle::from_path(&bundle_path, EncodingFormat::Pem)
            {
                Ok(bundle) => bundle,
                Err(_) => {
                    warn!("Could not load ca bundle from file: {}", bundle_path.display());
                    continue;
                }
            };

            let deleted = ca_bundle.delete_certificate_by_hash(certificate_hash_data, true, true);
            if deleted.is_empty() {
                continue;
            }

            found_certificate = true;
            response.ca_certificate_type = Some(certificate_type);

            match ca_bundle.export() {
                Ok(()) => {
                    deleted_roots.extend(deleted);
                    deleted_root_certificate = true;
                }
                Err(_) => failed_to_write = true,
            }
        }

        if deleted_root_certificate {
            // Leaves issued by a deleted root are deliberately kept; removing
            // the trust anchor is the policy action requested here
            if failed_to_write {
                error!("Could not delete CA root certificate!");
                response.result = DeleteCertificateResult::Failed;
            } else {
                info!("Deleted CA root certificate successfully!");
                response.result = DeleteCertificateResult::Accepted;
            }
            return response;
        }

        for leaf_certificate_type in [LeafCertificateType::V2g, LeafCertificateType::Csms] {
            let Some((leaf_cert_dir, leaf_key_dir, root_type)) =
                self.leaf_directories(leaf_certificate_type)
            else {
                continue;
            };

            let is_csms = leaf_certificate_type == LeafCertificateType::Csms
                || self.directories.csms_leaf_cert_directory
                    == self.directories.secc_leaf_cert_directory;

            let mut leaf_bundle =
                match CertificateBundle::from_path(&leaf_cert_dir, EncodingFormat::Pem) {
                    Ok(bundle) => bundle,
                    Err(_) => {
                        error!("Could not load leaf directory: {}", leaf_cert_dir.display());
                        continue;
                    }
                };

            // Deleted roots (none here) would be the hierarchy base; use the
            // installed root bundle
            let base_roots = match self.ca_bundle_path_map.get(&root_type) {
                Some(root_path) => match CertificateBundle::from_path(root_path, EncodingFormat::Pem)
                {
                    Ok(bundle) => bundle.split(),
                    Err(_) => {
                        warn!("Could not load base roots: {}", root_path.display());
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };

            let hierarchy = CertificateHierarchy::build_merged(base_roots, leaf_bundle.split());
            let leafs_to_delete = hierarchy.find_certificates_multi(certificate_hash_data);
            if leafs_to_delete.is_empty() {
                continue;
            }

            let password = self.private_key_password.clone();

            leaf_bundle.for_each_chain(|chain_path, chain| {
                let delete_whole_chain = chain
                    .iter()
                    .any(|certificate| leafs_to_delete.contains(certificate));
                if !delete_whole_chain {
                    return true;
                }

                let mut deleted_full_file = false;
                for deleted_leaf in chain {
                    found_certificate = true;
                    response.leaf_certificate_type = Some(leaf_certificate_type);

                    if is_csms {
                        // The charging station certificate may not be deleted
                        // on its own; only removing its root takes it down
                        failed_to_write = true;
                        error!(
                            "Error, not allowed to delete ChargingStationCertificate: {}",
                            deleted_leaf.common_name()
                        );
                        continue;
                    }

                    // Delete the chain file once; several chain members point
                    // at the same file
                    if !deleted_full_file {
                        if fs_utils::delete_file(chain_path) {
                            deleted_full_file = true;
                        } else {
                            failed_to_write = true;
                            error!(
                                "Error removing leaf chain file: {}",
                                deleted_leaf.common_name()
                            );
                        }
                    }

                    if failed_to_write {
                        continue;
                    }

                    if let Some(key_path) = pairing::get_private_key_path_of_certificate(
                        deleted_leaf,
                        &leaf_key_dir,
                        password.as_deref(),
                    ) {
                        info!(
                            "Deleted key of leaf certificate: {}",
                            deleted_leaf.common_name()
                        );
                        fs_utils::delete_file(&key_path);
                    }

                    // Only the leaf's own OCSP entry goes; intermediates can
                    // serve other chains
                    if let Some((hash_path, data_path)) =
                        ocsp::find_ocsp_data(deleted_leaf, certificate_hash_data)
                    {
                        info!(
                            "Deleted ocsp data of certificate: {}",
                            deleted_leaf.common_name()
                        );
                        fs_utils::delete_file(&hash_path);
                        fs_utils::delete_file(&data_path);
                    }
                }

                true
            });
        }

        if !found_certificate {
            response.result = DeleteCertificateResult::NotFound;
        } else if failed_to_write {
            response.result = DeleteCertificateResult::Failed;
        } else {
            response.result = DeleteCertificateResult::Accepted;
        }

        response
    }

    fn update_leaf_certificate_internal(
        &mut self,
        chain_pem: &str,
        certificate_type: LeafCertificateType,
    ) -> InstallCertificateResult {
        info!("Updating leaf certificate: {}", certificate_type);

        let Some((cert_dir, key_dir, _)) = self.leaf_directories(certificate_type) else {
            error!("Attempt to update leaf certificate for non CSMS/V2G certificate!");
            return InstallCertificateResult::WriteError;
        };

        let chain_bundle = match CertificateBundle::from_data(
            chain_pem.as_bytes(),
            EncodingFormat::Pem,
        ) {
            Ok(bundle) => bundle,
            Err(_) => {
                warn!("Could not load update leaf certificate because of invalid format");
                return InstallCertificateResult::InvalidFormat;
            }
        };

        let certificate_chain = chain_bundle.split();
        if certificate_chain.is_empty() {
            return InstallCertificateResult::InvalidFormat;
        }

        let validation = self.verify_certificate_internal(chain_pem, &[certificate_type]);
        if validation != CertificateValidationResult::Valid {
            return to_install_certificate_result(validation);
        }

        // The first certificate in the chain is the leaf
        let leaf_certificate = &certificate_chain[0];

        let Some(private_key_path) = pairing::get_private_key_path_of_certificate(
            leaf_certificate,
            &key_dir,
            self.private_key_password.as_deref(),
        ) else {
            warn!("Provided certificate does not belong to any private key");
            return InstallCertificateResult::WriteError;
        };

        let extra_filename = fs_utils::get_random_file_name(&format!(".{}", PEM_EXTENSION));
        let file_name = format!("{}{}", certificate_type.filename_prefix(), extra_filename);
        let file_path = cert_dir.join(file_name);

        if let Err(e) = fs_utils::write_to_file(&file_path, &leaf_certificate.export_string()) {
            error!("Could not write leaf certificate: {}", e);
            return InstallCertificateResult::WriteError;
        }

        // The CSR is fulfilled; its key is paired now and must not be reaped
        self.managed_csr.remove(&private_key_path);

        if certificate_chain.len() > 1 {
            let chain_file_name = format!(
                "CPO_CERT_{}CHAIN_{}",
                certificate_type.filename_prefix(),
                extra_filename
            );
            let chain_file_path = cert_dir.join(chain_file_name);

            if let Err(e) =
                fs_utils::write_to_file(&chain_file_path, &chain_bundle.to_export_string())
            {
                // The contained SUBCAs are required for a connection
                error!("Could not write leaf certificate chain to file: {}", e);
                return InstallCertificateResult::WriteError;
            }
        }

        InstallCertificateResult::Accepted
    }

    fn verify_certificate_internal(
        &mut self,
        chain_pem: &str,
        certificate_types: &[LeafCertificateType],
    ) -> CertificateValidationResult {
        info!("Verifying leaf certificate");

        let mut ca_types = BTreeSet::new();
        for certificate_type in certificate_types {
            match certificate_type {
                LeafCertificateType::Csms => ca_types.insert(CaCertificateType::Csms),
                LeafCertificateType::V2g => ca_types.insert(CaCertificateType::V2g),
                LeafCertificateType::Mf => ca_types.insert(CaCertificateType::Mf),
                LeafCertificateType::Mo => ca_types.insert(CaCertificateType::Mo),
            };
        }

        if ca_types.is_empty() {
            warn!("No valid CA certificate types could be determined from leaf types");
            return CertificateValidationResult::IssuerNotFound;
        }

        let chain_bundle = match CertificateBundle::from_data(
            chain_pem.as_bytes(),
            EncodingFormat::Pem,
        ) {
            Ok(bundle) => bundle,
            Err(_) => {
                warn!("Could not validate certificate chain because of invalid format");
                return CertificateValidationResult::Unknown;
            }
        };

        let certificate_chain = chain_bundle.split();
        let Some(leaf_certificate) = certificate_chain.first() else {
            return CertificateValidationResult::Unknown;
        };

        // Everything after the leaf is an untrusted intermediate; stray roots
        // in the received chain are ignored
        let mut untrusted_intermediates = Vec::new();
        for certificate in certificate_chain.iter().skip(1) {
            if certificate.is_selfsigned() {
                warn!("Ignore root certificate: {}", certificate.common_name());
            } else {
                untrusted_intermediates.push(certificate.handle().clone());
            }
        }

        let mut trusted_anchors = Vec::new();
        for ca_type in ca_types {
            if !self.is_ca_certificate_installed_internal(ca_type) {
                continue;
            }

            let Some(root_store) = self.ca_bundle_path_map.get(&ca_type) else {
                continue;
            };

            // The roots are loaded manually rather than through a store
            // lookup path, which would require rehash-style file naming
            match CertificateBundle::from_path(root_store, EncodingFormat::Pem) {
                Ok(roots) => {
                    for root in roots.split() {
                        trusted_anchors.push(root.handle().clone());
                    }
                }
                Err(e) => {
                    warn!("Could not load trust anchors from {}: {}", root_store.display(), e);
                }
            }
        }

        if trusted_anchors.is_empty() {
            return CertificateValidationResult::IssuerNotFound;
        }

        Crypto::x509_verify_certificate_chain(
            leaf_certificate.handle(),
            &trusted_anchors,
            &untrusted_intermediates,
            true,
        )
    }

    fn get_installed_certificates_internal(
        &mut self,
        certificate_types: &[CertificateType],
    ) -> GetInstalledCertificatesResult {
        let mut certificate_chains: Vec<CertificateHashDataChain> = Vec::new();

        for ca_certificate_type in ca_certificate_types(certificate_types) {
            let Some(bundle_path) = self.ca_bundle_path_map.get(&ca_certificate_type).cloned()
            else {
                continue;
            };

            let mut ca_bundle = match CertificateBundle::from_path(&bundle_path, EncodingFormat::Pem)
            {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!(
                        "Could not load CA bundle file at: {} error: {}",
                        bundle_path.display(),
                        e
                    );
                    continue;
                }
            };

            let hierarchy = ca_bundle.hierarchy();
            debug!("Hierarchy ({}):\n{}", ca_certificate_type, hierarchy.to_debug_string());

            for root in hierarchy.get_hierarchy() {
                if !root.state.is_selfsigned {
                    continue;
                }

                let Some(root_hash) = root.hash.clone() else {
                    continue;
                };

                let mut chain = CertificateHashDataChain {
                    certificate_type: ca_certificate_type.into(),
                    certificate_hash_data: root_hash,
                    child_certificate_hash_data: Vec::new(),
                };

                CertificateHierarchy::for_each_descendant(root, 0, &mut |child, _| {
                    if let Some(hash) = &child.hash {
                        chain.child_certificate_hash_data.push(hash.clone());
                    }
                });

                certificate_chains.push(chain);
            }
        }

        if certificate_types.contains(&CertificateType::V2gCertificateChain) {
            let mut params = CertificateQueryParams::new(LeafCertificateType::V2g);
            params.include_all_valid = true;
            params.remove_duplicates = true;

            let secc_key_pairs = self.get_full_leaf_certificate_info_internal(&params);
            if secc_key_pairs.status == GetCertificateInfoStatus::Accepted {
                for secc_key_pair in &secc_key_pairs.info {
                    let Some(certificate_path) = secc_key_pair
                        .certificate
                        .clone()
                        .or_else(|| secc_key_pair.certificate_single.clone())
                    else {
                        error!("Leaf certificate single/bundle not present!");
                        continue;
                    };

                    self.collect_v2g_chain_hashes(&certificate_path, &mut certificate_chains);
                }
            }
        }

        let status = if certificate_chains.is_empty() {
            GetInstalledCertificatesStatus::NotFound
        } else {
            GetInstalledCertificatesStatus::Accepted
        };

        GetInstalledCertificatesResult {
            status,
            certificate_hash_data_chain: certificate_chains,
        }
    }

    /// Merges the leaf chain file with the V2G trust bundle and emits
    /// leaf-first hash chains for each resulting tree.
    fn collect_v2g_chain_hashes(
        &mut self,
        certificate_path: &Path,
        certificate_chains: &mut Vec<CertificateHashDataChain>,
    ) {
        let Some(ca_bundle_path) = self.ca_bundle_path_map.get(&CaCertificateType::V2g).cloned()
        else {
            return;
        };

        let leaf_bundle = match CertificateBundle::from_path(certificate_path, EncodingFormat::Pem)
        {
            Ok(bundle) => bundle,
            Err(e) => {
                error!("Could not load installed leaf certificates: {}", e);
                return;
            }
        };

        let mut ca_bundle = match CertificateBundle::from_path(&ca_bundle_path, EncodingFormat::Pem)
        {
            Ok(bundle) => bundle,
            Err(e) => {
                error!("Could not load installed leaf certificates: {}", e);
                return;
            }
        };

        // Unify both sets so the hierarchy covers root, sub-CAs and leaf
        for certificate in leaf_bundle.split() {
            if ca_bundle.add_certificate_unique(certificate).is_err() {
                return;
            }
        }

        let hierarchy = ca_bundle.hierarchy();
        debug!("Hierarchy (V2GCertificateChain):\n{}", hierarchy.to_debug_string());

        for root in hierarchy.get_hierarchy() {
            // Descendant order is root-down; the reported chain is leaf-first
            let mut hierarchy_hash_data = Vec::new();
            CertificateHierarchy::for_each_descendant(root, 0, &mut |child, _| {
                if let Some(hash) = &child.hash {
                    hierarchy_hash_data.push(hash.clone());
                }
            });

            if hierarchy_hash_data.is_empty() {
                continue;
            }

            let mut chain = CertificateHashDataChain {
                certificate_type: CertificateType::V2gCertificateChain,
                certificate_hash_data: CertificateHashData {
                    hash_algorithm: HashAlgorithm::Sha256,
                    issuer_name_hash: String::new(),
                    issuer_key_hash: String::new(),
                    serial_number: String::new(),
                },
                child_certificate_hash_data: Vec::new(),
            };

            let mut first_leaf = true;
            for hash in hierarchy_hash_data.into_iter().rev() {
                if first_leaf {
                    chain.certificate_hash_data = hash;
                    first_leaf = false;
                } else {
                    chain.child_certificate_hash_data.push(hash);
                }
            }

            certificate_chains.push(chain);
        }
    }

    fn count_installed_certificates_internal(
        &self,
        certificate_types: &[CertificateType],
    ) -> usize {
        let mut count = 0;

        let mut unique_directories = BTreeSet::new();
        for ca_certificate_type in ca_certificate_types(certificate_types) {
            if let Some(path) = self.ca_bundle_path_map.get(&ca_certificate_type) {
                unique_directories.insert(path.clone());
            }
        }

        for unique_dir in unique_directories {
            match CertificateBundle::from_path(&unique_dir, EncodingFormat::Pem) {
                Ok(bundle) => count += bundle.get_certificate_count(),
                Err(e) => error!("Could not load bundle for certificate count: {}", e),
            }
        }

        if certificate_types.contains(&CertificateType::V2gCertificateChain) {
            // All leaf chains count, including expired and unused ones
            let leaf_dir = &self.directories.secc_leaf_cert_directory;
            match CertificateBundle::from_path(leaf_dir, EncodingFormat::Pem) {
                Ok(bundle) => count += bundle.get_certificate_count(),
                Err(e) => error!("Could not load bundle for certificate count: {}", e),
            }
        }

        count
    }

    fn get_v2g_ocsp_request_data_internal(&mut self) -> OcspRequestDataList {
        let mut params = CertificateQueryParams::new(LeafCertificateType::V2g);
        params.include_all_valid = true;
        params.include_future_valid = true;
        params.remove_duplicates = true;

        let result = self.get_full_leaf_certificate_info_internal(&params);
        if result.status != GetCertificateInfoStatus::Accepted || result.info.is_empty() {
            error!("Could not get key pair, for v2g ocsp request!");
            return OcspRequestDataList::default();
        }

        let mut full_list = OcspRequestDataList::default();

        for secc_key_pair in &result.info {
            let Some(chain_path) = secc_key_pair
                .certificate
                .clone()
                .or_else(|| secc_key_pair.certificate_single.clone())
            else {
                error!("Could not load v2g ocsp cache leaf chain!");
                continue;
            };

            let chain_data = match fs_utils::read_from_file(&chain_path) {
                Ok(data) => data,
                Err(e) => {
                    error!("Could not load v2g ocsp cache leaf chain: {}", e);
                    continue;
                }
            };

            let leaf_chain = match CertificateBundle::from_data(
                chain_data.as_bytes(),
                EncodingFormat::Pem,
            ) {
                Ok(bundle) => bundle.split(),
                Err(_) => Vec::new(),
            };

            if leaf_chain.is_empty() {
                continue;
            }

            let partial = generate_ocsp_request_data(
                &self.ca_bundle_path_map,
                &[CaCertificateType::V2g],
                leaf_chain,
            );

            for ocsp_data in partial.ocsp_request_data_list {
                let contained = full_list.ocsp_request_data_list.iter().any(|existing| {
                    existing.certificate_hash_data == ocsp_data.certificate_hash_data
                });
                if !contained {
                    full_list.ocsp_request_data_list.push(ocsp_data);
                }
            }
        }

        full_list
    }

    fn update_ocsp_cache_internal(
        &self,
        certificate_hash_data: &CertificateHashData,
        response: &[u8],
    ) {
        info!("Updating OCSP cache");

        let Some(ca_bundle_path) = self.ca_bundle_path_map.get(&CaCertificateType::V2g) else {
            return;
        };
        let leaf_cert_dir = &self.directories.secc_leaf_cert_directory;

        let (ca_bundle, leaf_bundle) = match (
            CertificateBundle::from_path(ca_bundle_path, EncodingFormat::Pem),
            CertificateBundle::from_path(leaf_cert_dir, EncodingFormat::Pem),
        ) {
            (Ok(ca), Ok(leaf)) => (ca, leaf),
            _ => {
                error!("Could not update ocsp cache, certificate load failure");
                return;
            }
        };

        let hierarchy =
            CertificateHierarchy::build_merged(ca_bundle.split(), leaf_bundle.split());

        // A sub-CA can live in several bundles; update the cache next to each
        let certificates = hierarchy.find_certificates_multi(certificate_hash_data);
        if certificates.is_empty() {
            error!("Could not find any certificate for ocsp cache update");
            return;
        }

        for certificate in certificates {
            debug!("Writing OCSP Response to filesystem");

            let Some(certificate_file) = certificate.get_file() else {
                error!("Could not find OCSP cache patch directory!");
                continue;
            };

            let ocsp_path = ocsp::ocsp_directory_of_file(certificate_file);
            if !ocsp_path.exists() {
                if let Err(e) = fs::create_dir_all(&ocsp_path) {
                    error!("Could not create OCSP directory {}: {}", ocsp_path.display(), e);
                    continue;
                }
            }

            if let Some((_, data_path)) = ocsp::find_ocsp_data(&certificate, certificate_hash_data)
            {
                debug!("OCSP certificate hash already found, over-writing!");
                if let Err(e) = fs::write(&data_path, response) {
                    error!("Could not write OCSP certificate data: {}", e);
                }
                continue;
            }

            // Randomized stem, multiple certificates can share the bundle
            let stem = fs_utils::get_random_file_name("_ocsp");
            let data_path = ocsp_path.join(format!("{}.{}", stem, DER_EXTENSION));
            let hash_path = ocsp_path.join(format!("{}.{}", stem, CERT_HASH_EXTENSION));

            if let Err(e) = fs::write(&data_path, response) {
                error!("Could not write OCSP certificate data: {}", e);
                continue;
            }

            if !fs_utils::write_hash_to_file(&hash_path, certificate_hash_data) {
                error!("Could not write OCSP certificate hash!");
            }

            debug!(
                "OCSP certificate hash not found, written at path: {}",
                data_path.display()
            );
        }
    }

    fn retrieve_ocsp_cache_internal(
        &self,
        certificate_hash_data: &CertificateHashData,
    ) -> Option<PathBuf> {
        let ca_bundle_path = self.ca_bundle_path_map.get(&CaCertificateType::V2g)?;
        let leaf_cert_dir = &self.directories.secc_leaf_cert_directory;

        let (ca_bundle, leaf_bundle) = match (
            CertificateBundle::from_path(ca_bundle_path, EncodingFormat::Pem),
            CertificateBundle::from_path(leaf_cert_dir, EncodingFormat::Pem),
        ) {
            (Ok(ca), Ok(leaf)) => (ca, leaf),
            _ => {
                error!("Could not retrieve ocsp cache, certificate load failure");
                return None;
            }
        };

        let hierarchy =
            CertificateHierarchy::build_merged(ca_bundle.split(), leaf_bundle.split());

        let Some(certificate) = hierarchy.find_certificate(certificate_hash_data, false) else {
            error!("Could not find any certificate for ocsp cache retrieve!");
            return None;
        };

        debug!("Reading OCSP Response from filesystem");

        ocsp::find_ocsp_data(&certificate, certificate_hash_data).map(|(_, data_path)| data_path)
    }

    fn is_ca_certificate_installed_internal(&self, certificate_type: CaCertificateType) -> bool {
        let Some(bundle_path) = self.ca_bundle_path_map.get(&certificate_type) else {
            return false;
        };

        match CertificateBundle::from_path(bundle_path, EncodingFormat::Pem) {
            Ok(mut bundle) => bundle
                .hierarchy()
                .get_hierarchy()
                .iter()
                .any(|root| root.state.is_selfsigned && root.certificate.is_valid()),
            Err(_) => {
                error!("Could not load ca certificate type: {}", certificate_type);
                false
            }
        }
    }

    fn generate_csr_internal(
        &mut self,
        certificate_type: LeafCertificateType,
        country: &str,
        organization: &str,
        common_name: &str,
        use_custom_provider: bool,
    ) -> GetCertificateSignRequestResult {
        // Custom-provider keys carry a distinct extension for identification
        let key_extension = if use_custom_provider {
            CUSTOM_KEY_EXTENSION
        } else {
            KEY_EXTENSION
        };
        let file_name = format!(
            "{}{}",
            certificate_type.filename_prefix(),
            fs_utils::get_random_file_name(&format!(".{}", key_extension))
        );

        let Some((_, key_dir, _)) = self.leaf_directories(certificate_type) else {
            error!("Generate CSR for non CSMS/V2G leafs!");
            return GetCertificateSignRequestResult {
                status: GetCertificateSignRequestStatus::InvalidRequestedType,
                csr: None,
            };
        };
        let key_path = key_dir.join(file_name);

        let mut key_info = KeyGenerationInfo {
            key_type: CryptoKeyType::EcPrime256v1,
            generate_on_custom: use_custom_provider,
            public_key_file: None,
            private_key_file: Some(key_path.clone()),
            private_key_pass: None,
        };

        if !use_custom_provider {
            key_info.private_key_pass = self.private_key_password.clone();
        }

        let info = CertificateSigningRequestInfo {
            n_version: 0,
            country: country.to_string(),
            organization: organization.to_string(),
            common_name: common_name.to_string(),
            dns_name: CSR_DNS_NAME.map(str::to_string),
            ip_address: CSR_IP_ADDRESS.map(str::to_string),
            key_info,
        };

        info!("Generating CSR for leaf: {}", certificate_type);

        let (result, csr) = Crypto::x509_generate_csr(&info);

        match result {
            CertificateSignRequestResult::Valid => {
                debug!("Generated CSR end");

                // Track the key; it is reaped if no certificate pairs with it
                // within the expiry window
                self.managed_csr.insert(key_path, Instant::now());

                GetCertificateSignRequestResult {
                    status: GetCertificateSignRequestStatus::Accepted,
                    csr,
                }
            }
            CertificateSignRequestResult::KeyGenerationError => {
                error!("CSR leaf generation error: key generation");
                GetCertificateSignRequestResult {
                    status: GetCertificateSignRequestStatus::KeyGenError,
                    csr: None,
                }
            }
            other => {
                error!("CSR leaf generation error: {:?}", other);
                GetCertificateSignRequestResult {
                    status: GetCertificateSignRequestStatus::GenerationError,
                    csr: None,
                }
            }
        }
    }

    fn get_leaf_certificate_info_internal(
        &mut self,
        certificate_type: LeafCertificateType,
        encoding: EncodingFormat,
        include_ocsp: bool,
    ) -> GetCertificateInfoResult {
        let mut params = CertificateQueryParams::new(certificate_type);
        params.encoding = encoding;
        params.include_ocsp = include_ocsp;

        let mut result = self.get_full_leaf_certificate_info_internal(&params);

        GetCertificateInfoResult {
            status: result.status,
            info: if result.info.is_empty() {
                None
            } else {
                Some(result.info.remove(0))
            },
        }
    }

    fn get_full_leaf_certificate_info_internal(
        &mut self,
        params: &CertificateQueryParams,
    ) -> GetCertificateFullInfoResult {
        let certificate_type = params.certificate_type;

        info!("Requesting leaf certificate info: {}", certificate_type);

        let mut result = GetCertificateFullInfoResult {
            status: GetCertificateInfoStatus::NotFound,
            info: Vec::new(),
        };

        let Some((cert_dir, key_dir, root_type)) = self.leaf_directories(certificate_type) else {
            warn!("Rejected attempt to retrieve non CSMS/V2G key pair");
            result.status = GetCertificateInfoStatus::Rejected;
            return result;
        };

        let Some(root_dir) = self.ca_bundle_path_map.get(&root_type).cloned() else {
            result.status = GetCertificateInfoStatus::NotFound;
            return result;
        };

        let leaf_certificates =
            match CertificateBundle::from_path(&cert_dir, EncodingFormat::Pem) {
                Ok(bundle) => bundle,
                Err(_) => {
                    warn!("Leaf certificate load exception");
                    result.status = GetCertificateInfoStatus::NotFound;
                    return result;
                }
            };

        if leaf_certificates.is_empty() {
            warn!("Could not find any key pair");
            result.status = GetCertificateInfoStatus::NotFound;
            return result;
        }

        struct KeyPairInternal {
            certificate: Certificate,
            certificate_key: PathBuf,
        }

        let mut valid_leafs: Vec<KeyPairInternal> = Vec::new();
        let mut any_valid_certificate = false;
        let mut any_valid_key = false;

        let password = self.private_key_password.clone();

        // Iterate all chains from the newest to the oldest
        leaf_certificates.for_each_chain_ordered(
            |_, chain| {
                let Some(leaf) = chain.first() else {
                    return true;
                };

                let mut is_valid = leaf.is_valid();
                if params.include_future_valid {
                    is_valid |= leaf.is_valid_in_future();
                }

                if !is_valid {
                    return true;
                }
                any_valid_certificate = true;

                let Some(private_key_path) = pairing::get_private_key_path_of_certificate(
                    leaf,
                    &key_dir,
                    password.as_deref(),
                ) else {
                    return true;
                };
                any_valid_key = true;

                // A leaf can surface twice, from its single file and from its
                // chain file
                if params.remove_duplicates
                    && valid_leafs
                        .iter()
                        .any(|pair| pair.certificate == *leaf)
                {
                    return true;
                }

                valid_leafs.push(KeyPairInternal {
                    certificate: leaf.clone(),
                    certificate_key: private_key_path,
                });

                if !params.include_all_valid {
                    return false;
                }
                true
            },
            |a, b| {
                let a_to = a.first().map(Certificate::valid_to).unwrap_or(i64::MIN);
                let b_to = b.first().map(Certificate::valid_to).unwrap_or(i64::MIN);
                b_to.cmp(&a_to)
            },
        );

        if !any_valid_certificate {
            warn!("Could not find valid certificate");
            result.status = GetCertificateInfoStatus::NotFoundValid;
            return result;
        }

        if !any_valid_key {
            warn!("Could not find private key for the valid certificate");
            result.status = GetCertificateInfoStatus::PrivateKeyNotFound;
            return result;
        }

        for valid_leaf in &valid_leafs {
            let certificate = &valid_leaf.certificate;

            // Locate the full chain file and the single leaf file holding
            // this certificate
            let mut chain_file: Option<PathBuf> = None;
            let mut single_file: Option<PathBuf> = None;
            let mut full_chain: Vec<Certificate> = Vec::new();
            let mut chain_len = 1usize;

            leaf_certificates.for_each_chain(|path, chain| {
                if chain.iter().any(|entry| entry == certificate) {
                    if chain.len() > 1 {
                        chain_file = Some(path.to_path_buf());
                        full_chain = chain.to_vec();
                        chain_len = chain.len();
                    } else if chain.len() == 1 {
                        single_file = Some(path.to_path_buf());
                    }
                }

                !(chain_file.is_some() && single_file.is_some())
            });

            if chain_file.is_none() && single_file.is_none() {
                error!(
                    "Could not find any leaf certificate for: {}",
                    certificate_type
                );
                continue;
            }

            let mut certificate_ocsp: Vec<CertificateOcsp> = Vec::new();
            let mut leafs_root: Option<String> = None;

            if params.include_ocsp || params.include_root {
                let root_splits = match CertificateBundle::from_path(&root_dir, EncodingFormat::Pem)
                {
                    Ok(bundle) => bundle.split(),
                    Err(_) => Vec::new(),
                };

                let hierarchy =
                    CertificateHierarchy::build_merged(root_splits, leaf_certificates.split());
                debug!("Hierarchy for root/OCSP data:\n{}", hierarchy.to_debug_string());

                if params.include_ocsp {
                    if !full_chain.is_empty() {
                        for chain_certificate in &full_chain {
                            match hierarchy.get_certificate_hash(chain_certificate) {
                                Some(hash) => {
                                    let data = self.retrieve_ocsp_cache_internal(&hash);
                                    certificate_ocsp.push(CertificateOcsp {
                                        hash,
                                        ocsp_data: data,
                                    });
                                }
                                None => {
                                    // Entry kept to preserve the file order
                                    certificate_ocsp.push(CertificateOcsp {
                                        hash: CertificateHashData {
                                            hash_algorithm: HashAlgorithm::Sha256,
                                            issuer_name_hash: String::new(),
                                            issuer_key_hash: String::new(),
                                            serial_number: String::new(),
                                        },
                                        ocsp_data: None,
                                    });
                                }
                            }
                        }
                    } else if let Some(hash) = hierarchy.get_certificate_hash(certificate) {
                        let data = self.retrieve_ocsp_cache_internal(&hash);
                        certificate_ocsp.push(CertificateOcsp {
                            hash,
                            ocsp_data: data,
                        });
                    }
                }

                if params.include_root {
                    let chain_head = full_chain.first().unwrap_or(certificate);
                    match hierarchy.find_certificate_root(chain_head) {
                        Some(root) => leafs_root = Some(root.export_string()),
                        None => {
                            warn!(
                                "Root required for [{}] leaf certificate, but no root could be found",
                                certificate_type
                            );
                        }
                    }
                }
            }

            result.info.push(CertificateInfo {
                key: valid_leaf.certificate_key.clone(),
                certificate: chain_file,
                certificate_single: single_file,
                certificate_count: chain_len,
                password: self.private_key_password.clone(),
                ocsp: certificate_ocsp,
                certificate_root: leafs_root,
            });
            result.status = GetCertificateInfoStatus::Accepted;
        }

        result
    }

    fn get_ca_certificate_info_internal(
        &mut self,
        certificate_type: CaCertificateType,
    ) -> GetCertificateInfoResult {
        let mut result = GetCertificateInfoResult {
            status: GetCertificateInfoStatus::NotFound,
            info: None,
        };

        let Some(bundle_path) = self.ca_bundle_path_map.get(&certificate_type).cloned() else {
            return result;
        };

        match CertificateBundle::from_path(&bundle_path, EncodingFormat::Pem) {
            Ok(mut verify_file) => {
                info!(
                    "Requesting certificate file: [{}] file: {}",
                    certificate_type,
                    verify_file.get_path().display()
                );

                if verify_file.is_using_directory() {
                    // Use the first valid self-signed root file
                    let root_file = verify_file
                        .hierarchy()
                        .get_hierarchy()
                        .iter()
                        .find(|root| root.state.is_selfsigned && root.certificate.is_valid())
                        .and_then(|root| root.certificate.get_file().cloned());

                    if let Some(root_file) = root_file {
                        result.info = Some(CertificateInfo {
                            key: PathBuf::new(),
                            certificate: Some(root_file.clone()),
                            certificate_single: Some(root_file),
                            certificate_count: 1,
                            password: None,
                            ocsp: Vec::new(),
                            certificate_root: None,
                        });
                        result.status = GetCertificateInfoStatus::Accepted;
                        return result;
                    }
                } else {
                    let path = verify_file.get_path().to_path_buf();
                    result.info = Some(CertificateInfo {
                        key: PathBuf::new(),
                        certificate: Some(path.clone()),
                        certificate_single: Some(path),
                        certificate_count: verify_file.get_certificate_count(),
                        password: None,
                        ocsp: Vec::new(),
                        certificate_root: None,
                    });
                    result.status = GetCertificateInfoStatus::Accepted;
                    return result;
                }
            }
            Err(e) => {
                error!(
                    "Could not obtain verify file, wrong format for certificate {}: {}",
                    bundle_path.display(),
                    e
                );
            }
        }

        error!("Could not find any CA certificate for: {}", certificate_type);
        result
    }

    fn update_certificate_links_internal(&mut self) -> bool {
        let mut changed = false;

        let cert_link_path = self.links.secc_leaf_cert_link.clone();
        let key_link_path = self.links.secc_leaf_key_link.clone();
        let chain_link_path = self.links.cpo_cert_chain_link.clone();

        let key_pair = self.get_leaf_certificate_info_internal(
            LeafCertificateType::V2g,
            EncodingFormat::Pem,
            false,
        );

        let info = if key_pair.status == GetCertificateInfoStatus::Accepted {
            key_pair.info
        } else {
            None
        };

        match info {
            Some(info) => {
                if !cert_link_path.as_os_str().is_empty() {
                    if let Some(cert_path) = &info.certificate_single {
                        changed |= refresh_symlink(&cert_link_path, cert_path);
                    }
                }

                if !key_link_path.as_os_str().is_empty() {
                    changed |= refresh_symlink(&key_link_path, &info.key);
                }

                if let Some(chain_path) = &info.certificate {
                    if !chain_link_path.as_os_str().is_empty() {
                        changed |= refresh_symlink(&chain_link_path, chain_path);
                    }
                }
            }
            None => {
                // No valid leaf: drop stale links
                for link in [&cert_link_path, &key_link_path, &chain_link_path] {
                    if !link.as_os_str().is_empty() && link.is_symlink() {
                        if fs::remove_file(link).is_err() {
                            error!("Could not remove symlink: {}", link.display());
                        }
                        changed = true;
                    }
                }
            }
        }

        changed
    }

    /// The quota check that gates installs and garbage collection: entry
    /// count over all bundles and leaf directories, plus the byte size of the
    /// largest single file.
    fn is_filesystem_full(&self) -> bool {
        let mut unique_paths: BTreeSet<PathBuf> = BTreeSet::new();

        let mut collect = |path: &Path| {
            if path.is_file() {
                unique_paths.insert(path.to_path_buf());
            } else if path.is_dir() {
                let mut pending = vec![path.to_path_buf()];
                while let Some(dir) = pending.pop() {
                    let Ok(entries) = fs::read_dir(&dir) else {
                        continue;
                    };
                    for entry in entries.flatten() {
                        let entry_path = entry.path();
                        if entry_path.is_dir() {
                            pending.push(entry_path);
                        } else if entry_path.is_file() {
                            unique_paths.insert(entry_path);
                        }
                    }
                }
            }
        };

        for bundle_path in self.ca_bundle_path_map.values() {
            collect(bundle_path);
        }
        for directory in [
            &self.directories.csms_leaf_cert_directory,
            &self.directories.csms_leaf_key_directory,
            &self.directories.secc_leaf_cert_directory,
            &self.directories.secc_leaf_key_directory,
        ] {
            collect(directory);
        }

        let total_entries = unique_paths.len() as u64;
        debug!("Total entries used: {}", total_entries);

        if total_entries > self.max_fs_certificate_store_entries {
            warn!(
                "Exceeded maximum entries: {} with: {} total entries",
                self.max_fs_certificate_store_entries, total_entries
            );
            return true;
        }

        // Largest single file, not the sum: matches the long-standing
        // behavior the GC trigger was tuned against
        let largest_file_bytes = unique_paths
            .iter()
            .filter_map(|path| fs::metadata(path).ok())
            .map(|metadata| metadata.len())
            .max()
            .unwrap_or(0);

        debug!("Largest file bytes: {}", largest_file_bytes);
        if largest_file_bytes >= self.max_fs_usage_bytes {
            warn!("Exceeded maximum byte size: {}", largest_file_bytes);
            return true;
        }

        false
    }

    fn garbage_collect_internal(&mut self) {
        if !self.is_filesystem_full() {
            debug!("Garbage collect postponed, filesystem is not full");
            return;
        }

        info!("Starting garbage collect!");

        let leaf_paths = [
            (
                self.directories.csms_leaf_cert_directory.clone(),
                self.directories.csms_leaf_key_directory.clone(),
                CaCertificateType::Csms,
            ),
            (
                self.directories.secc_leaf_cert_directory.clone(),
                self.directories.secc_leaf_key_directory.clone(),
                CaCertificateType::V2g,
            ),
        ];

        let mut invalid_certificate_files: BTreeSet<PathBuf> = BTreeSet::new();
        // Keys of kept chains are never deleted, and stop being CSR-tracked
        let mut protected_private_keys: BTreeSet<PathBuf> = BTreeSet::new();

        let password = self.private_key_password.clone();

        for (cert_dir, key_dir, ca_type) in &leaf_paths {
            let Some(root_path) = self.ca_bundle_path_map.get(ca_type).cloned() else {
                continue;
            };

            let root_bundle = match CertificateBundle::from_path(&root_path, EncodingFormat::Pem) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("Could not load bundle from file: {}", e);
                    continue;
                }
            };

            let leaf_bundle = match CertificateBundle::from_path(cert_dir, EncodingFormat::Pem) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!("Could not load bundle from file: {}", e);
                    continue;
                }
            };

            if leaf_bundle.get_certificate_chains_count() <= DEFAULT_MINIMUM_CERTIFICATE_ENTRIES {
                continue;
            }

            let mut skipped = 0usize;

            // Keep the newest entries even when expired, as a safeguard
            // against a poorly set system clock
            leaf_bundle.for_each_chain_ordered(
                |chain_path, chain| {
                    let Some(leaf) = chain.first() else {
                        // Empty files are dropped regardless of their age
                        invalid_certificate_files.insert(chain_path.to_path_buf());
                        return true;
                    };

                    skipped += 1;
                    if skipped > DEFAULT_MINIMUM_CERTIFICATE_ENTRIES {
                        if leaf.is_expired() {
                            invalid_certificate_files.insert(chain_path.to_path_buf());

                            if let Some(key_file) = pairing::get_private_key_path_of_certificate(
                                leaf,
                                key_dir,
                                password.as_deref(),
                            ) {
                                invalid_certificate_files.insert(key_file);
                            }

                            let hierarchy = CertificateHierarchy::build_merged(
                                root_bundle.split(),
                                chain.to_vec(),
                            );

                            if let Some(ocsp_hash) = hierarchy.get_certificate_hash(leaf) {
                                if let Some((hash_path, data_path)) =
                                    ocsp::find_ocsp_data(leaf, &ocsp_hash)
                                {
                                    invalid_certificate_files.insert(hash_path);
                                    invalid_certificate_files.insert(data_path);
                                }
                            }
                        }
                    } else if let Some(key_file) = pairing::get_private_key_path_of_certificate(
                        leaf,
                        key_dir,
                        password.as_deref(),
                    ) {
                        self.managed_csr.remove(&key_file);
                        protected_private_keys.insert(key_file);
                    }

                    true
                },
                |a, b| {
                    let a_to = a.first().map(Certificate::valid_to).unwrap_or(i64::MIN);
                    let b_to = b.first().map(Certificate::valid_to).unwrap_or(i64::MIN);
                    b_to.cmp(&a_to)
                },
            );
        }

        for expired_file in &invalid_certificate_files {
            if fs_utils::delete_file(expired_file) {
                info!("Deleted expired certificate file: {}", expired_file.display());
            } else {
                warn!(
                    "Error deleting expired certificate file: {}",
                    expired_file.display()
                );
            }
        }

        // After a restart the managed CSR table is empty; unpaired keys are
        // re-observed here with a fresh timestamp so a CSR response that
        // arrives late can still be fulfilled before the key is reaped
        for (cert_dir, key_dir, _) in &leaf_paths {
            for key_file in collect_keyfiles(key_dir) {
                if protected_private_keys.contains(&key_file) {
                    continue;
                }

                let paired =
                    pairing::get_certificate_path_of_key(&key_file, cert_dir, password.as_deref());

                if let Err(e) = paired {
                    debug!(
                        "Could not find matching certificate for key: {} ({}), adding to potential deletes",
                        key_file.display(),
                        e
                    );
                    self.managed_csr.entry(key_file).or_insert_with(Instant::now);
                }
            }
        }

        // Reap CSR keys that never received their certificate
        let csr_expiry = self.csr_expiry;
        self.managed_csr.retain(|key_path, first_seen| {
            if first_seen.elapsed() > csr_expiry {
                debug!("Found expired csr key, deleting: {}", key_path.display());
                fs_utils::delete_file(key_path);
                false
            } else {
                true
            }
        });

        // Reap OCSP entries whose certificate no longer exists
        let mut invalid_ocsp_files: BTreeSet<PathBuf> = BTreeSet::new();

        for leaf_cert_dir in [
            self.directories.secc_leaf_cert_directory.clone(),
            self.directories.csms_leaf_cert_directory.clone(),
        ] {
            let is_secc = leaf_cert_dir == self.directories.secc_leaf_cert_directory;
            let ca_type = if is_secc {
                CaCertificateType::V2g
            } else {
                CaCertificateType::Csms
            };

            let Some(root_path) = self.ca_bundle_path_map.get(&ca_type).cloned() else {
                continue;
            };

            let (root_bundle, leaf_bundle) = match (
                CertificateBundle::from_path(&root_path, EncodingFormat::Pem),
                CertificateBundle::from_path(&leaf_cert_dir, EncodingFormat::Pem),
            ) {
                (Ok(root), Ok(leaf)) => (root, leaf),
                _ => {
                    warn!("Could not load ca bundle from file: {}", leaf_cert_dir.display());
                    continue;
                }
            };

            let root_ocsp = if root_bundle.is_using_bundle_file() {
                ocsp::ocsp_directory_of_file(root_bundle.get_path())
            } else {
                root_bundle.get_path().join("ocsp")
            };
            let leaf_ocsp = if leaf_bundle.is_using_bundle_file() {
                ocsp::ocsp_directory_of_file(leaf_bundle.get_path())
            } else {
                leaf_bundle.get_path().join("ocsp")
            };

            // The hierarchy is rebuilt so hashes resolve against the roots
            let hierarchy =
                CertificateHierarchy::build_merged(root_bundle.split(), leaf_bundle.split());

            for ocsp_dir in [leaf_ocsp, root_ocsp] {
                if !ocsp_dir.exists() {
                    continue;
                }
                let Ok(entries) = fs::read_dir(&ocsp_dir) else {
                    continue;
                };

                for entry in entries.flatten() {
                    let entry_path = entry.path();
                    if !entry_path.is_file() {
                        continue;
                    }

                    let Some(read_hash) = fs_utils::read_hash_from_file(&entry_path) else {
                        continue;
                    };

                    if !hierarchy.contains_certificate_hash(&read_hash, true) {
                        let mut data_path = entry_path.clone();
                        data_path.set_extension(DER_EXTENSION);

                        invalid_ocsp_files.insert(entry_path);
                        invalid_ocsp_files.insert(data_path);
                    }
                }
            }
        }

        for invalid_ocsp in &invalid_ocsp_files {
            if fs_utils::delete_file(invalid_ocsp) {
                info!("Deleted invalid ocsp file: {}", invalid_ocsp.display());
            } else {
                warn!("Error deleting invalid ocsp file: {}", invalid_ocsp.display());
            }
        }
    }
}

/// Recursively collects `.key`/`.tkey` files under a directory.
fn collect_keyfiles(directory: &Path) -> Vec<PathBuf> {
    let mut keyfiles = Vec::new();
    let mut pending = vec![directory.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let entry_path = entry.path();
            if entry_path.is_dir() {
                pending.push(entry_path);
            } else if pairing::is_keyfile(&entry_path) {
                keyfiles.push(entry_path);
            }
        }
    }

    keyfiles
}

/// Points `link` at `target`, replacing a differing symlink. Returns whether
/// anything changed.
#[cfg(unix)]
fn refresh_symlink(link: &Path, target: &Path) -> bool {
    let mut changed = false;

    if link.is_symlink() {
        let points_elsewhere = fs::read_link(link)
            .map(|current| current != target)
            .unwrap_or(true);
        if points_elsewhere {
            if fs::remove_file(link).is_err() {
                error!("Could not remove symlink: {}", link.display());
            }
            changed = true;
        }
    }

    if !link.exists() {
        debug!("Leaf link: {} -> {}", link.display(), target.display());
        if let Err(e) = std::os::unix::fs::symlink(target, link) {
            error!("Could not create symlink {}: {}", link.display(), e);
        }
        changed = true;
    }

    changed
}

#[cfg(not(unix))]
fn refresh_symlink(_link: &Path, _target: &Path) -> bool {
    false
}

/// Builds the OCSP request entries for a received leaf chain: every link of
/// the chain must hang off one valid installed root, and entries are emitted
/// leaf-first, skipping certificates without a responder URL.
fn generate_ocsp_request_data(
    ca_bundle_path_map: &BTreeMap<CaCertificateType, PathBuf>,
    possible_roots: &[CaCertificateType],
    leaf_chain: Vec<Certificate>,
) -> OcspRequestDataList {
    let mut response = OcspRequestDataList::default();

    if leaf_chain.is_empty() {
        return response;
    }

    let mut full_root_hierarchy = Vec::new();
    for root_type in possible_roots {
        let Some(root_path) = ca_bundle_path_map.get(root_type) else {
            continue;
        };

        match CertificateBundle::from_path(root_path, EncodingFormat::Pem) {
            Ok(bundle) => full_root_hierarchy.extend(bundle.split()),
            Err(e) => warn!("Could not load root bundle {}: {}", root_path.display(), e),
        }
    }

    let hierarchy = CertificateHierarchy::build_merged(full_root_hierarchy, leaf_chain.clone());

    let mut ocsp_request_data_list: Vec<OcspRequestData> = Vec::new();

    for root in hierarchy.get_hierarchy() {
        if !root.state.is_selfsigned || !root.certificate.is_valid() {
            continue;
        }

        let descendants = hierarchy.collect_descendants(&root.certificate);
        if descendants.is_empty() {
            continue;
        }

        // The full received chain must be present below this root
        let missing_link = leaf_chain
            .iter()
            .any(|link| !descendants.contains(link));
        if missing_link {
            continue;
        }

        // Walk from the leaf upwards
        for certificate in descendants.iter().rev() {
            let responder_url = certificate.responder_url();
            if responder_url.is_empty() {
                warn!(
                    "When generating an OCSP request, could not find responder URL for certificate: {}",
                    certificate.common_name()
                );
                continue;
            }

            let Some(certificate_hash_data) = hierarchy.get_certificate_hash(certificate) else {
                error!(
                    "Could not find hash for certificate: {}",
                    certificate.common_name()
                );
                continue;
            };

            // Sub-CAs shared between bundles must not produce duplicates
            let contained = ocsp_request_data_list.iter().any(|existing| {
                existing.certificate_hash_data.as_ref() == Some(&certificate_hash_data)
            });
            if !contained {
                ocsp_request_data_list.push(OcspRequestData {
                    certificate_hash_data: Some(certificate_hash_data),
                    responder_url: Some(responder_url),
                });
            }
        }
    }

    response.ocsp_request_data_list = ocsp_request_data_list;
    response
}

/// Periodic garbage collect trigger: a background thread holding only a weak
/// handle to the store context, stopped on drop.
struct GcTimer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl GcTimer {
    fn start(context: Weak<Mutex<StoreContext>>, interval: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let (lock, condvar) = &*thread_stop;
            let mut stopped = match lock.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            loop {
                let (guard, timeout) = match condvar.wait_timeout(stopped, interval) {
                    Ok(result) => result,
                    Err(poisoned) => {
                        stopped = poisoned.into_inner().0;
                        continue;
                    }
                };
                stopped = guard;

                if *stopped {
                    break;
                }
                if !timeout.timed_out() {
                    continue;
                }

                match context.upgrade() {
                    Some(context) => {
                        let mut context = match context.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        context.garbage_collect_internal();
                    }
                    None => break,
                }
            }
        });

        GcTimer {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.stop;
        match lock.lock() {
            Ok(mut stopped) => *stopped = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        condvar.notify_all();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EvseSecurity {
    fn drop(&mut self) {
        // Stop the GC thread before the context goes away
        self.gc_timer.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        build_certificate, key_pem_of, make_root, make_signed, pem_of, CertSpec,
    };

    struct StoreFixture {
        _dir: tempfile::TempDir,
        base: PathBuf,
        security: EvseSecurity,
    }

    fn layout(base: &Path, v2g_as_directory: bool) -> FilePaths {
        FilePaths {
            csms_ca_bundle: base.join("ca/csms/CSMS_CA_BUNDLE.pem"),
            mf_ca_bundle: base.join("ca/mf/MF_CA_BUNDLE.pem"),
            mo_ca_bundle: base.join("ca/mo/MO_CA_BUNDLE.pem"),
            v2g_ca_bundle: if v2g_as_directory {
                base.join("ca/v2g")
            } else {
                base.join("ca/v2g/V2G_CA_BUNDLE.pem")
            },
            directories: DirectoryPaths {
                csms_leaf_cert_directory: base.join("client/csms"),
                csms_leaf_key_directory: base.join("client/csms"),
                secc_leaf_cert_directory: base.join("client/cso"),
                secc_leaf_key_directory: base.join("client/cso"),
            },
            links: LinkPaths {
                secc_leaf_cert_link: base.join("links/cpo_cert.pem"),
                secc_leaf_key_link: base.join("links/cpo_key.pem"),
                cpo_cert_chain_link: base.join("links/cpo_chain.pem"),
            },
        }
    }

    fn fixture_with_limits(limits: SecurityLimits, v2g_as_directory: bool) -> StoreFixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        fs::create_dir_all(base.join("links")).unwrap();

        let security =
            EvseSecurity::new(layout(&base, v2g_as_directory), None, limits).unwrap();

        StoreFixture {
            _dir: dir,
            base,
            security,
        }
    }

    fn fixture() -> StoreFixture {
        fixture_with_limits(SecurityLimits::default(), false)
    }

    fn cso_dir(fixture: &StoreFixture) -> PathBuf {
        fixture.base.join("client/cso")
    }

    fn csms_dir(fixture: &StoreFixture) -> PathBuf {
        fixture.base.join("client/csms")
    }

    fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(extension)
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn install_and_query_csms_root() {
        let fixture = fixture();
        let (root, _) = make_root("Install CSMS Root");

        let result = fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::Csms);
        assert_eq!(result, InstallCertificateResult::Accepted);

        let installed = fixture
            .security
            .get_installed_certificates(&[CertificateType::CsmsRootCertificate]);
        assert_eq!(installed.status, GetInstalledCertificatesStatus::Accepted);
        assert_eq!(installed.certificate_hash_data_chain.len(), 1);

        let expected = Certificate::parse(pem_of(&root).as_bytes(), EncodingFormat::Pem)
            .unwrap()
            .hash_data();
        let chain = &installed.certificate_hash_data_chain[0];
        assert_eq!(chain.certificate_type, CertificateType::CsmsRootCertificate);
        assert_eq!(chain.certificate_hash_data, expected);
        assert!(chain.child_certificate_hash_data.is_empty());
    }

    #[test]
    fn install_invalid_string_is_rejected() {
        let fixture = fixture();
        let result = fixture
            .security
            .install_ca_certificate("InvalidCertificate", CaCertificateType::Csms);
        assert_eq!(result, InstallCertificateResult::InvalidFormat);
    }

    #[test]
    fn install_expired_root_is_rejected() {
        let fixture = fixture();

        let mut spec = CertSpec::new("Expired Root");
        spec.is_ca = true;
        spec.not_before_days = -30;
        spec.not_after_days = -1;
        let (expired_root, _) = build_certificate(&spec);

        let result = fixture
            .security
            .install_ca_certificate(&pem_of(&expired_root), CaCertificateType::V2g);
        assert_eq!(result, InstallCertificateResult::Expired);

        // The bundle file stays untouched
        let bundle = fs::read_to_string(fixture.base.join("ca/v2g/V2G_CA_BUNDLE.pem")).unwrap();
        assert!(bundle.is_empty());
    }

    #[test]
    fn install_into_directory_bundle_names_root_files() {
        let fixture = fixture_with_limits(SecurityLimits::default(), true);
        let (root, _) = make_root("Dir Install Root");

        let result = fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);
        assert_eq!(result, InstallCertificateResult::Accepted);

        let pems = files_with_extension(&fixture.base.join("ca/v2g"), "pem");
        assert_eq!(pems.len(), 1);
        assert!(pems[0]
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("V2G_ROOT_"));

        // Installing the identical certificate updates in place
        let result = fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);
        assert_eq!(result, InstallCertificateResult::Accepted);
        assert_eq!(
            fixture
                .security
                .get_count_of_installed_certificates(&[CertificateType::V2gRootCertificate]),
            1
        );
    }

    #[test]
    fn update_leaf_certificate_flow() {
        let fixture = fixture();
        let (root, root_key) = make_root("Leaf Flow Root");
        let (leaf, leaf_key) = make_signed("Leaf Flow Leaf", &root, &root_key, false, 365);

        assert_eq!(
            fixture
                .security
                .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g),
            InstallCertificateResult::Accepted
        );

        // Without the pairing key on disk the leaf cannot be installed
        assert_eq!(
            fixture
                .security
                .update_leaf_certificate(&pem_of(&leaf), LeafCertificateType::V2g),
            InstallCertificateResult::WriteError
        );

        fs::write(cso_dir(&fixture).join("pending_csr.key"), key_pem_of(&leaf_key)).unwrap();

        assert_eq!(
            fixture
                .security
                .update_leaf_certificate(&pem_of(&leaf), LeafCertificateType::V2g),
            InstallCertificateResult::Accepted
        );

        let leafs = files_with_extension(&cso_dir(&fixture), "pem");
        assert_eq!(leafs.len(), 1);
        assert!(leafs[0]
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("SECC_LEAF_"));

        assert_eq!(
            fixture
                .security
                .update_leaf_certificate("InvalidCertificate", LeafCertificateType::Csms),
            InstallCertificateResult::InvalidFormat
        );

        // A chain anchored to an uninstalled root is rejected
        let (other_root, other_key) = make_root("Leaf Flow Other Root");
        let (foreign_leaf, foreign_key) =
            make_signed("Foreign Leaf", &other_root, &other_key, false, 365);
        fs::write(cso_dir(&fixture).join("foreign.key"), key_pem_of(&foreign_key)).unwrap();

        assert_eq!(
            fixture
                .security
                .update_leaf_certificate(&pem_of(&foreign_leaf), LeafCertificateType::V2g),
            InstallCertificateResult::InvalidCertificateChain
        );
    }

    #[test]
    fn update_leaf_with_chain_writes_chain_file() {
        let fixture = fixture();
        let (root, root_key) = make_root("Chain File Root");
        let (sub_ca, sub_key) = make_signed("Chain File Sub", &root, &root_key, true, 3650);
        let (leaf, leaf_key) = make_signed("Chain File Leaf", &sub_ca, &sub_key, false, 365);

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);
        fs::write(cso_dir(&fixture).join("pending.key"), key_pem_of(&leaf_key)).unwrap();

        let chain_pem = format!("{}{}", pem_of(&leaf), pem_of(&sub_ca));
        assert_eq!(
            fixture
                .security
                .update_leaf_certificate(&chain_pem, LeafCertificateType::V2g),
            InstallCertificateResult::Accepted
        );

        let pems = files_with_extension(&cso_dir(&fixture), "pem");
        assert_eq!(pems.len(), 2);
        assert!(pems.iter().any(|path| path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("CPO_CERT_SECC_LEAF_CHAIN_")));

        let info = fixture.security.get_leaf_certificate_info(
            LeafCertificateType::V2g,
            EncodingFormat::Pem,
            false,
        );
        assert_eq!(info.status, GetCertificateInfoStatus::Accepted);

        let info = info.info.unwrap();
        assert!(info.certificate.is_some(), "full chain file expected");
        assert!(info.certificate_single.is_some(), "single leaf file expected");
        assert_eq!(info.certificate_count, 2);
        assert_eq!(info.key, cso_dir(&fixture).join("pending.key"));
    }

    #[test]
    fn delete_leaf_then_refetch() {
        let fixture = fixture();

        let (v2g_root, v2g_key) = make_root("Refetch V2G Root");
        let (mo_root, _) = make_root("Refetch MO Root");
        let (csms_root, _) = make_root("Refetch CSMS Root");
        let (mf_root, _) = make_root("Refetch MF Root");

        let (sub1, sub1_key) = make_signed("Refetch Sub1", &v2g_root, &v2g_key, true, 3650);
        let (sub2, sub2_key) = make_signed("Refetch Sub2", &sub1, &sub1_key, true, 3650);
        let (leaf, leaf_key) = make_signed("Refetch Leaf", &sub2, &sub2_key, false, 365);

        fixture
            .security
            .install_ca_certificate(&pem_of(&v2g_root), CaCertificateType::V2g);
        fixture
            .security
            .install_ca_certificate(&pem_of(&mo_root), CaCertificateType::Mo);
        fixture
            .security
            .install_ca_certificate(&pem_of(&csms_root), CaCertificateType::Csms);
        fixture
            .security
            .install_ca_certificate(&pem_of(&mf_root), CaCertificateType::Mf);

        fs::write(cso_dir(&fixture).join("pending.key"), key_pem_of(&leaf_key)).unwrap();
        let chain_pem = format!("{}{}{}", pem_of(&leaf), pem_of(&sub2), pem_of(&sub1));
        assert_eq!(
            fixture
                .security
                .update_leaf_certificate(&chain_pem, LeafCertificateType::V2g),
            InstallCertificateResult::Accepted
        );

        let all_types = [
            CertificateType::V2gRootCertificate,
            CertificateType::MoRootCertificate,
            CertificateType::CsmsRootCertificate,
            CertificateType::V2gCertificateChain,
            CertificateType::MfRootCertificate,
        ];

        let installed = fixture.security.get_installed_certificates(&all_types);
        assert_eq!(installed.status, GetInstalledCertificatesStatus::Accepted);

        let v2g_chains: Vec<_> = installed
            .certificate_hash_data_chain
            .iter()
            .filter(|chain| chain.certificate_type == CertificateType::V2gCertificateChain)
            .collect();
        assert_eq!(v2g_chains.len(), 1);
        assert_eq!(v2g_chains[0].child_certificate_hash_data.len(), 2);

        let total_before = installed.certificate_hash_data_chain.len();

        // The chain is reported leaf-first
        let leaf_wrapped = Certificate::parse(pem_of(&leaf).as_bytes(), EncodingFormat::Pem).unwrap();
        let sub2_wrapped = Certificate::parse(pem_of(&sub2).as_bytes(), EncodingFormat::Pem).unwrap();
        let leaf_hash = leaf_wrapped.hash_data_with_issuer(&sub2_wrapped).unwrap();
        assert_eq!(v2g_chains[0].certificate_hash_data, leaf_hash);

        let deleted = fixture.security.delete_certificate(&leaf_hash);
        assert_eq!(deleted.result, DeleteCertificateResult::Accepted);
        assert_eq!(deleted.leaf_certificate_type, Some(LeafCertificateType::V2g));

        let deleted_again = fixture.security.delete_certificate(&leaf_hash);
        assert_eq!(deleted_again.result, DeleteCertificateResult::NotFound);

        let installed_after = fixture.security.get_installed_certificates(&all_types);
        assert_eq!(
            installed_after.certificate_hash_data_chain.len(),
            total_before - 1
        );

        // Chain file and private key are gone too
        assert!(files_with_extension(&cso_dir(&fixture), "pem").is_empty());
        assert!(files_with_extension(&cso_dir(&fixture), "key").is_empty());
    }

    #[test]
    fn csms_leaf_may_not_be_deleted() {
        let fixture = fixture();
        let (root, root_key) = make_root("Protected CSMS Root");
        let (leaf, leaf_key) = make_signed("Protected CSMS Leaf", &root, &root_key, false, 365);

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::Csms);
        fs::write(csms_dir(&fixture).join("pending.key"), key_pem_of(&leaf_key)).unwrap();
        assert_eq!(
            fixture
                .security
                .update_leaf_certificate(&pem_of(&leaf), LeafCertificateType::Csms),
            InstallCertificateResult::Accepted
        );

        let root_wrapped =
            Certificate::parse(pem_of(&root).as_bytes(), EncodingFormat::Pem).unwrap();
        let leaf_wrapped =
            Certificate::parse(pem_of(&leaf).as_bytes(), EncodingFormat::Pem).unwrap();
        let leaf_hash = leaf_wrapped.hash_data_with_issuer(&root_wrapped).unwrap();

        let result = fixture.security.delete_certificate(&leaf_hash);
        assert_eq!(result.result, DeleteCertificateResult::Failed);
        assert_eq!(result.leaf_certificate_type, Some(LeafCertificateType::Csms));

        // The leaf is still on disk
        assert_eq!(files_with_extension(&csms_dir(&fixture), "pem").len(), 1);
    }

    #[test]
    fn deleting_ca_root_keeps_issued_leaves() {
        let fixture = fixture();
        let (root, root_key) = make_root("Root Keeps Leaves");
        let (leaf, leaf_key) = make_signed("Kept Leaf", &root, &root_key, false, 365);

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);
        fs::write(cso_dir(&fixture).join("pending.key"), key_pem_of(&leaf_key)).unwrap();
        fixture
            .security
            .update_leaf_certificate(&pem_of(&leaf), LeafCertificateType::V2g);

        let root_hash = Certificate::parse(pem_of(&root).as_bytes(), EncodingFormat::Pem)
            .unwrap()
            .hash_data();

        let result = fixture.security.delete_certificate(&root_hash);
        assert_eq!(result.result, DeleteCertificateResult::Accepted);
        assert_eq!(result.ca_certificate_type, Some(CaCertificateType::V2g));

        // Policy: leaves issued by the deleted root stay on disk
        assert_eq!(files_with_extension(&cso_dir(&fixture), "pem").len(), 1);
        assert_eq!(files_with_extension(&cso_dir(&fixture), "key").len(), 1);
    }

    #[test]
    fn installed_hierarchy_shape_with_sub_cas() {
        let fixture = fixture();
        let (root, root_key) = make_root("Shape Root");
        let (sub1, sub1_key) = make_signed("Shape Sub1", &root, &root_key, true, 3650);
        let (sub2, _) = make_signed("Shape Sub2", &sub1, &sub1_key, true, 3650);

        for pem in [pem_of(&root), pem_of(&sub1), pem_of(&sub2)] {
            assert_eq!(
                fixture
                    .security
                    .install_ca_certificate(&pem, CaCertificateType::V2g),
                InstallCertificateResult::Accepted
            );
        }

        let installed = fixture
            .security
            .get_installed_certificates(&[CertificateType::V2gRootCertificate]);
        assert_eq!(installed.certificate_hash_data_chain.len(), 1);

        let root_wrapped =
            Certificate::parse(pem_of(&root).as_bytes(), EncodingFormat::Pem).unwrap();
        let sub1_wrapped =
            Certificate::parse(pem_of(&sub1).as_bytes(), EncodingFormat::Pem).unwrap();
        let sub2_wrapped =
            Certificate::parse(pem_of(&sub2).as_bytes(), EncodingFormat::Pem).unwrap();

        let chain = &installed.certificate_hash_data_chain[0];
        assert_eq!(chain.certificate_hash_data, root_wrapped.hash_data());
        assert_eq!(chain.child_certificate_hash_data.len(), 2);
        assert!(chain
            .child_certificate_hash_data
            .contains(&sub1_wrapped.hash_data_with_issuer(&root_wrapped).unwrap()));
        assert!(chain
            .child_certificate_hash_data
            .contains(&sub2_wrapped.hash_data_with_issuer(&sub1_wrapped).unwrap()));
    }

    #[test]
    fn csr_generation_tracks_key_and_rejects_bad_requests() {
        let fixture = fixture();

        let result = fixture.security.generate_certificate_signing_request(
            LeafCertificateType::V2g,
            "DE",
            "Pionix",
            "SECC",
            false,
        );
        assert_eq!(result.status, GetCertificateSignRequestStatus::Accepted);
        assert!(result.csr.unwrap().contains("BEGIN CERTIFICATE REQUEST"));

        let keys = files_with_extension(&cso_dir(&fixture), "key");
        assert_eq!(keys.len(), 1);
        assert!(keys[0]
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("SECC_LEAF_"));

        let invalid = fixture.security.generate_certificate_signing_request(
            LeafCertificateType::Mf,
            "DE",
            "Pionix",
            "MF",
            false,
        );
        assert_eq!(
            invalid.status,
            GetCertificateSignRequestStatus::InvalidRequestedType
        );

        let custom = fixture.security.generate_certificate_signing_request(
            LeafCertificateType::V2g,
            "DE",
            "Pionix",
            "SECC",
            true,
        );
        assert_eq!(custom.status, GetCertificateSignRequestStatus::KeyGenError);
    }

    #[test]
    fn csr_key_survives_fulfilment() {
        let fixture = fixture();
        let (root, root_key) = make_root("Fulfil Root");

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);

        let result = fixture.security.generate_certificate_signing_request(
            LeafCertificateType::V2g,
            "DE",
            "Pionix",
            "SECC",
            false,
        );
        assert_eq!(result.status, GetCertificateSignRequestStatus::Accepted);

        // Sign the CSR key with our root, as a CSMS would
        let keys = files_with_extension(&cso_dir(&fixture), "key");
        let csr_key = openssl::pkey::PKey::private_key_from_pem(&fs::read(&keys[0]).unwrap())
            .unwrap();

        let mut spec = CertSpec::new("Fulfilled Leaf");
        spec.issuer = Some((&root, &root_key));
        let signed_leaf = crate::test_support::build_certificate_with_key(&spec, &csr_key);

        assert_eq!(
            fixture
                .security
                .update_leaf_certificate(&pem_of(&signed_leaf), LeafCertificateType::V2g),
            InstallCertificateResult::Accepted
        );
    }

    #[test]
    fn ocsp_cache_round_trip() {
        let fixture = fixture();
        let (root, root_key) = make_root("Ocsp Cache Root");
        let (leaf, leaf_key) = make_signed("Ocsp Cache Leaf", &root, &root_key, false, 365);

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);
        fs::write(cso_dir(&fixture).join("pending.key"), key_pem_of(&leaf_key)).unwrap();
        fixture
            .security
            .update_leaf_certificate(&pem_of(&leaf), LeafCertificateType::V2g);

        let root_wrapped =
            Certificate::parse(pem_of(&root).as_bytes(), EncodingFormat::Pem).unwrap();
        let leaf_wrapped =
            Certificate::parse(pem_of(&leaf).as_bytes(), EncodingFormat::Pem).unwrap();
        let leaf_hash = leaf_wrapped.hash_data_with_issuer(&root_wrapped).unwrap();

        assert!(fixture.security.retrieve_ocsp_cache(&leaf_hash).is_none());

        fixture.security.update_ocsp_cache(&leaf_hash, b"ocsp-response-1");

        let cached = fixture.security.retrieve_ocsp_cache(&leaf_hash).unwrap();
        assert_eq!(fs::read(&cached).unwrap(), b"ocsp-response-1");
        assert!(cached.starts_with(cso_dir(&fixture).join("ocsp")));

        // A second update overwrites in place instead of adding a twin
        fixture.security.update_ocsp_cache(&leaf_hash, b"ocsp-response-2");
        let cached_again = fixture.security.retrieve_ocsp_cache(&leaf_hash).unwrap();
        assert_eq!(cached_again, cached);
        assert_eq!(fs::read(&cached_again).unwrap(), b"ocsp-response-2");

        let hash_files = files_with_extension(&cso_dir(&fixture).join("ocsp"), "hash");
        assert_eq!(hash_files.len(), 1);
    }

    #[test]
    fn v2g_ocsp_request_data_walks_chain_leaf_first() {
        let fixture = fixture();
        let (root, root_key) = make_root("Ocsp Req Root");

        let mut sub_spec = CertSpec::new("Ocsp Req Sub");
        sub_spec.issuer = Some((&root, &root_key));
        sub_spec.is_ca = true;
        sub_spec.not_after_days = 3650;
        sub_spec.responder_url = Some("http://ocsp.example.com/sub");
        let (sub_ca, sub_key) = build_certificate(&sub_spec);

        let mut leaf_spec = CertSpec::new("Ocsp Req Leaf");
        leaf_spec.issuer = Some((&sub_ca, &sub_key));
        leaf_spec.responder_url = Some("http://ocsp.example.com/leaf");
        let (leaf, leaf_key) = build_certificate(&leaf_spec);

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);
        fs::write(cso_dir(&fixture).join("pending.key"), key_pem_of(&leaf_key)).unwrap();
        let chain_pem = format!("{}{}", pem_of(&leaf), pem_of(&sub_ca));
        assert_eq!(
            fixture
                .security
                .update_leaf_certificate(&chain_pem, LeafCertificateType::V2g),
            InstallCertificateResult::Accepted
        );

        let request_data = fixture.security.get_v2g_ocsp_request_data();
        assert_eq!(request_data.ocsp_request_data_list.len(), 2);

        let leaf_wrapped =
            Certificate::parse(pem_of(&leaf).as_bytes(), EncodingFormat::Pem).unwrap();
        let sub_wrapped =
            Certificate::parse(pem_of(&sub_ca).as_bytes(), EncodingFormat::Pem).unwrap();

        let first = &request_data.ocsp_request_data_list[0];
        assert_eq!(
            first.certificate_hash_data.as_ref().unwrap(),
            &leaf_wrapped.hash_data_with_issuer(&sub_wrapped).unwrap()
        );
        assert_eq!(
            first.responder_url.as_deref(),
            Some("http://ocsp.example.com/leaf")
        );

        let second = &request_data.ocsp_request_data_list[1];
        assert_eq!(
            second.responder_url.as_deref(),
            Some("http://ocsp.example.com/sub")
        );
    }

    #[test]
    fn mo_ocsp_request_data_from_contract_chain() {
        let fixture = fixture();
        let (mo_root, mo_key) = make_root("MO Ocsp Root");

        let mut contract_spec = CertSpec::new("Contract Cert");
        contract_spec.issuer = Some((&mo_root, &mo_key));
        contract_spec.responder_url = Some("http://ocsp.mo.example.com");
        let (contract, _) = build_certificate(&contract_spec);

        fixture
            .security
            .install_ca_certificate(&pem_of(&mo_root), CaCertificateType::Mo);

        let request_data = fixture.security.get_mo_ocsp_request_data(&pem_of(&contract));
        assert_eq!(request_data.ocsp_request_data_list.len(), 1);
        assert_eq!(
            request_data.ocsp_request_data_list[0]
                .responder_url
                .as_deref(),
            Some("http://ocsp.mo.example.com")
        );
    }

    #[test]
    fn verify_without_installed_anchor_reports_issuer_not_found() {
        let fixture = fixture();
        let (root, root_key) = make_root("Unanchored Root");
        let (leaf, _) = make_signed("Unanchored Leaf", &root, &root_key, false, 365);

        let result = fixture
            .security
            .verify_certificate(&pem_of(&leaf), &[LeafCertificateType::Csms]);
        assert_eq!(result, CertificateValidationResult::IssuerNotFound);
    }

    #[test]
    fn is_ca_certificate_installed_requires_valid_root() {
        let fixture = fixture();
        assert!(!fixture
            .security
            .is_ca_certificate_installed(CaCertificateType::Mf));

        let (root, _) = make_root("Installed MF Root");
        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::Mf);
        assert!(fixture
            .security
            .is_ca_certificate_installed(CaCertificateType::Mf));
    }

    #[test]
    fn leaf_expiry_days_count() {
        let fixture = fixture();
        let (root, root_key) = make_root("Expiry Count Root");
        let (leaf, leaf_key) = make_signed("Expiry Count Leaf", &root, &root_key, false, 100);

        assert_eq!(fixture.security.get_leaf_expiry_days_count(LeafCertificateType::V2g), 0);

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);
        fs::write(cso_dir(&fixture).join("pending.key"), key_pem_of(&leaf_key)).unwrap();
        fixture
            .security
            .update_leaf_certificate(&pem_of(&leaf), LeafCertificateType::V2g);

        let days = fixture.security.get_leaf_expiry_days_count(LeafCertificateType::V2g);
        assert!((98..=100).contains(&days), "unexpected day count: {}", days);
    }

    #[test]
    fn certificate_links_follow_selected_leaf() {
        let fixture = fixture();
        let (root, root_key) = make_root("Links Root");
        let (leaf, leaf_key) = make_signed("Links Leaf", &root, &root_key, false, 365);

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);
        fs::write(cso_dir(&fixture).join("pending.key"), key_pem_of(&leaf_key)).unwrap();
        fixture
            .security
            .update_leaf_certificate(&pem_of(&leaf), LeafCertificateType::V2g);

        assert!(fixture
            .security
            .update_certificate_links(LeafCertificateType::V2g)
            .unwrap());

        let cert_link = fixture.base.join("links/cpo_cert.pem");
        let key_link = fixture.base.join("links/cpo_key.pem");
        assert!(cert_link.is_symlink());
        assert!(key_link.is_symlink());
        assert_eq!(
            fs::read_link(&key_link).unwrap(),
            cso_dir(&fixture).join("pending.key")
        );

        // Nothing changes on a second refresh
        assert!(!fixture
            .security
            .update_certificate_links(LeafCertificateType::V2g)
            .unwrap());

        assert!(fixture
            .security
            .update_certificate_links(LeafCertificateType::Csms)
            .is_err());
    }

    #[test]
    fn verify_location_for_file_and_directory() {
        let fixture = fixture();
        let (root, _) = make_root("Location Root");

        // Nothing installed: no location
        assert!(fixture
            .security
            .get_verify_location(CaCertificateType::V2g)
            .is_empty());

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);

        let location = fixture.security.get_verify_location(CaCertificateType::V2g);
        assert_eq!(
            location,
            fixture.base.join("ca/v2g/V2G_CA_BUNDLE.pem").display().to_string()
        );

        let file = fixture.security.get_verify_file(CaCertificateType::V2g);
        assert_eq!(file, location);
    }

    #[test]
    fn verify_location_for_directory_creates_rehash_links() {
        let fixture = fixture_with_limits(SecurityLimits::default(), true);
        let (root, _) = make_root("Rehash Root");

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);

        let location = fixture.security.get_verify_location(CaCertificateType::V2g);
        assert_eq!(location, fixture.base.join("ca/v2g").display().to_string());

        // The rehash symlink for the root's subject hash exists
        let links: Vec<PathBuf> = fs::read_dir(fixture.base.join("ca/v2g"))
            .unwrap()
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_symlink())
            .collect();
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn quota_blocks_installs() {
        let limits = SecurityLimits {
            max_fs_certificate_store_entries: 0,
            ..SecurityLimits::default()
        };
        let fixture = fixture_with_limits(limits, false);
        let (root, _) = make_root("Quota Root");

        assert_eq!(
            fixture
                .security
                .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g),
            InstallCertificateResult::CertificateStoreMaxLengthExceeded
        );
    }

    fn gc_limits(csr_expiry_seconds: u64) -> SecurityLimits {
        SecurityLimits {
            // Entry limit of zero keeps the quota check permanently tripped
            max_fs_certificate_store_entries: 0,
            csr_expiry_seconds,
            garbage_collect_time_seconds: 3600,
            ..SecurityLimits::default()
        }
    }

    #[test]
    fn gc_reaps_expired_chains_beyond_protected_minimum() {
        let fixture = fixture_with_limits(gc_limits(3600), false);
        let (root, root_key) = make_root("GC Reap Root");

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);

        // Ten protected (valid) chains plus two expired ones beyond the limit
        for i in 0..10 {
            let (leaf, leaf_key) =
                make_signed(&format!("GC Valid {}", i), &root, &root_key, false, 50 + i);
            fs::write(
                cso_dir(&fixture).join(format!("SECC_LEAF_{:02}.pem", i)),
                pem_of(&leaf),
            )
            .unwrap();
            fs::write(
                cso_dir(&fixture).join(format!("SECC_LEAF_{:02}.key", i)),
                key_pem_of(&leaf_key),
            )
            .unwrap();
        }
        for (i, days) in [(10, -1i64), (11, -2i64)] {
            let (leaf, leaf_key) =
                make_signed(&format!("GC Expired {}", i), &root, &root_key, false, days);
            fs::write(
                cso_dir(&fixture).join(format!("SECC_LEAF_{:02}.pem", i)),
                pem_of(&leaf),
            )
            .unwrap();
            fs::write(
                cso_dir(&fixture).join(format!("SECC_LEAF_{:02}.key", i)),
                key_pem_of(&leaf_key),
            )
            .unwrap();
        }

        fixture.security.garbage_collect();

        let remaining_pems = files_with_extension(&cso_dir(&fixture), "pem");
        let remaining_keys = files_with_extension(&cso_dir(&fixture), "key");
        assert_eq!(remaining_pems.len(), 10);
        assert_eq!(remaining_keys.len(), 10);
        assert!(!cso_dir(&fixture).join("SECC_LEAF_10.pem").exists());
        assert!(!cso_dir(&fixture).join("SECC_LEAF_11.key").exists());
    }

    #[test]
    fn gc_quarantines_then_reaps_orphan_keys() {
        // First with a generous expiry: the key survives the sweep
        let fixture = fixture_with_limits(gc_limits(3600), false);
        let orphan = crate::test_support::make_keypair();
        let orphan_path = cso_dir(&fixture).join("orphan.key");
        fs::write(&orphan_path, key_pem_of(&orphan)).unwrap();

        fixture.security.garbage_collect();
        assert!(orphan_path.exists(), "first sighting must not delete the key");

        // With an immediate expiry the quarantined key is reaped
        let fixture = fixture_with_limits(gc_limits(0), false);
        let orphan = crate::test_support::make_keypair();
        let orphan_path = cso_dir(&fixture).join("orphan.key");
        fs::write(&orphan_path, key_pem_of(&orphan)).unwrap();

        fixture.security.garbage_collect();
        assert!(!orphan_path.exists(), "expired csr key must be deleted");
    }

    #[test]
    fn gc_keeps_paired_keys() {
        let fixture = fixture_with_limits(gc_limits(0), false);
        let (root, root_key) = make_root("GC Paired Root");
        let (leaf, leaf_key) = make_signed("GC Paired Leaf", &root, &root_key, false, 365);

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);
        fs::write(cso_dir(&fixture).join("SECC_LEAF_A.pem"), pem_of(&leaf)).unwrap();
        let key_path = cso_dir(&fixture).join("SECC_LEAF_A.key");
        fs::write(&key_path, key_pem_of(&leaf_key)).unwrap();

        fixture.security.garbage_collect();

        // Paired with a certificate: never quarantined, never reaped
        assert!(key_path.exists());
    }

    #[test]
    fn gc_reaps_dangling_ocsp_entries() {
        let fixture = fixture_with_limits(gc_limits(3600), false);
        let (root, root_key) = make_root("GC Ocsp Root");
        let (leaf, leaf_key) = make_signed("GC Ocsp Leaf", &root, &root_key, false, 365);

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);
        fs::write(cso_dir(&fixture).join("SECC_LEAF_A.pem"), pem_of(&leaf)).unwrap();
        fs::write(cso_dir(&fixture).join("SECC_LEAF_A.key"), key_pem_of(&leaf_key)).unwrap();

        let ocsp_dir = cso_dir(&fixture).join("ocsp");
        fs::create_dir_all(&ocsp_dir).unwrap();

        // A live entry for the installed leaf
        let root_wrapped =
            Certificate::parse(pem_of(&root).as_bytes(), EncodingFormat::Pem).unwrap();
        let leaf_wrapped =
            Certificate::parse(pem_of(&leaf).as_bytes(), EncodingFormat::Pem).unwrap();
        let live_hash = leaf_wrapped.hash_data_with_issuer(&root_wrapped).unwrap();
        fs_utils::write_hash_to_file(&ocsp_dir.join("live.hash"), &live_hash);
        fs::write(ocsp_dir.join("live.der"), [1u8]).unwrap();

        // A dangling entry whose certificate no longer exists
        let dangling_hash = CertificateHashData {
            hash_algorithm: HashAlgorithm::Sha256,
            issuer_name_hash: "aa".repeat(32),
            issuer_key_hash: "bb".repeat(32),
            serial_number: "deadbeef".to_string(),
        };
        fs_utils::write_hash_to_file(&ocsp_dir.join("dangling.hash"), &dangling_hash);
        fs::write(ocsp_dir.join("dangling.der"), [2u8]).unwrap();

        fixture.security.garbage_collect();

        assert!(ocsp_dir.join("live.hash").exists());
        assert!(ocsp_dir.join("live.der").exists());
        assert!(!ocsp_dir.join("dangling.hash").exists());
        assert!(!ocsp_dir.join("dangling.der").exists());
    }

    #[test]
    fn all_valid_certificates_newest_per_root() {
        let fixture = fixture();
        let (root_a, root_a_key) = make_root("Multi Root A");
        let (root_b, root_b_key) = make_root("Multi Root B");

        fixture
            .security
            .install_ca_certificate(&pem_of(&root_a), CaCertificateType::V2g);
        fixture
            .security
            .install_ca_certificate(&pem_of(&root_b), CaCertificateType::V2g);

        let (leaf_a_old, key_a_old) = make_signed("Leaf A Old", &root_a, &root_a_key, false, 100);
        let (leaf_a_new, key_a_new) = make_signed("Leaf A New", &root_a, &root_a_key, false, 300);
        let (leaf_b, key_b) = make_signed("Leaf B", &root_b, &root_b_key, false, 200);

        for (i, (leaf, key)) in [
            (&leaf_a_old, &key_a_old),
            (&leaf_a_new, &key_a_new),
            (&leaf_b, &key_b),
        ]
        .iter()
        .enumerate()
        {
            fs::write(
                cso_dir(&fixture).join(format!("SECC_LEAF_{}.pem", i)),
                pem_of(leaf),
            )
            .unwrap();
            fs::write(
                cso_dir(&fixture).join(format!("SECC_LEAF_{}.key", i)),
                key_pem_of(key),
            )
            .unwrap();
        }

        let result = fixture.security.get_all_valid_certificates_info(
            LeafCertificateType::V2g,
            EncodingFormat::Pem,
            false,
        );
        assert_eq!(result.status, GetCertificateInfoStatus::Accepted);
        assert_eq!(result.info.len(), 2, "one newest leaf per distinct root");

        // Newest overall (Leaf A New) first
        assert_eq!(
            result.info[0].certificate_single,
            Some(cso_dir(&fixture).join("SECC_LEAF_1.pem"))
        );
        assert_eq!(
            result.info[1].certificate_single,
            Some(cso_dir(&fixture).join("SECC_LEAF_2.pem"))
        );
        assert!(result.info[0].certificate_root.is_some());
    }

    #[test]
    fn leaf_info_statuses() {
        let fixture = fixture();

        // Empty directory
        let result = fixture.security.get_leaf_certificate_info(
            LeafCertificateType::V2g,
            EncodingFormat::Pem,
            false,
        );
        assert_eq!(result.status, GetCertificateInfoStatus::NotFound);

        // Rejected type
        let result = fixture.security.get_leaf_certificate_info(
            LeafCertificateType::Mo,
            EncodingFormat::Pem,
            false,
        );
        assert_eq!(result.status, GetCertificateInfoStatus::Rejected);

        // Expired leaf only
        let (root, root_key) = make_root("Status Root");
        let (expired, expired_key) = make_signed("Status Expired", &root, &root_key, false, -1);
        fs::write(cso_dir(&fixture).join("SECC_LEAF_0.pem"), pem_of(&expired)).unwrap();
        fs::write(
            cso_dir(&fixture).join("SECC_LEAF_0.key"),
            key_pem_of(&expired_key),
        )
        .unwrap();

        let result = fixture.security.get_leaf_certificate_info(
            LeafCertificateType::V2g,
            EncodingFormat::Pem,
            false,
        );
        assert_eq!(result.status, GetCertificateInfoStatus::NotFoundValid);

        // Valid leaf without key
        let (valid, _) = make_signed("Status Valid", &root, &root_key, false, 365);
        fs::write(cso_dir(&fixture).join("SECC_LEAF_1.pem"), pem_of(&valid)).unwrap();

        let result = fixture.security.get_leaf_certificate_info(
            LeafCertificateType::V2g,
            EncodingFormat::Pem,
            false,
        );
        assert_eq!(result.status, GetCertificateInfoStatus::PrivateKeyNotFound);
    }

    #[test]
    fn future_valid_leaf_counts_for_ocsp_but_not_for_info() {
        let fixture = fixture();
        let (root, root_key) = make_root("Future Root");

        fixture
            .security
            .install_ca_certificate(&pem_of(&root), CaCertificateType::V2g);

        let mut spec = CertSpec::new("Future Leaf");
        spec.issuer = Some((&root, &root_key));
        spec.not_before_days = 10;
        spec.not_after_days = 375;
        spec.responder_url = Some("http://ocsp.example.com/future");
        let (future_leaf, future_key) = build_certificate(&spec);

        fs::write(cso_dir(&fixture).join("SECC_LEAF_F.pem"), pem_of(&future_leaf)).unwrap();
        fs::write(
            cso_dir(&fixture).join("SECC_LEAF_F.key"),
            key_pem_of(&future_key),
        )
        .unwrap();

        // Not yet valid: no key pair is selected
        let info = fixture.security.get_leaf_certificate_info(
            LeafCertificateType::V2g,
            EncodingFormat::Pem,
            false,
        );
        assert_eq!(info.status, GetCertificateInfoStatus::NotFoundValid);

        // OCSP request data does consider future-valid leafs
        let request_data = fixture.security.get_v2g_ocsp_request_data();
        assert_eq!(request_data.ocsp_request_data_list.len(), 1);
        assert_eq!(
            request_data.ocsp_request_data_list[0]
                .responder_url
                .as_deref(),
            Some("http://ocsp.example.com/future")
        );
    }

    #[test]
    fn file_signature_verification() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("firmware.bin");
        fs::write(&file_path, b"firmware image contents").unwrap();

        let (signer_cert, signer_key) = make_root("Signer");

        // Sign the SHA-256 digest of the file
        let digest = crate::crypto::Crypto::digest_sha256_file(&file_path).unwrap();
        let mut ctx = openssl::pkey_ctx::PkeyCtx::new(&signer_key).unwrap();
        ctx.sign_init().unwrap();
        ctx.set_signature_md(openssl::md::Md::sha256()).unwrap();
        let mut signature = Vec::new();
        ctx.sign_to_vec(&digest, &mut signature).unwrap();

        let signature_b64 = EvseSecurity::base64_encode_from_bytes(&signature);

        assert!(EvseSecurity::verify_file_signature(
            &file_path,
            &pem_of(&signer_cert),
            &signature_b64
        ));

        fs::write(&file_path, b"tampered contents").unwrap();
        assert!(!EvseSecurity::verify_file_signature(
            &file_path,
            &pem_of(&signer_cert),
            &signature_b64
        ));
    }
}
