//! Filesystem helpers shared by the bundle, OCSP and store layers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::error;

use crate::types::{CertificateHashData, HashAlgorithm, CERT_HASH_EXTENSION};

/// Returns true if `subdir` lies underneath `base`.
pub fn is_subdirectory(base: &Path, subdir: &Path) -> bool {
    subdir.starts_with(base)
}

/// Deletes a regular file, logging the outcome. Returns false when the path is
/// not a regular file or removal fails; GC sweeps continue on failure.
pub fn delete_file(file_path: &Path) -> bool {
    if file_path.is_file() {
        match fs::remove_file(file_path) {
            Ok(()) => return true,
            Err(e) => {
                error!("Error deleting file {}: {}", file_path.display(), e);
                return false;
            }
        }
    }

    error!("Error deleting file, not a regular file: {}", file_path.display());
    false
}

pub fn read_from_file(file_path: &Path) -> Result<String> {
    if !file_path.is_file() {
        anyhow::bail!("not a regular file: {}", file_path.display());
    }

    fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read file: {}", file_path.display()))
}

pub fn write_to_file(file_path: &Path, data: &str) -> Result<()> {
    fs::write(file_path, data)
        .with_context(|| format!("Failed to write file: {}", file_path.display()))
}

/// Creates an empty file when the path does not exist yet. Refuses to shadow
/// an existing directory.
pub fn create_file_if_nonexistent(file_path: &Path) -> Result<()> {
    if !file_path.exists() {
        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create parent directory for: {}", file_path.display())
                })?;
            }
        }
        fs::File::create(file_path)
            .with_context(|| format!("Failed to create file: {}", file_path.display()))?;
    } else if file_path.is_dir() {
        anyhow::bail!(
            "Attempting to create file over existing directory: {}",
            file_path.display()
        );
    }

    Ok(())
}

/// Creates a file for paths with an extension, a directory otherwise.
pub fn create_file_or_dir_if_nonexistent(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    if path.extension().is_some() {
        create_file_if_nonexistent(path)
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))
    }
}

/// Produces a unique file name `T<epoch>_i<counter>_r<random><extension>`.
/// The extension must include its leading dot (or be a suffix like `_ocsp`).
pub fn get_random_file_name(extension: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut random = [0u8; 4];
    if openssl::rand::rand_bytes(&mut random).is_err() {
        // rand failure leaves the counter as the uniqueness source
        random = count.to_le_bytes()[..4].try_into().unwrap_or([0u8; 4]);
    }

    format!("T{}_i{}_r{}{}", epoch, count, hex::encode(random), extension)
}

/// Reads an OCSP sidecar hash file: algorithm, issuer name hash, issuer key
/// hash and serial, one per line. Non-`.hash` files are skipped.
pub fn read_hash_from_file(file_path: &Path) -> Option<CertificateHashData> {
    if file_path.extension().and_then(|e| e.to_str()) != Some(CERT_HASH_EXTENSION) {
        return None;
    }

    let content = match fs::read_to_string(file_path) {
        Ok(content) => content,
        Err(e) => {
            error!("Error reading cert hash file {}: {}", file_path.display(), e);
            return None;
        }
    };

    let mut lines = content.lines().map(str::trim);
    let algorithm = HashAlgorithm::from_str_name(lines.next()?)?;
    let issuer_name_hash = lines.next()?.to_string();
    let issuer_key_hash = lines.next()?.to_string();
    let serial_number = lines.next()?.to_string();

    Some(CertificateHashData {
        hash_algorithm: algorithm,
        issuer_name_hash,
        issuer_key_hash,
        serial_number,
    })
}

pub fn write_hash_to_file(file_path: &Path, hash: &CertificateHashData) -> bool {
    let mut real_path = PathBuf::from(file_path);
    if real_path.extension().and_then(|e| e.to_str()) != Some(CERT_HASH_EXTENSION) {
        real_path.set_extension(CERT_HASH_EXTENSION);
    }

    let content = format!(
        "{}\n{}\n{}\n{}\n",
        hash.hash_algorithm.as_str(),
        hash.issuer_name_hash,
        hash.issuer_key_hash,
        hash.serial_number
    );

    if let Err(e) = fs::write(&real_path, content) {
        error!("Error writing cert hash file {}: {}", real_path.display(), e);
        return false;
    }

    true
}
