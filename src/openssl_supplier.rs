//! OpenSSL implementation of the crypto provider seam.
//!
//! This is the only module that talks to OpenSSL. The store above deals in
//! [`Certificate`](crate::certificate::Certificate) values and status enums.

use std::fs::File;
use std::io::Read;
use std::os::raw::c_void;
use std::path::Path;

use openssl::asn1::Asn1Time;
use openssl::base64;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::{hash, MessageDigest};
use openssl::md::Md;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509NameBuilder, X509Req, X509StoreContext, X509};
use tracing::{debug, error, warn};

use crate::crypto::{
    CertificateKeyUsageFlags, CertificateSignRequestResult, CertificateSigningRequestInfo,
    CryptoKeyType, CryptoSupplier, KeyValidationResult,
};
use crate::error::CertStoreError;
use crate::types::{CertificateValidationResult, EncodingFormat};

pub struct OpensslSupplier;

fn to_validation_result(error_code: i32) -> CertificateValidationResult {
    match error_code {
        openssl_sys::X509_V_ERR_CERT_HAS_EXPIRED => CertificateValidationResult::Expired,
        openssl_sys::X509_V_ERR_CERT_SIGNATURE_FAILURE => {
            CertificateValidationResult::InvalidSignature
        }
        openssl_sys::X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE => {
            CertificateValidationResult::InvalidLeafSignature
        }
        // An unlocatable issuer means the presented chain does not reach any
        // installed anchor; IssuerNotFound is reserved for an empty trust set
        openssl_sys::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT
        | openssl_sys::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY
        | openssl_sys::X509_V_ERR_CERT_CHAIN_TOO_LONG
        | openssl_sys::X509_V_ERR_CERT_UNTRUSTED => CertificateValidationResult::InvalidChain,
        other => {
            warn!("Unmapped X509 verify error code: {}", other);
            CertificateValidationResult::Unknown
        }
    }
}

/// Reads one DER TLV, returning `(tag, content, rest)`.
fn read_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, after_tag) = input.split_first()?;
    let (&first_len, mut rest) = after_tag.split_first()?;

    let length = if first_len & 0x80 == 0 {
        first_len as usize
    } else {
        let num_bytes = (first_len & 0x7f) as usize;
        if num_bytes == 0 || num_bytes > 4 || rest.len() < num_bytes {
            return None;
        }
        let mut length = 0usize;
        for _ in 0..num_bytes {
            let (&byte, tail) = rest.split_first()?;
            length = (length << 8) | byte as usize;
            rest = tail;
        }
        length
    };

    if rest.len() < length {
        return None;
    }
    Some((tag, &rest[..length], &rest[length..]))
}

/// Extracts the subjectPublicKey BIT STRING contents from a DER encoded
/// SubjectPublicKeyInfo. The OCPP key hash is computed over exactly these
/// bytes, not over the full SubjectPublicKeyInfo.
fn subject_public_key_bits(spki_der: &[u8]) -> Option<&[u8]> {
    let (outer_tag, outer_content, _) = read_tlv(spki_der)?;
    if outer_tag != 0x30 {
        return None;
    }

    // AlgorithmIdentifier, then the BIT STRING
    let (_, _, after_algorithm) = read_tlv(outer_content)?;
    let (bits_tag, bits_content, _) = read_tlv(after_algorithm)?;
    if bits_tag != 0x03 || bits_content.is_empty() {
        return None;
    }

    // First octet is the unused-bits count
    Some(&bits_content[1..])
}

fn generate_key(info: &CertificateSigningRequestInfo) -> Option<PKey<Private>> {
    let key = match info.key_info.key_type {
        CryptoKeyType::EcPrime256v1 => {
            let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).ok()?;
            PKey::from_ec_key(EcKey::generate(&group).ok()?).ok()?
        }
        CryptoKeyType::EcSecp384r1 => {
            let group = EcGroup::from_curve_name(Nid::SECP384R1).ok()?;
            PKey::from_ec_key(EcKey::generate(&group).ok()?).ok()?
        }
        CryptoKeyType::Rsa2048 => PKey::from_rsa(Rsa::generate(2048).ok()?).ok()?,
        CryptoKeyType::Rsa3072 => PKey::from_rsa(Rsa::generate(3072).ok()?).ok()?,
        CryptoKeyType::Rsa7680 => PKey::from_rsa(Rsa::generate(7680).ok()?).ok()?,
    };

    Some(key)
}

fn export_key(info: &CertificateSigningRequestInfo, key: &PKey<Private>) -> bool {
    if let Some(private_key_file) = &info.key_info.private_key_file {
        let pem = match &info.key_info.private_key_pass {
            Some(pass) => {
                key.private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), pass.as_bytes())
            }
            None => key.private_key_to_pem_pkcs8(),
        };

        let pem = match pem {
            Ok(pem) => pem,
            Err(e) => {
                error!("Failed to encode generated private key: {}", e);
                return false;
            }
        };

        if let Err(e) = std::fs::write(private_key_file, pem) {
            error!(
                "Failed to write generated private key to {}: {}",
                private_key_file.display(),
                e
            );
            return false;
        }
    }

    if let Some(public_key_file) = &info.key_info.public_key_file {
        match key.public_key_to_pem() {
            Ok(pem) => {
                if let Err(e) = std::fs::write(public_key_file, pem) {
                    error!(
                        "Failed to write generated public key to {}: {}",
                        public_key_file.display(),
                        e
                    );
                    return false;
                }
            }
            Err(e) => {
                error!("Failed to encode generated public key: {}", e);
                return false;
            }
        }
    }

    true
}

impl CryptoSupplier for OpensslSupplier {
    type X509Handle = X509;

    fn supplier_name() -> &'static str {
        "OpenSSL"
    }

    fn supports_custom_key_creation() -> bool {
        false
    }

    fn load_certificates(
        data: &[u8],
        encoding: EncodingFormat,
    ) -> Result<Vec<X509>, CertStoreError> {
        match encoding {
            EncodingFormat::Pem => X509::stack_from_pem(data)
                .map_err(|e| CertStoreError::CertificateLoad(e.to_string())),
            EncodingFormat::Der => {
                let certificate = X509::from_der(data)
                    .map_err(|e| CertStoreError::CertificateLoad(e.to_string()))?;
                Ok(vec![certificate])
            }
        }
    }

    fn x509_to_pem(handle: &X509) -> String {
        match handle.to_pem() {
            Ok(pem) => String::from_utf8_lossy(&pem).into_owned(),
            Err(e) => {
                error!("Could not PEM encode certificate: {}", e);
                String::new()
            }
        }
    }

    fn x509_get_common_name(handle: &X509) -> String {
        handle
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|data| data.to_string())
            .unwrap_or_default()
    }

    fn x509_get_responder_url(handle: &X509) -> String {
        let mut responder_url = String::new();

        if let Some(access_descriptions) = handle.authority_info() {
            for description in &access_descriptions {
                if description.method().nid() == Nid::AD_OCSP {
                    if let Some(uri) = description.location().uri() {
                        responder_url.push_str(uri);
                    }
                }
            }
        }

        if responder_url.is_empty() {
            warn!("Could not retrieve OCSP Responder URL from certificate");
        }

        responder_url
    }

    fn x509_get_serial_number(handle: &X509) -> String {
        let hex_serial = handle
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()));

        let mut serial = match hex_serial {
            Ok(serial) => serial.to_ascii_lowercase(),
            Err(e) => {
                error!("Could not read certificate serial: {}", e);
                return String::new();
            }
        };

        let stripped = serial.trim_start_matches('0');
        if stripped.is_empty() {
            serial.truncate(1);
        } else {
            serial = stripped.to_string();
        }
        serial
    }

    fn x509_get_issuer_name_hash(handle: &X509) -> String {
        let der = match handle.issuer_name().to_der() {
            Ok(der) => der,
            Err(e) => {
                error!("Could not encode issuer name: {}", e);
                return String::new();
            }
        };

        match hash(MessageDigest::sha256(), &der) {
            Ok(digest) => hex::encode(digest),
            Err(e) => {
                error!("Could not hash issuer name: {}", e);
                String::new()
            }
        }
    }

    fn x509_get_key_hash(handle: &X509) -> String {
        let spki_der = handle
            .public_key()
            .and_then(|key| key.public_key_to_der());

        let spki_der = match spki_der {
            Ok(der) => der,
            Err(e) => {
                error!("Could not extract certificate public key: {}", e);
                return String::new();
            }
        };

        let Some(bits) = subject_public_key_bits(&spki_der) else {
            error!("Could not locate subjectPublicKey bits");
            return String::new();
        };

        match hash(MessageDigest::sha256(), bits) {
            Ok(digest) => hex::encode(digest),
            Err(e) => {
                error!("Could not hash public key: {}", e);
                String::new()
            }
        }
    }

    fn x509_get_validity(handle: &X509) -> (i64, i64) {
        let now = match Asn1Time::days_from_now(0) {
            Ok(now) => now,
            Err(e) => {
                error!("Could not build reference time: {}", e);
                return (0, 0);
            }
        };

        let valid_in = now
            .diff(handle.not_before())
            .map(|d| i64::from(d.days) * 86400 + i64::from(d.secs))
            .unwrap_or(0);
        let valid_to = now
            .diff(handle.not_after())
            .map(|d| i64::from(d.days) * 86400 + i64::from(d.secs))
            .unwrap_or(0);

        (valid_in, valid_to)
    }

    fn x509_is_selfsigned(handle: &X509) -> bool {
        match handle.public_key() {
            Ok(key) => handle.verify(&key).unwrap_or(false),
            Err(_) => false,
        }
    }

    fn x509_is_child(child: &X509, parent: &X509) -> bool {
        if std::ptr::eq(child, parent) {
            return false;
        }

        let verified = || -> Result<bool, openssl::error::ErrorStack> {
            let mut builder = X509StoreBuilder::new()?;
            builder.add_cert(parent.clone())?;

            // A non-self-signed parent means we verify a partial chain
            if !Self::x509_is_selfsigned(parent) {
                builder.set_flags(X509VerifyFlags::PARTIAL_CHAIN)?;
            }

            let store = builder.build();
            let untrusted = Stack::new()?;
            let mut context = X509StoreContext::new()?;

            context.init(&store, child, &untrusted, |ctx| ctx.verify_cert())
        }();

        match verified {
            Ok(result) => result,
            Err(e) => {
                debug!("Certificate issued-by check error: {}", e);
                false
            }
        }
    }

    fn x509_is_equal(a: &X509, b: &X509) -> bool {
        match (a.to_der(), b.to_der()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    fn x509_get_key_usage_flags(handle: &X509) -> Vec<CertificateKeyUsageFlags> {
        use foreign_types::ForeignType;

        let as_ptr = |certificate: &X509| -> *mut openssl_sys::X509 { certificate.as_ptr() };

        let mut flags = Vec::new();

        // keyUsage BIT STRING, bit 0 is the MSB of the first content octet
        unsafe {
            let usage = openssl_sys::X509_get_ext_d2i(
                as_ptr(handle),
                openssl_sys::NID_key_usage,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            ) as *mut openssl_sys::ASN1_STRING;

            if !usage.is_null() {
                let data = openssl_sys::ASN1_STRING_get0_data(usage);
                let len = openssl_sys::ASN1_STRING_length(usage) as usize;
                let bytes = std::slice::from_raw_parts(data, len);

                let first = bytes.first().copied().unwrap_or(0);
                let second = bytes.get(1).copied().unwrap_or(0);

                let bit_flags = [
                    (first & 0x80, CertificateKeyUsageFlags::DigitalSignature),
                    (first & 0x40, CertificateKeyUsageFlags::NonRepudiation),
                    (first & 0x20, CertificateKeyUsageFlags::KeyEncipherment),
                    (first & 0x10, CertificateKeyUsageFlags::DataEncipherment),
                    (first & 0x08, CertificateKeyUsageFlags::KeyAgreement),
                    (first & 0x04, CertificateKeyUsageFlags::KeyCertSign),
                    (first & 0x02, CertificateKeyUsageFlags::CrlSign),
                    (first & 0x01, CertificateKeyUsageFlags::EncipherOnly),
                    (second & 0x80, CertificateKeyUsageFlags::DecipherOnly),
                ];
                for (bit, flag) in bit_flags {
                    if bit != 0 {
                        flags.push(flag);
                    }
                }

                openssl_sys::ASN1_STRING_free(usage);
            }
        }

        // extendedKeyUsage is a stack of OIDs
        unsafe extern "C" fn free_object(obj: *mut c_void) {
            openssl_sys::ASN1_OBJECT_free(obj as *mut openssl_sys::ASN1_OBJECT);
        }

        unsafe {
            let eku = openssl_sys::X509_get_ext_d2i(
                as_ptr(handle),
                openssl_sys::NID_ext_key_usage,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            ) as *mut openssl_sys::OPENSSL_STACK;

            if !eku.is_null() {
                let count = openssl_sys::OPENSSL_sk_num(eku);
                for i in 0..count {
                    let object =
                        openssl_sys::OPENSSL_sk_value(eku, i) as *mut openssl_sys::ASN1_OBJECT;
                    let nid = openssl_sys::OBJ_obj2nid(object);

                    let flag = match nid {
                        openssl_sys::NID_server_auth => Some(CertificateKeyUsageFlags::SslServer),
                        openssl_sys::NID_client_auth => Some(CertificateKeyUsageFlags::SslClient),
                        openssl_sys::NID_email_protect => Some(CertificateKeyUsageFlags::Smime),
                        openssl_sys::NID_code_sign => Some(CertificateKeyUsageFlags::CodeSign),
                        openssl_sys::NID_OCSP_sign => Some(CertificateKeyUsageFlags::OcspSign),
                        openssl_sys::NID_time_stamp => Some(CertificateKeyUsageFlags::Timestamp),
                        openssl_sys::NID_dvcs => Some(CertificateKeyUsageFlags::Dvcs),
                        openssl_sys::NID_anyExtendedKeyUsage => {
                            Some(CertificateKeyUsageFlags::AnyEku)
                        }
                        _ => None,
                    };
                    if let Some(flag) = flag {
                        flags.push(flag);
                    }
                }

                openssl_sys::OPENSSL_sk_pop_free(eku, Some(free_object));
            }
        }

        flags
    }

    fn x509_verify_certificate_chain(
        target: &X509,
        trusted: &[X509],
        untrusted_intermediates: &[X509],
        allow_future_certificates: bool,
    ) -> CertificateValidationResult {
        let verification = || -> Result<CertificateValidationResult, openssl::error::ErrorStack> {
            let mut builder = X509StoreBuilder::new()?;
            for anchor in trusted {
                builder.add_cert(anchor.clone())?;
            }

            if allow_future_certificates {
                // Expiry stays fatal; not-yet-valid certificates pass once the
                // time checks are disabled.
                let (_, valid_to) = Self::x509_get_validity(target);
                if valid_to < 0 {
                    return Ok(CertificateValidationResult::Expired);
                }
                builder.set_flags(X509VerifyFlags::NO_CHECK_TIME)?;
            }

            let store = builder.build();

            let mut untrusted = Stack::new()?;
            for intermediate in untrusted_intermediates {
                untrusted.push(intermediate.clone())?;
            }

            let mut context = X509StoreContext::new()?;
            context.init(&store, target, &untrusted, |ctx| {
                if ctx.verify_cert()? {
                    Ok(CertificateValidationResult::Valid)
                } else {
                    Ok(to_validation_result(ctx.error().as_raw()))
                }
            })
        }();

        match verification {
            Ok(result) => result,
            Err(e) => {
                error!("X509 chain verification setup error: {}", e);
                CertificateValidationResult::Unknown
            }
        }
    }

    fn x509_check_private_key(
        handle: &X509,
        private_key: &[u8],
        password: Option<&str>,
    ) -> KeyValidationResult {
        let key = PKey::private_key_from_pem_passphrase(
            private_key,
            password.unwrap_or_default().as_bytes(),
        );

        let key = match key {
            Ok(key) => key,
            Err(e) => {
                debug!("Could not load private key: {}. Password configured correctly?", e);
                return KeyValidationResult::KeyLoadFailure;
            }
        };

        let certificate_key = match handle.public_key() {
            Ok(certificate_key) => certificate_key,
            Err(e) => {
                error!("Could not extract certificate public key: {}", e);
                return KeyValidationResult::Unknown;
            }
        };

        if key.public_eq(&certificate_key) {
            KeyValidationResult::Valid
        } else {
            KeyValidationResult::Invalid
        }
    }

    fn x509_verify_signature(handle: &X509, signature: &[u8], digest: &[u8]) -> bool {
        let verified = || -> anyhow::Result<bool> {
            let public_key = handle.public_key()?;
            let mut ctx = PkeyCtx::new(&public_key)?;
            ctx.verify_init()?;
            ctx.set_signature_md(Md::sha256())?;
            Ok(ctx.verify(digest, signature)?)
        }();

        match verified {
            Ok(result) => result,
            Err(e) => {
                error!("Signature verification error: {}", e);
                false
            }
        }
    }

    fn x509_generate_csr(
        info: &CertificateSigningRequestInfo,
    ) -> (CertificateSignRequestResult, Option<String>) {
        if info.key_info.generate_on_custom && !Self::supports_custom_key_creation() {
            error!("Custom key provider requested but not supported by the OpenSSL supplier");
            return (CertificateSignRequestResult::KeyGenerationError, None);
        }

        let Some(key) = generate_key(info) else {
            return (CertificateSignRequestResult::KeyGenerationError, None);
        };

        if !export_key(info, &key) {
            return (CertificateSignRequestResult::KeyGenerationError, None);
        }

        let mut builder = match X509Req::builder() {
            Ok(builder) => builder,
            Err(_) => return (CertificateSignRequestResult::Unknown, None),
        };

        if builder.set_version(info.n_version).is_err() {
            return (CertificateSignRequestResult::VersioningError, None);
        }

        if builder.set_pubkey(&key).is_err() {
            return (CertificateSignRequestResult::PubkeyError, None);
        }

        let subject = || -> Result<_, openssl::error::ErrorStack> {
            let mut name = X509NameBuilder::new()?;
            name.append_entry_by_text("C", &info.country)?;
            name.append_entry_by_text("O", &info.organization)?;
            name.append_entry_by_text("CN", &info.common_name)?;
            name.append_entry_by_text("DC", "CPO")?;
            Ok(name.build())
        }();

        let subject = match subject {
            Ok(subject) => subject,
            Err(_) => return (CertificateSignRequestResult::FormatError, None),
        };

        if builder.set_subject_name(&subject).is_err() {
            return (CertificateSignRequestResult::FormatError, None);
        }

        let extensions = || -> Result<_, openssl::error::ErrorStack> {
            let mut extensions = Stack::new()?;
            extensions.push(
                KeyUsage::new()
                    .digital_signature()
                    .key_agreement()
                    .build()?,
            )?;
            extensions.push(BasicConstraints::new().critical().build()?)?;

            if info.dns_name.is_some() || info.ip_address.is_some() {
                let mut san = SubjectAlternativeName::new();
                if let Some(dns_name) = &info.dns_name {
                    san.dns(dns_name);
                }
                if let Some(ip_address) = &info.ip_address {
                    san.ip(ip_address);
                }
                extensions.push(san.build(&builder.x509v3_context(None))?)?;
            }

            Ok(extensions)
        }();

        let extensions = match extensions {
            Ok(extensions) => extensions,
            Err(_) => return (CertificateSignRequestResult::ExtensionsError, None),
        };

        if builder.add_extensions(&extensions).is_err() {
            return (CertificateSignRequestResult::ExtensionsError, None);
        }

        if builder.sign(&key, MessageDigest::sha256()).is_err() {
            return (CertificateSignRequestResult::Unknown, None);
        }

        match builder.build().to_pem() {
            Ok(pem) => (
                CertificateSignRequestResult::Valid,
                Some(String::from_utf8_lossy(&pem).into_owned()),
            ),
            Err(_) => (CertificateSignRequestResult::FormatError, None),
        }
    }

    fn digest_sha256_file(path: &Path) -> Option<Vec<u8>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                error!("Could not open file for digest {}: {}", path.display(), e);
                return None;
            }
        };

        let mut hasher = openssl::hash::Hasher::new(MessageDigest::sha256()).ok()?;
        let mut buffer = [0u8; 8192];

        loop {
            match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => hasher.update(&buffer[..read]).ok()?,
                Err(e) => {
                    error!("Could not read file for digest {}: {}", path.display(), e);
                    return None;
                }
            }
        }

        hasher.finish().ok().map(|digest| digest.to_vec())
    }

    fn base64_decode_to_bytes(data: &str) -> Option<Vec<u8>> {
        let stripped: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        base64::decode_block(&stripped).ok()
    }

    fn base64_decode_to_string(data: &str) -> Option<String> {
        Self::base64_decode_to_bytes(data).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    fn base64_encode_from_bytes(bytes: &[u8]) -> Option<String> {
        Some(base64::encode_block(bytes))
    }

    fn base64_encode_from_string(data: &str) -> Option<String> {
        Self::base64_encode_from_bytes(data.as_bytes())
    }

    #[cfg(unix)]
    fn hash_dir(dir: &Path) -> bool {
        use std::collections::HashMap;

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Could not iterate trust directory {}: {}", dir.display(), e);
                return false;
            }
        };

        let mut suffixes: HashMap<u32, u32> = HashMap::new();

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let extension = path.extension().and_then(|e| e.to_str());
            if extension != Some(crate::types::PEM_EXTENSION)
                && extension != Some(crate::types::DER_EXTENSION)
            {
                continue;
            }

            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            let encoding = if extension == Some(crate::types::DER_EXTENSION) {
                EncodingFormat::Der
            } else {
                EncodingFormat::Pem
            };

            let certificates = match Self::load_certificates(&data, encoding) {
                Ok(certificates) => certificates,
                Err(e) => {
                    warn!("Skipping non-certificate file {}: {}", path.display(), e);
                    continue;
                }
            };

            for certificate in certificates {
                let name_hash = certificate.subject_name_hash();
                let suffix = suffixes.entry(name_hash).or_insert(0);

                let link = dir.join(format!("{:08x}.{}", name_hash, suffix));
                *suffix += 1;

                if link.exists() {
                    continue;
                }

                if let Err(e) = std::os::unix::fs::symlink(&path, &link) {
                    error!("Could not create rehash link {}: {}", link.display(), e);
                    return false;
                }
            }
        }

        true
    }

    #[cfg(not(unix))]
    fn hash_dir(_dir: &Path) -> bool {
        false
    }
}
