// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Signed content gate for the startup folder.
//!
//! The content folder holds a signature manifest (JSON object mapping a
//! relative filename to a hex-encoded RSA-PSS signature) and a PEM root
//! certificate. A file is trusted only when its manifest signature verifies
//! against its exact bytes with the root certificate's public key.
//!
//! Only [`LoadResult::Ok`] means trusted. Every other result must be treated
//! as untrusted by the caller.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pss, RsaPublicKey};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{AdminError, Result};

/// Default manifest filename inside the content folder.
pub const SIGNATURE_MANIFEST: &str = "signature.json";

/// Default root certificate filename inside the content folder.
pub const ROOT_CERT: &str = "rootCA.pem";

/// SHA-256 output length, the `hLen` of the PSS encoding.
const DIGEST_LEN: usize = 32;

/// Outcome of loading a piece of protected content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    Ok,
    NotManaged,
    NoSuchContent,
    NotSigned,
    InvalidSignature,
    InvalidContent,
}

impl LoadResult {
    pub fn is_trusted(&self) -> bool {
        matches!(self, LoadResult::Ok)
    }
}

impl fmt::Display for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadResult::Ok => "OK",
            LoadResult::NotManaged => "NOT_MANAGED",
            LoadResult::NoSuchContent => "NO_SUCH_CONTENT",
            LoadResult::NotSigned => "NOT_SIGNED",
            LoadResult::InvalidSignature => "INVALID_SIGNATURE",
            LoadResult::InvalidContent => "INVALID_CONTENT",
        };
        write!(f, "{}", s)
    }
}

/// Loaded manifest and root key for one content folder.
pub struct SecurityContentManager {
    folder: PathBuf,
    signatures: HashMap<String, Vec<u8>>,
    public_key: RsaPublicKey,
    salt_len: usize,
}

impl fmt::Debug for SecurityContentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContentManager")
            .field("folder", &self.folder)
            .field("signed_files", &self.signatures.len())
            .finish()
    }
}

impl SecurityContentManager {
    /// Load the manifest and root certificate from `folder`.
    ///
    /// Returns `Ok(None)` when either file is missing, which leaves the
    /// folder unmanaged.
    pub fn load(folder: &Path, manifest_name: &str, root_cert_name: &str) -> Result<Option<Self>> {
        let manifest_path = folder.join(manifest_name);
        let root_path = folder.join(root_cert_name);
        if !manifest_path.is_file() || !root_path.is_file() {
            return Ok(None);
        }

        let signatures = parse_manifest(&std::fs::read(&manifest_path)?)?;
        let public_key = root_public_key(&std::fs::read(&root_path)?)?;
        let salt_len = max_salt_len(&public_key)?;

        tracing::info!(
            folder = %folder.display(),
            signed_files = signatures.len(),
            "security content loaded"
        );
        Ok(Some(Self {
            folder: folder.to_path_buf(),
            signatures,
            public_key,
            salt_len,
        }))
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Whether the manifest lists `name`.
    pub fn is_signed(&self, name: &str) -> bool {
        self.signatures.contains_key(name)
    }

    pub fn load_content(&self, name: &str) -> (Option<Vec<u8>>, LoadResult) {
        let Some(path) = content_path(&self.folder, name) else {
            tracing::warn!(file = name, "rejected content path");
            return (None, LoadResult::NoSuchContent);
        };

        let data = match std::fs::read(&path) {
            Ok(data) if !data.is_empty() => data,
            _ => return (None, LoadResult::NoSuchContent),
        };

        let Some(signature) = self.signatures.get(name) else {
            return (Some(data), LoadResult::NotSigned);
        };

        let digest = Sha256::digest(&data);
        let scheme = Pss::new_with_salt::<Sha256>(self.salt_len);
        match self.public_key.verify(scheme, &digest, signature) {
            Ok(()) => (Some(data), LoadResult::Ok),
            Err(e) => {
                tracing::warn!(file = name, error = %e, "content signature verification failed");
                (Some(data), LoadResult::InvalidSignature)
            }
        }
    }
}

/// Explicitly constructed content service. Configured at most once.
#[derive(Debug, Default)]
pub struct SecurityContentService {
    manager: OnceLock<Option<SecurityContentManager>>,
}

impl SecurityContentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize from `folder`.
    ///
    /// Returns `Ok(true)` if this call initialized the service and `Ok(false)`
    /// if it had already been initialized; the first successful call wins.
    /// Missing manifest or root certificate is not an error: the service is
    /// initialized but every lookup reports [`LoadResult::NotManaged`]. A
    /// manifest or certificate that exists but cannot be parsed is an error
    /// and leaves the service uninitialized.
    pub fn initialize(
        &self,
        folder: &Path,
        manifest_name: &str,
        root_cert_name: &str,
    ) -> Result<bool> {
        if self.manager.get().is_some() {
            return Ok(false);
        }
        let manager = SecurityContentManager::load(folder, manifest_name, root_cert_name)?;
        if manager.is_none() {
            tracing::info!(
                folder = %folder.display(),
                "no signature manifest; content is not managed"
            );
        }
        Ok(self.manager.set(manager).is_ok())
    }

    pub fn is_initialized(&self) -> bool {
        self.manager.get().is_some()
    }

    /// Whether a manifest and root certificate were loaded.
    pub fn is_configured(&self) -> bool {
        matches!(self.manager.get(), Some(Some(_)))
    }

    pub fn manager(&self) -> Option<&SecurityContentManager> {
        self.manager.get().and_then(Option::as_ref)
    }

    /// Raw bytes of `name` with their trust status.
    pub fn load_content(&self, name: &str) -> (Option<Vec<u8>>, LoadResult) {
        match self.manager() {
            Some(manager) => manager.load_content(name),
            None => (None, LoadResult::NotManaged),
        }
    }

    /// Parse `name` as UTF-8 JSON.
    ///
    /// Undecodable content yields [`LoadResult::InvalidContent`] regardless of
    /// its signature status; otherwise the content result passes through.
    pub fn load_json(&self, name: &str) -> (Option<Value>, LoadResult) {
        let (data, result) = self.load_content(name);
        let Some(data) = data else {
            return (None, result);
        };
        let parsed = std::str::from_utf8(&data)
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(text).ok());
        match parsed {
            Some(value) => (Some(value), result),
            None => (None, LoadResult::InvalidContent),
        }
    }
}

/// Resolve a manifest-relative name, refusing anything outside the folder.
fn content_path(folder: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    let relative = Path::new(name);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return None;
    }
    Some(folder.join(relative))
}

fn parse_manifest(raw: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
    let entries: HashMap<String, String> = serde_json::from_slice(raw)
        .map_err(|e| AdminError::Manifest(format!("not a filename to signature map: {}", e)))?;
    entries
        .into_iter()
        .map(|(name, sig)| {
            hex::decode(sig.trim())
                .map(|bytes| (name.clone(), bytes))
                .map_err(|e| AdminError::Manifest(format!("bad signature for {}: {}", name, e)))
        })
        .collect()
}

fn root_public_key(pem_bytes: &[u8]) -> Result<RsaPublicKey> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_bytes)
        .map_err(|e| AdminError::Certificate(format!("root certificate is not PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| AdminError::Certificate(format!("root certificate is not X.509: {}", e)))?;
    RsaPublicKey::from_public_key_der(cert.public_key().raw)
        .map_err(|e| AdminError::Certificate(format!("root certificate key is not RSA: {}", e)))
}

/// Largest PSS salt for the key: `emLen - hLen - 2`.
pub fn max_salt_len(key: &RsaPublicKey) -> Result<usize> {
    let em_bits = key.n().bits().saturating_sub(1);
    let em_len = (em_bits + 7) / 8;
    em_len
        .checked_sub(DIGEST_LEN + 2)
        .ok_or_else(|| AdminError::Certificate("root key too small for RSA-PSS/SHA-256".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use rsa::RsaPrivateKey;
    use std::fs;
    use std::sync::OnceLock;
    use tempfile::TempDir;

    fn root_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap())
    }

    fn root_cert_pem(key: &RsaPrivateKey) -> String {
        let pkcs8 = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let key_pair = rcgen::KeyPair::from_pem(&pkcs8).unwrap();
        let params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.self_signed(&key_pair).unwrap().pem()
    }

    fn sign(key: &RsaPrivateKey, data: &[u8]) -> String {
        let salt = max_salt_len(&key.to_public_key()).unwrap();
        let digest = Sha256::digest(data);
        let sig = key
            .sign_with_rng(&mut rand::rngs::OsRng, Pss::new_with_salt::<Sha256>(salt), &digest)
            .unwrap();
        hex::encode(sig)
    }

    /// Folder with `signed` files listed in the manifest and `unsigned` ones not.
    fn content_folder(signed: &[(&str, &[u8])], unsigned: &[(&str, &[u8])]) -> TempDir {
        let dir = TempDir::new().unwrap();
        let key = root_key();
        let mut manifest = serde_json::Map::new();
        for (name, data) in signed {
            fs::write(dir.path().join(name), data).unwrap();
            manifest.insert(name.to_string(), Value::String(sign(key, data)));
        }
        for (name, data) in unsigned {
            fs::write(dir.path().join(name), data).unwrap();
        }
        fs::write(
            dir.path().join(SIGNATURE_MANIFEST),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
        fs::write(dir.path().join(ROOT_CERT), root_cert_pem(key)).unwrap();
        dir
    }

    fn service(dir: &TempDir) -> SecurityContentService {
        let service = SecurityContentService::new();
        assert!(service.initialize(dir.path(), SIGNATURE_MANIFEST, ROOT_CERT).unwrap());
        service
    }

    #[test]
    fn test_signed_content_round_trip() {
        let dir = content_folder(&[("fed_server.json", br#"{"servers": []}"#.as_slice())], &[]);
        let service = service(&dir);

        let (data, result) = service.load_content("fed_server.json");
        assert_eq!(result, LoadResult::Ok);
        assert_eq!(data.unwrap(), br#"{"servers": []}"#);

        let (value, result) = service.load_json("fed_server.json");
        assert_eq!(result, LoadResult::Ok);
        assert_eq!(value.unwrap()["servers"], serde_json::json!([]));
    }

    #[test]
    fn test_tampered_content_fails_verification() {
        let dir = content_folder(&[("authorization.json", br#"{"rules": 1}"#.as_slice())], &[]);
        let service = service(&dir);
        fs::write(dir.path().join("authorization.json"), br#"{"rules": 2}"#).unwrap();

        let (data, result) = service.load_content("authorization.json");
        assert_eq!(result, LoadResult::InvalidSignature);
        assert!(!result.is_trusted());
        assert!(data.is_some());
    }

    #[test]
    fn test_missing_and_unsigned_content() {
        let dir = content_folder(
            &[("a.json", b"{}".as_slice())],
            &[("b.json", b"{}".as_slice()), ("empty.json", b"".as_slice())],
        );
        let service = service(&dir);

        assert_eq!(service.load_content("b.json"), (Some(b"{}".to_vec()), LoadResult::NotSigned));
        assert_eq!(service.load_content("empty.json"), (None, LoadResult::NoSuchContent));

        fs::remove_file(dir.path().join("a.json")).unwrap();
        assert_eq!(service.load_content("a.json"), (None, LoadResult::NoSuchContent));
    }

    #[test]
    fn test_paths_outside_folder_are_rejected() {
        let dir = content_folder(&[("a.json", b"{}".as_slice())], &[]);
        let service = service(&dir);

        assert_eq!(service.load_content("../a.json").1, LoadResult::NoSuchContent);
        assert_eq!(service.load_content("/etc/passwd").1, LoadResult::NoSuchContent);
        assert_eq!(service.load_content("").1, LoadResult::NoSuchContent);
    }

    #[test]
    fn test_invalid_json_is_invalid_content_even_when_signed() {
        let dir = content_folder(
            &[("bad.json", b"{not json".as_slice())],
            &[("latin1.json", [0xffu8, 0xfe].as_slice())],
        );
        let service = service(&dir);

        assert_eq!(service.load_content("bad.json").1, LoadResult::Ok);
        assert_eq!(service.load_json("bad.json"), (None, LoadResult::InvalidContent));
        assert_eq!(service.load_json("latin1.json"), (None, LoadResult::InvalidContent));
    }

    #[test]
    fn test_unconfigured_service_is_not_managed() {
        let uninitialized = SecurityContentService::new();
        assert_eq!(uninitialized.load_content("x.json"), (None, LoadResult::NotManaged));

        let empty = TempDir::new().unwrap();
        fs::write(empty.path().join("x.json"), b"{}").unwrap();
        let service = SecurityContentService::new();
        assert!(service.initialize(empty.path(), SIGNATURE_MANIFEST, ROOT_CERT).unwrap());
        assert!(service.is_initialized());
        assert!(!service.is_configured());
        assert_eq!(service.load_content("x.json"), (None, LoadResult::NotManaged));
        assert_eq!(service.load_json("x.json"), (None, LoadResult::NotManaged));
    }

    #[test]
    fn test_first_initialization_wins() {
        let signed = content_folder(&[("a.json", b"{}".as_slice())], &[]);
        let other = TempDir::new().unwrap();

        let service = SecurityContentService::new();
        assert!(service.initialize(signed.path(), SIGNATURE_MANIFEST, ROOT_CERT).unwrap());
        assert!(!service.initialize(other.path(), SIGNATURE_MANIFEST, ROOT_CERT).unwrap());
        assert_eq!(service.manager().unwrap().folder(), signed.path());
    }

    #[test]
    fn test_corrupt_manifest_is_an_error() {
        let dir = content_folder(&[("a.json", b"{}".as_slice())], &[]);
        fs::write(dir.path().join(SIGNATURE_MANIFEST), b"[1, 2, 3]").unwrap();

        let service = SecurityContentService::new();
        let err = service
            .initialize(dir.path(), SIGNATURE_MANIFEST, ROOT_CERT)
            .unwrap_err();
        assert!(matches!(err, AdminError::Manifest(_)));
        assert!(!service.is_initialized());
    }

    #[test]
    fn test_max_salt_len_for_2048_bit_key() {
        let key = root_key().to_public_key();
        assert_eq!(max_salt_len(&key).unwrap(), 256 - 32 - 2);
    }
}
