// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Mutual TLS for the admin listener.
//!
//! Every client must present a certificate chaining to the configured root.
//! The verified certificate's common name is then checked against the
//! accepted-CN allow-list.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use subtle::ConstantTimeEq;

use crate::error::{AdminError, Result};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| AdminError::Certificate(format!("cannot open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| {
            AdminError::Certificate(format!("bad certificate in {}: {}", path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(AdminError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| AdminError::Certificate(format!("cannot open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| {
            AdminError::Certificate(format!("bad private key in {}: {}", path.display(), e))
        })?
        .ok_or_else(|| {
            AdminError::Certificate(format!("no private key found in {}", path.display()))
        })
}

fn root_store(root_cert: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(root_cert)? {
        roots
            .add(cert)
            .map_err(|e| AdminError::Certificate(format!("unusable root certificate: {}", e)))?;
    }
    Ok(roots)
}

/// Server configuration requiring a client certificate signed by `root_cert`.
pub fn server_config(cert: &Path, key: &Path, root_cert: &Path) -> Result<Arc<ServerConfig>> {
    let provider = provider();
    let roots = Arc::new(root_store(root_cert)?);
    let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
        .build()
        .map_err(|e| AdminError::Tls(e.to_string()))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AdminError::Tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| AdminError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Client configuration presenting `cert`/`key` and trusting `root_cert`.
pub fn client_config(cert: &Path, key: &Path, root_cert: &Path) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| AdminError::Tls(e.to_string()))?
        .with_root_certificates(root_store(root_cert)?)
        .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| AdminError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Server name for a host string, for client connections.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| AdminError::Tls(format!("invalid server name {}: {}", host, e)))
}

/// Common name from a DER certificate's subject.
pub fn common_name(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

/// Accepted client common names. Empty means any verified client.
#[derive(Debug, Clone, Default)]
pub struct CnAllowList {
    names: Vec<String>,
}

impl CnAllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a peer with common name `cn` may connect.
    pub fn permits(&self, cn: Option<&str>) -> bool {
        if self.names.is_empty() {
            return true;
        }
        let Some(cn) = cn else {
            return false;
        };
        // Scan the whole list so the match position is not observable.
        let mut found = subtle::Choice::from(0u8);
        for name in &self.names {
            found |= name.as_bytes().ct_eq(cn.as_bytes());
        }
        found.into()
    }
}
