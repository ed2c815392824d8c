// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use fladmin::proto::{self, Reply};
use fladmin::registry::CommandRegistry;
use fladmin::security::tls;
use fladmin::server::{AdminServer, ServerOptions, TlsFiles};

// =============================================================================
// SERVERS
// =============================================================================

pub fn plain_options() -> ServerOptions {
    ServerOptions {
        host: "127.0.0.1".into(),
        port: 0,
        request_timeout: Duration::from_secs(5),
        ..ServerOptions::default()
    }
}

pub async fn start_server(options: ServerOptions, registry: Arc<CommandRegistry>) -> AdminServer {
    let server = AdminServer::bind(options, registry).await.unwrap();
    server.start().unwrap();
    server
}

/// One plaintext request/reply exchange.
pub async fn send(addr: SocketAddr, command: &str, token: Option<&str>) -> Reply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    proto::exchange(&mut stream, command, token).await.unwrap()
}

/// Send raw bytes and decode whatever comes back.
pub async fn send_raw(addr: SocketAddr, bytes: &[u8]) -> Reply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    stream.flush().await.unwrap();
    let raw = proto::read_message(&mut stream, usize::MAX).await.unwrap();
    proto::decode_reply(&raw).unwrap()
}

// =============================================================================
// TEST PKI
// =============================================================================

/// A certificate authority with PEM files written to a temp directory.
pub struct TestPki {
    pub dir: TempDir,
    ca_key: KeyPair,
    ca_cert: Certificate,
}

/// Paths of an issued certificate and its key.
pub struct Identity {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TestPki {
    pub fn new(name: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.distinguished_name.push(DnType::CommonName, name);
        let ca_cert = params.self_signed(&ca_key).unwrap();
        std::fs::write(dir.path().join("rootCA.pem"), ca_cert.pem()).unwrap();
        Self { dir, ca_key, ca_cert }
    }

    pub fn root_cert(&self) -> PathBuf {
        self.dir.path().join("rootCA.pem")
    }

    fn issue(&self, file_stem: &str, cn: &str, purpose: ExtendedKeyUsagePurpose) -> Identity {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.extended_key_usages = vec![purpose];
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        let identity = Identity {
            cert: self.dir.path().join(format!("{}.crt", file_stem)),
            key: self.dir.path().join(format!("{}.key", file_stem)),
        };
        std::fs::write(&identity.cert, cert.pem()).unwrap();
        std::fs::write(&identity.key, key.serialize_pem()).unwrap();
        identity
    }

    pub fn server(&self) -> Identity {
        self.issue("server", "server", ExtendedKeyUsagePurpose::ServerAuth)
    }

    pub fn client(&self, cn: &str) -> Identity {
        self.issue(cn, cn, ExtendedKeyUsagePurpose::ClientAuth)
    }

    pub fn server_tls_files(&self) -> TlsFiles {
        let server = self.server();
        TlsFiles {
            cert: server.cert,
            key: server.key,
            root_cert: self.root_cert(),
        }
    }
}

/// One request/reply exchange over mutual TLS.
pub async fn send_tls(
    addr: SocketAddr,
    client: &Identity,
    trusted_root: &std::path::Path,
    command: &str,
    token: Option<&str>,
) -> fladmin::Result<Reply> {
    let config = tls::client_config(&client.cert, &client.key, trusted_root)?;
    let connector = TlsConnector::from(config);
    let tcp = TcpStream::connect(addr).await?;
    let mut stream = connector.connect(tls::server_name("localhost")?, tcp).await?;
    proto::exchange(&mut stream, command, token).await
}
