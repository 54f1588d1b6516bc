// Copyright 2025 the ltsm-remote authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! TLS layer for the VeNCrypt sub-handshake.
//!
//! Two modes:
//!
//! - **x509**: server certificate and key from PEM files, optional client
//!   certificate verification against a CA file.
//! - **anonymous**: rustls ships no ANON-DH ciphersuites, so anonymous
//!   service uses an ephemeral self-signed certificate generated at
//!   startup; the viewer pairs it with a verifier that accepts any
//!   certificate. The wire negotiation (VeNCrypt TLSNone/TLSVnc) is
//!   unchanged.
//!
//! The stream is upgraded exactly once per session, mid-handshake; after
//! that the engine routes every byte through the TLS record layer.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{LtsmError, Result};
use crate::stream::Transport;

/// Security configuration shared by the handshake and TLS layers.
#[derive(Debug, Clone, Default)]
pub struct SecurityInfo {
    /// Offer `None` security.
    pub auth_none: bool,
    /// Offer classic VNC authentication.
    pub auth_vnc: bool,
    /// Newline-delimited password file for VNC auth.
    pub passwd_file: Option<std::path::PathBuf>,
    /// Offer VeNCrypt.
    pub auth_vencrypt: bool,
    /// Anonymous TLS (ephemeral certificate) instead of x509.
    pub tls_anon: bool,
    /// Requested priority string; recorded and logged, the cipher policy
    /// itself is fixed by rustls.
    pub tls_priority: Option<String>,
    pub ca_file: Option<std::path::PathBuf>,
    pub cert_file: Option<std::path::PathBuf>,
    pub key_file: Option<std::path::PathBuf>,
}

impl SecurityInfo {
    /// Server defaults: VeNCrypt with anonymous TLS, VNC auth when a
    /// password file is present.
    pub fn server_default() -> Self {
        Self {
            auth_none: true,
            auth_vencrypt: true,
            tls_anon: true,
            ..Self::default()
        }
    }
}

fn load_certificates(path: &Path) -> Result<Vec<Certificate>> {
    let pem = fs::File::open(path)?;
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| LtsmError::Tls(format!("bad certificate file: {e}")))?;
    if certs.is_empty() {
        return Err(LtsmError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let mut keys = rustls_pemfile::rsa_private_keys(&mut reader)
        .map_err(|e| LtsmError::Tls(format!("bad key file: {e}")))?;
    if keys.is_empty() {
        // rsa_private_keys() returns an empty list when the key is pkcs8.
        let mut reader = BufReader::new(fs::File::open(path)?);
        keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .map_err(|e| LtsmError::Tls(format!("bad key file: {e}")))?;
    }
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| LtsmError::Tls(format!("no private key in {}", path.display())))
}

/// Generates an ephemeral self-signed certificate for anonymous mode.
fn ephemeral_identity() -> Result<(Vec<Certificate>, PrivateKey)> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["ltsm".into()])
            .map_err(|e| LtsmError::Tls(format!("ephemeral cert generation: {e}")))?;
    let der = cert.der().to_vec();
    let key = key_pair.serialize_der();
    Ok((vec![Certificate(der)], PrivateKey(key)))
}

/// Builds the server-side acceptor from the security configuration.
pub fn make_acceptor(security: &SecurityInfo) -> Result<TlsAcceptor> {
    let (certs, key) = match (&security.cert_file, &security.key_file) {
        (Some(cert), Some(keyf)) if !security.tls_anon => {
            (load_certificates(cert)?, load_private_key(keyf)?)
        }
        _ => ephemeral_identity()?,
    };

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| LtsmError::Tls(format!("server config: {e}")))?;

    if let Some(priority) = &security.tls_priority {
        log::info!("tls priority requested: {priority} (cipher policy fixed by rustls)");
    }
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Upgrades a plain server-side transport to TLS. Upgrading an already
/// upgraded transport is a protocol error: the switch happens once.
pub async fn accept(acceptor: &TlsAcceptor, transport: Transport) -> Result<Transport> {
    match transport {
        Transport::Plain(tcp) => {
            let tls = acceptor
                .accept(tcp)
                .await
                .map_err(|e| LtsmError::Tls(format!("handshake: {e}")))?;
            Ok(Transport::Tls(Box::new(tls)))
        }
        _ => Err(LtsmError::Protocol("TLS layer already active".into())),
    }
}

/// Certificate verifier for anonymous mode: accepts whatever the server
/// presents. Encryption without authentication, exactly the anonymous
/// Diffie-Hellman trust model.
struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Builds the viewer-side connector: CA-verified when a CA file is given,
/// pass-all otherwise (anonymous mode).
pub fn make_connector(security: &SecurityInfo) -> Result<TlsConnector> {
    let builder = rustls::ClientConfig::builder().with_safe_defaults();

    let config = if let Some(ca) = &security.ca_file {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certificates(ca)? {
            roots
                .add(&cert)
                .map_err(|e| LtsmError::Tls(format!("bad CA certificate: {e}")))?;
        }
        let builder = builder.with_root_certificates(roots);
        match (&security.cert_file, &security.key_file) {
            (Some(cert), Some(keyf)) => builder
                .with_client_auth_cert(load_certificates(cert)?, load_private_key(keyf)?)
                .map_err(|e| LtsmError::Tls(format!("client cert: {e}")))?,
            _ => builder.with_no_client_auth(),
        }
    } else {
        builder
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Upgrades a plain client-side transport to TLS.
pub async fn connect(
    connector: &TlsConnector,
    server_name: &str,
    transport: Transport,
) -> Result<Transport> {
    match transport {
        Transport::Plain(tcp) => {
            let name = rustls::ServerName::try_from(server_name)
                .unwrap_or_else(|_| rustls::ServerName::try_from("ltsm").expect("static name"));
            let tls = connector
                .connect(name, tcp)
                .await
                .map_err(|e| LtsmError::Tls(format!("handshake: {e}")))?;
            Ok(Transport::TlsClient(Box::new(tls)))
        }
        _ => Err(LtsmError::Protocol("TLS layer already active".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_identity_generates() {
        let (certs, key) = ephemeral_identity().unwrap();
        assert_eq!(certs.len(), 1);
        assert!(!certs[0].0.is_empty());
        assert!(!key.0.is_empty());
    }

    #[test]
    fn acceptor_from_anon_defaults() {
        let sec = SecurityInfo::server_default();
        assert!(make_acceptor(&sec).is_ok());
    }

    #[test]
    fn connector_without_ca_is_pass_all() {
        let sec = SecurityInfo::default();
        assert!(make_connector(&sec).is_ok());
    }
}
