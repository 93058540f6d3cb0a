//! Socket abstraction: plain TCP or a TLS-wrapped stream, plus the
//! rustls config plumbing for both sides of the handshake.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{TlsClientConfig, TlsServerConfig};
use crate::error::TetherError;

// ── NetStream ────────────────────────────────────────────────────

/// The session's byte stream: plain TCP, or TLS in either role.
pub(crate) enum NetStream {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ── PEM loading ──────────────────────────────────────────────────

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TetherError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TetherError::Config(format!("cannot open certificate file {path}: {e}")))?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut io::BufReader::new(file)).collect();
    let certs = certs.map_err(|e| TetherError::Config(format!("invalid pem in {path}: {e}")))?;
    if certs.is_empty() {
        return Err(TetherError::Config(format!("no certificates in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TetherError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TetherError::Config(format!("cannot open key file {path}: {e}")))?;
    rustls_pemfile::private_key(&mut io::BufReader::new(file))
        .map_err(|e| TetherError::Config(format!("invalid pem in {path}: {e}")))?
        .ok_or_else(|| TetherError::Config(format!("no private key in {path}")))
}

fn load_roots(path: &str) -> Result<RootCertStore, TetherError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TetherError::Config(format!("invalid ca certificate in {path}: {e}")))?;
    }
    Ok(roots)
}

// ── Acceptor / connector construction ────────────────────────────

/// Build the server-side TLS acceptor. Server-only certificates by
/// default; setting `client_ca_path` requires and verifies client
/// certificates.
pub(crate) fn tls_acceptor(cfg: &TlsServerConfig) -> Result<TlsAcceptor, TetherError> {
    let certs = load_certs(&cfg.cert_path)?;
    let key = load_key(&cfg.key_path)?;

    let builder = match &cfg.client_ca_path {
        Some(ca_path) => {
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(load_roots(
                ca_path,
            )?))
            .build()
            .map_err(|e| TetherError::Tls(e.to_string()))?;
            rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => rustls::ServerConfig::builder().with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TetherError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the client-side TLS connector.
pub(crate) fn tls_connector(cfg: &TlsClientConfig) -> Result<TlsConnector, TetherError> {
    let wants_cert = if cfg.accept_invalid_certs {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
    } else {
        let ca_path = cfg.ca_path.as_deref().ok_or_else(|| {
            TetherError::Config(
                "tls requires ca_path unless accept_invalid_certs is set".into(),
            )
        })?;
        rustls::ClientConfig::builder().with_root_certificates(load_roots(ca_path)?)
    };

    let config = match (&cfg.cert_path, &cfg.key_path) {
        (Some(cert), Some(key)) => wants_cert
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| TetherError::Tls(e.to_string()))?,
        (None, None) => wants_cert.with_no_client_auth(),
        _ => {
            return Err(TetherError::Config(
                "cert_path and key_path must be set together".into(),
            ))
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// The name presented for SNI and certificate validation.
pub(crate) fn tls_server_name(
    cfg: &TlsClientConfig,
    host: &str,
) -> Result<ServerName<'static>, TetherError> {
    let name = cfg.server_name.clone().unwrap_or_else(|| host.to_string());
    ServerName::try_from(name)
        .map_err(|_| TetherError::Config("invalid tls server name".into()))
}

// ── Permissive verifier ──────────────────────────────────────────

/// Accepts any server certificate. Only reachable through
/// `accept_invalid_certs`.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
