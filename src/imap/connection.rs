//! IMAP connection establishment and TLS plumbing
//!
//! Implicit TLS is negotiated when the address port is 993 or "imaps",
//! otherwise the connection starts in plaintext and is upgraded with
//! STARTTLS. When the server rejects STARTTLS with "STARTTLS not
//! supported" and insecure fallback is enabled, the session continues
//! unencrypted.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Wrapper unifying TLS and plain TCP streams so the session type can
/// stay the same across the negotiated transport.
pub enum ImapStream {
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    Tcp(TcpStream),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tls(_) => f.write_str("ImapStream::Tls"),
            Self::Tcp(_) => f.write_str("ImapStream::Tcp"),
        }
    }
}

/// A logged-in IMAP session over TLS or plain TCP.
pub type ImapSession = async_imap::Session<ImapStream>;

/// Dial `address` (`host:port`), negotiate TLS and authenticate.
pub(crate) async fn connect(
    address: &str,
    user: &str,
    password: &str,
    allow_insecure: bool,
) -> Result<ImapSession> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        Error::Config(format!("invalid imap address {address:?}, expecting host:port"))
    })?;

    let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connecting to {address} timed out"),
            ))
        })??;

    let client = if port == "993" || port == "imaps" {
        debug!(server = address, tlsmode = "implicit", "connecting to imap server");
        let tls = tls_handshake(tcp, host, allow_insecure).await?;
        async_imap::Client::new(ImapStream::Tls(Box::new(tls)))
    } else {
        debug!(server = address, tlsmode = "explicit", "connecting to imap server");
        starttls(tcp, host, allow_insecure).await?
    };

    let session = client
        .login(user, password)
        .await
        .map_err(|(err, _client)| Error::Login(err))?;

    info!(server = address, "connection established, authentication succeeded");
    Ok(session)
}

/// Upgrade a plaintext connection with STARTTLS, optionally falling
/// back to an unencrypted session.
async fn starttls(
    tcp: TcpStream,
    host: &str,
    allow_insecure: bool,
) -> Result<async_imap::Client<ImapStream>> {
    let mut client = async_imap::Client::new(tcp);

    if let Err(err) = client.run_command_and_check_ok("STARTTLS", None).await {
        if allow_insecure && is_starttls_unsupported(&err) {
            warn!(
                error = %err,
                tlsmode = "none",
                "establishing secure connection failed, connecting without encryption"
            );
            let tcp = client.into_inner();
            return Ok(async_imap::Client::new(ImapStream::Tcp(tcp)));
        }

        return Err(Error::Tls(format!("STARTTLS failed: {err}")));
    }

    let tcp = client.into_inner();
    let tls = tls_handshake(tcp, host, allow_insecure).await?;

    Ok(async_imap::Client::new(ImapStream::Tls(Box::new(tls))))
}

fn is_starttls_unsupported(err: &async_imap::error::Error) -> bool {
    use async_imap::error::Error as ImapError;

    match err {
        ImapError::No(text) | ImapError::Bad(text) => text.contains("STARTTLS not supported"),
        _ => false,
    }
}

async fn tls_handshake(
    tcp: TcpStream,
    host: &str,
    allow_insecure: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|err| Error::Tls(format!("invalid server name {host:?}: {err}")))?;

    tls_connector(allow_insecure)
        .connect(server_name, tcp)
        .await
        .map_err(|err| Error::Tls(err.to_string()))
}

fn tls_connector(allow_insecure: bool) -> TlsConnector {
    let builder = rustls::ClientConfig::builder();

    let config = if allow_insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
}

/// Certificate verifier that accepts all certificates, used with
/// `AllowInsecure` for bridge-style local servers with self-signed
/// certificates.
#[derive(Debug)]
struct AcceptAnyCertVerifier;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
