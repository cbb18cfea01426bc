//! Optional TLS wrapping for the TCP transport.
//!
//! Three modes: off, auto (the server generates an ephemeral self-signed
//! RSA-2048 certificate at startup), and custom (operator-supplied PEM cert
//! and key, presented as a client certificate on the connecting side).
//!
//! Peer verification is disabled on both sides by design: the shared
//! password is the real authenticator, TLS only provides transport privacy.
//! This must be stated in operator-facing material.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::link::BoxLink;

/// Subject common name of auto-generated certificates.
const AUTO_CERT_CN: &str = "serial-bridge";
/// Auto-generated certificate lifetime in days.
const AUTO_CERT_DAYS: i64 = 365;
/// On-disk names of the ephemeral certificate pair.
const AUTO_CERT_FILE: &str = "temp.crt";
const AUTO_KEY_FILE: &str = "temp.key";

/// TLS operating mode, from `--sec` / `--secauto` / `--cert` / `--key`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plain TCP.
    #[default]
    Off,
    /// TLS with a certificate generated at startup (server side) or no
    /// client certificate (connecting side).
    Auto,
    /// TLS with operator-supplied PEM files.
    Custom {
        /// Path to the PEM certificate chain.
        cert: PathBuf,
        /// Path to the PEM private key.
        key: PathBuf,
    },
}

impl TlsMode {
    /// True unless TLS is off.
    pub fn enabled(&self) -> bool {
        !matches!(self, TlsMode::Off)
    }
}

/// Unlinks the ephemeral certificate pair when dropped.
///
/// The rustls config holds the material in memory, so removing the files
/// mid-session never affects an established or future connection.
#[derive(Debug)]
pub struct EphemeralCertGuard {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl Drop for EphemeralCertGuard {
    fn drop(&mut self) {
        for path in [&self.cert_path, &self.key_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("could not remove {}: {e}", path.display());
                }
            }
        }
    }
}

/// Server-side TLS state: an acceptor plus the cleanup guard in auto mode.
pub struct ServerTls {
    acceptor: TlsAcceptor,
    _ephemeral: Option<EphemeralCertGuard>,
}

impl ServerTls {
    /// Build the acceptor for `mode`; `None` when TLS is off.
    pub fn from_mode(mode: &TlsMode) -> Result<Option<Self>> {
        let (certs, key, guard) = match mode {
            TlsMode::Off => return Ok(None),
            TlsMode::Auto => {
                let (certs, key, guard) = generate_ephemeral()?;
                (certs, key, Some(guard))
            }
            TlsMode::Custom { cert, key } => {
                let (certs, key) = load_pem_pair(cert, key)?;
                (certs, key, None)
            }
        };
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("building TLS server config")?;
        Ok(Some(Self { acceptor: TlsAcceptor::from(Arc::new(config)), _ephemeral: guard }))
    }

    /// Run the server-side handshake.
    pub async fn accept(&self, stream: TcpStream) -> Result<BoxLink> {
        let tls = self.acceptor.accept(stream).await.context("TLS handshake failed")?;
        Ok(Box::new(tls))
    }
}

/// Connecting-side TLS state.
pub struct ClientTls {
    connector: TlsConnector,
}

impl ClientTls {
    /// Build the connector for `mode`; `None` when TLS is off.
    ///
    /// `Custom` presents the PEM pair as a client certificate; `Auto` offers
    /// none. Neither verifies the server certificate.
    pub fn from_mode(mode: &TlsMode) -> Result<Option<Self>> {
        let verifier = Arc::new(AcceptAnyServerCert::new());
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier);
        let config = match mode {
            TlsMode::Off => return Ok(None),
            TlsMode::Auto => builder.with_no_client_auth(),
            TlsMode::Custom { cert, key } => {
                let (certs, key) = load_pem_pair(cert, key)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .context("building TLS client auth")?
            }
        };
        Ok(Some(Self { connector: TlsConnector::from(Arc::new(config)) }))
    }

    /// Run the connecting-side handshake.
    pub async fn connect(&self, host: &str, stream: TcpStream) -> Result<BoxLink> {
        let name = ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid TLS server name {host:?}"))?;
        let tls = self.connector.connect(name, stream).await.context("TLS handshake failed")?;
        Ok(Box::new(tls))
    }
}

/// Server certificate verifier that accepts anything.
///
/// Deliberate: authentication happens through the shared password, and
/// server certificates are self-signed throwaways in the common deployment.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: CryptoProvider,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self { provider: rustls::crypto::aws_lc_rs::default_provider() }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Generate the ephemeral RSA-2048 self-signed pair and write it to disk.
fn generate_ephemeral() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, EphemeralCertGuard)>
{
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, RsaKeySize};

    let key_pair = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, RsaKeySize::_2048)
        .context("generating RSA-2048 key")?;

    let mut params = CertificateParams::new(vec![AUTO_CERT_CN.to_string()])
        .context("building certificate parameters")?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, AUTO_CERT_CN);
    params.distinguished_name = dn;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(AUTO_CERT_DAYS);

    let cert = params.self_signed(&key_pair).context("self-signing certificate")?;

    let cert_path = PathBuf::from(AUTO_CERT_FILE);
    let key_path = PathBuf::from(AUTO_KEY_FILE);
    std::fs::write(&cert_path, cert.pem()).context("writing temp.crt")?;
    std::fs::write(&key_path, key_pair.serialize_pem()).context("writing temp.key")?;
    log::info!("ephemeral certificate written to {AUTO_CERT_FILE} / {AUTO_KEY_FILE}");

    let guard = EphemeralCertGuard { cert_path, key_path };
    let certs = vec![cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
    Ok((certs, key, guard))
}

/// Load an operator-supplied PEM certificate chain and private key.
fn load_pem_pair(
    cert: &Path,
    key: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut cert_reader = BufReader::new(
        std::fs::File::open(cert).with_context(|| format!("opening {}", cert.display()))?,
    );
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .with_context(|| format!("parsing {}", cert.display()))?;
    if certs.is_empty() {
        bail!("{} contains no certificates", cert.display());
    }

    let mut key_reader = BufReader::new(
        std::fs::File::open(key).with_context(|| format!("opening {}", key.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("parsing {}", key.display()))?
        .with_context(|| format!("{} contains no private key", key.display()))?;

    Ok((certs, key))
}
