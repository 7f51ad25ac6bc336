//! TLS upgrade of an established server connection.
//!
//! The upgrade runs only after the TCP connect has completed; the
//! [`crate::Connection`] hands its stream over here and keeps whatever
//! comes back. Verification strength follows the [`TlsMode`]:
//!
//! | mode | encrypted | chain verified | host name verified |
//! |---|---|---|---|
//! | `allow` / `prefer` / `require` | yes | no | no |
//! | `verify_ca` | yes | yes | no |
//! | `verify_full` | yes | yes | yes |
//!
//! Handshake signatures are always checked, even when the certificate
//! itself is accepted without verification.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    SupportedProtocolVersion,
};
use socket2::SockAddr;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{MachineError, MachineResult};
use crate::io::RawStream;

// ── TlsMode ──────────────────────────────────────────────────────────

/// How much TLS a connection asks for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TlsMode {
    #[default]
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl TlsMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TlsMode::Disable => "disable",
            TlsMode::Allow => "allow",
            TlsMode::Prefer => "prefer",
            TlsMode::Require => "require",
            TlsMode::VerifyCa => "verify_ca",
            TlsMode::VerifyFull => "verify_full",
        }
    }

    /// Whether a connection in this mode performs a handshake at all.
    pub fn is_enabled(self) -> bool {
        self != TlsMode::Disable
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── TlsPolicy ────────────────────────────────────────────────────────

/// TLS settings of one endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsPolicy {
    pub mode: TlsMode,
    /// Name presented via SNI and checked by `verify_full`. Defaults to
    /// the peer IP address.
    pub server_name: Option<String>,
    pub ca_file: Option<PathBuf>,
    /// Directory whose `*.pem` and `*.crt` files are all trusted.
    pub ca_path: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// PEM encoded CA certificates, trusted alongside `ca_file` and `ca_path`.
    pub ca: Option<Vec<u8>>,
    /// PEM encoded client certificate chain; wins over `cert_file`.
    pub cert: Option<Vec<u8>>,
    /// PEM encoded client private key; wins over `key_file`.
    pub key: Option<Vec<u8>>,
    /// Comma separated list such as `tlsv1.2,tlsv1.3`.
    pub protocols: Option<String>,
}

impl TlsPolicy {
    pub fn new(mode: TlsMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Build the rustls client configuration for this policy.
    pub fn client_config(&self) -> MachineResult<Arc<ClientConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions = self.protocol_versions()?;

        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)
            .map_err(|e| MachineError::TlsConfig(format!("tls protocol versions: {e}")))?;

        let builder = match self.mode {
            TlsMode::VerifyFull => builder.with_root_certificates(self.root_store()?),
            TlsMode::VerifyCa => {
                let inner = WebPkiServerVerifier::builder_with_provider(
                    Arc::new(self.root_store()?),
                    Arc::clone(&provider),
                )
                .build()
                .map_err(|e| MachineError::TlsConfig(format!("certificate verifier: {e}")))?;
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(ChainOnlyVerifier { inner }))
            }
            TlsMode::Disable | TlsMode::Allow | TlsMode::Prefer | TlsMode::Require => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider })),
        };

        let config = match self.client_identity()? {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| MachineError::TlsConfig(format!("client certificate: {e}")))?,
            None => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }

    fn client_identity(
        &self,
    ) -> MachineResult<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        let certs = match (&self.cert, &self.cert_file) {
            (Some(pem), _) => parse_certs(pem.as_slice(), "tls cert")?,
            (None, Some(path)) => load_certs(path)?,
            (None, None) => return Ok(None),
        };
        let key = match (&self.key, &self.key_file) {
            (Some(pem), _) => parse_key(pem.as_slice(), "tls key")?,
            (None, Some(path)) => load_key(path)?,
            (None, None) => return Ok(None),
        };
        Ok(Some((certs, key)))
    }

    fn protocol_versions(&self) -> MachineResult<Vec<&'static SupportedProtocolVersion>> {
        let Some(protocols) = &self.protocols else {
            return Ok(rustls::DEFAULT_VERSIONS.to_vec());
        };
        let mut versions = Vec::new();
        for name in protocols.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let version = match name.to_ascii_lowercase().as_str() {
                "tlsv1.2" => &rustls::version::TLS12,
                "tlsv1.3" => &rustls::version::TLS13,
                _ => {
                    return Err(MachineError::TlsConfig(format!(
                        "unknown tls protocol '{name}'"
                    )));
                }
            };
            if !versions
                .iter()
                .any(|known: &&SupportedProtocolVersion| known.version == version.version)
            {
                versions.push(version);
            }
        }
        if versions.is_empty() {
            return Err(MachineError::TlsConfig("no tls protocols enabled".into()));
        }
        Ok(versions)
    }

    fn root_store(&self) -> MachineResult<RootCertStore> {
        let mut store = RootCertStore::empty();
        if self.ca.is_none() && self.ca_file.is_none() && self.ca_path.is_none() {
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            return Ok(store);
        }
        if let Some(pem) = &self.ca {
            add_roots(&mut store, parse_certs(pem.as_slice(), "tls ca")?, "tls ca")?;
        }
        if let Some(path) = &self.ca_file {
            add_roots(&mut store, load_certs(path)?, &path.display().to_string())?;
        }
        if let Some(dir) = &self.ca_path {
            for path in ca_dir_entries(dir)? {
                add_roots(&mut store, load_certs(&path)?, &path.display().to_string())?;
            }
        }
        if store.is_empty() {
            return Err(MachineError::TlsConfig("no trusted certificates".into()));
        }
        Ok(store)
    }

    /// Name to present and verify: the configured one, else the peer IP.
    pub fn server_name(&self, peer: Option<&SockAddr>) -> MachineResult<ServerName<'static>> {
        if let Some(name) = &self.server_name {
            return ServerName::try_from(name.clone())
                .map_err(|e| MachineError::TlsConfig(format!("invalid server name '{name}': {e}")));
        }
        peer.and_then(SockAddr::as_socket)
            .map(|addr| ServerName::IpAddress(addr.ip().into()))
            .ok_or_else(|| MachineError::TlsConfig("no server name for tls".into()))
    }
}

fn open(path: &Path) -> MachineResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| MachineError::TlsConfig(format!("{}: {e}", path.display())))
}

fn load_certs(path: &Path) -> MachineResult<Vec<CertificateDer<'static>>> {
    parse_certs(open(path)?, &path.display().to_string())
}

fn load_key(path: &Path) -> MachineResult<PrivateKeyDer<'static>> {
    parse_key(open(path)?, &path.display().to_string())
}

fn parse_certs(mut pem: impl BufRead, origin: &str) -> MachineResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MachineError::TlsConfig(format!("{origin}: {e}")))?;
    if certs.is_empty() {
        return Err(MachineError::TlsConfig(format!("{origin}: no certificates found")));
    }
    Ok(certs)
}

fn parse_key(mut pem: impl BufRead, origin: &str) -> MachineResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem)
        .map_err(|e| MachineError::TlsConfig(format!("{origin}: {e}")))?
        .ok_or_else(|| MachineError::TlsConfig(format!("{origin}: no private key found")))
}

fn add_roots(
    store: &mut RootCertStore,
    certs: Vec<CertificateDer<'static>>,
    origin: &str,
) -> MachineResult<()> {
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| MachineError::TlsConfig(format!("{origin}: {e}")))?;
    }
    Ok(())
}

/// Certificate files of a CA directory, in name order.
fn ca_dir_entries(dir: &Path) -> MachineResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| MachineError::TlsConfig(format!("{}: {e}", dir.display())))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| MachineError::TlsConfig(format!("{}: {e}", dir.display())))?
            .path();
        let is_cert = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "pem" | "crt"));
        if is_cert && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

// ── Upgrade ──────────────────────────────────────────────────────────

/// Run the client handshake over an established stream.
pub async fn upgrade(
    stream: RawStream,
    policy: &TlsPolicy,
    server_name: ServerName<'static>,
) -> MachineResult<TlsStream<RawStream>> {
    let connector = TlsConnector::from(policy.client_config()?);
    let session = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| MachineError::Tls(e.to_string()))?;
    tracing::debug!(mode = %policy.mode, "tls session established");
    Ok(session)
}

// ── Verifiers ────────────────────────────────────────────────────────

/// Accepts any certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Verifies the certificate chain against the trust store, ignoring the
/// host name.
#[derive(Debug)]
struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    // ── Modes ───────────────────────────────────────────────────────

    #[test]
    fn mode_names() {
        assert_eq!(TlsMode::default(), TlsMode::Disable);
        assert_eq!(TlsMode::VerifyCa.to_string(), "verify_ca");
        assert_eq!(TlsMode::VerifyFull.as_str(), "verify_full");
        assert!(!TlsMode::Disable.is_enabled());
        assert!(TlsMode::Allow.is_enabled());
    }

    // ── Client config ───────────────────────────────────────────────

    #[test]
    fn builds_config_for_every_enabled_mode() {
        for mode in [
            TlsMode::Allow,
            TlsMode::Prefer,
            TlsMode::Require,
            TlsMode::VerifyCa,
            TlsMode::VerifyFull,
        ] {
            TlsPolicy::new(mode)
                .client_config()
                .unwrap_or_else(|e| panic!("{mode}: {e}"));
        }
    }

    #[test]
    fn protocols_restrict_versions() {
        let mut policy = TlsPolicy::new(TlsMode::Require);
        policy.protocols = Some("TLSv1.3".into());
        assert_eq!(policy.protocol_versions().unwrap().len(), 1);

        policy.protocols = Some("tlsv1.2, tlsv1.3, tlsv1.3".into());
        assert_eq!(policy.protocol_versions().unwrap().len(), 2);

        policy.protocols = Some("sslv3".into());
        let err = policy.client_config().unwrap_err();
        assert!(err.to_string().contains("unknown tls protocol 'sslv3'"));

        policy.protocols = Some(" , ".into());
        assert!(policy.client_config().is_err());
    }

    #[test]
    fn ca_file_is_loaded() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let ca = write_temp(&cert.cert.pem());

        let mut policy = TlsPolicy::new(TlsMode::VerifyFull);
        policy.ca_file = Some(ca.path().to_path_buf());
        assert_eq!(policy.root_store().unwrap().len(), 1);
        policy.client_config().unwrap();
    }

    #[test]
    fn missing_or_empty_ca_file_is_an_error() {
        let mut policy = TlsPolicy::new(TlsMode::VerifyCa);
        policy.ca_file = Some(PathBuf::from("/nonexistent/ca.pem"));
        assert!(matches!(
            policy.client_config(),
            Err(MachineError::TlsConfig(_))
        ));

        let empty = write_temp("");
        policy.ca_file = Some(empty.path().to_path_buf());
        let err = policy.client_config().unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }

    #[test]
    fn client_certificate_requires_both_files() {
        let cert = rcgen::generate_simple_self_signed(vec!["client".into()]).unwrap();
        let cert_file = write_temp(&cert.cert.pem());
        let key_file = write_temp(&cert.key_pair.serialize_pem());

        let mut policy = TlsPolicy::new(TlsMode::Require);
        policy.cert_file = Some(cert_file.path().to_path_buf());
        // Key missing: plain config without client auth.
        policy.client_config().unwrap();

        policy.key_file = Some(key_file.path().to_path_buf());
        policy.client_config().unwrap();

        policy.key_file = Some(cert_file.path().to_path_buf());
        let err = policy.client_config().unwrap_err();
        assert!(err.to_string().contains("no private key found"));
    }

    #[test]
    fn in_memory_pem_is_trusted_and_presented() {
        let ca = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let client = rcgen::generate_simple_self_signed(vec!["client".into()]).unwrap();

        let mut policy = TlsPolicy::new(TlsMode::VerifyFull);
        policy.ca = Some(ca.cert.pem().into_bytes());
        assert_eq!(policy.root_store().unwrap().len(), 1);

        policy.cert = Some(client.cert.pem().into_bytes());
        policy.key = Some(client.key_pair.serialize_pem().into_bytes());
        assert!(policy.client_identity().unwrap().is_some());
        policy.client_config().unwrap();

        // The in-memory key wins over a file that holds no key.
        let not_a_key = write_temp(&client.cert.pem());
        policy.key_file = Some(not_a_key.path().to_path_buf());
        policy.client_config().unwrap();

        policy.key = Some(b"garbage".to_vec());
        let err = policy.client_config().unwrap_err();
        assert!(err.to_string().contains("tls key: no private key found"));
    }

    #[test]
    fn ca_path_trusts_every_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.pem", "b.crt"] {
            let cert = rcgen::generate_simple_self_signed(vec![name.into()]).unwrap();
            std::fs::write(dir.path().join(name), cert.cert.pem()).unwrap();
        }
        std::fs::write(dir.path().join("README"), "not a certificate").unwrap();

        let mut policy = TlsPolicy::new(TlsMode::VerifyCa);
        policy.ca_path = Some(dir.path().to_path_buf());
        assert_eq!(policy.root_store().unwrap().len(), 2);

        let extra = rcgen::generate_simple_self_signed(vec!["extra".into()]).unwrap();
        policy.ca = Some(extra.cert.pem().into_bytes());
        assert_eq!(policy.root_store().unwrap().len(), 3);
    }

    #[test]
    fn empty_ca_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut policy = TlsPolicy::new(TlsMode::VerifyFull);
        policy.ca_path = Some(dir.path().to_path_buf());
        let err = policy.client_config().unwrap_err();
        assert!(err.to_string().contains("no trusted certificates"));

        policy.ca_path = Some(PathBuf::from("/nonexistent/certs"));
        assert!(matches!(
            policy.client_config(),
            Err(MachineError::TlsConfig(_))
        ));
    }

    // ── Server name ─────────────────────────────────────────────────

    #[test]
    fn server_name_prefers_configured_name() {
        let peer = SockAddr::from("10.0.0.7:5432".parse::<std::net::SocketAddr>().unwrap());
        let mut policy = TlsPolicy::new(TlsMode::VerifyFull);

        let by_ip = policy.server_name(Some(&peer)).unwrap();
        assert!(matches!(by_ip, ServerName::IpAddress(_)));

        policy.server_name = Some("db.internal".into());
        let by_name = policy.server_name(Some(&peer)).unwrap();
        assert_eq!(by_name.to_str(), "db.internal");

        policy.server_name = None;
        assert!(policy.server_name(None).is_err());
    }
}
