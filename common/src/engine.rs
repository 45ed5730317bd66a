//! TLS engine setup: the process-wide crypto provider and the client and
//! server configurations built from credential files.

use std::{
    fs,
    io::BufReader,
    path::Path,
    sync::{Arc, OnceLock},
};

use rustls::{
    crypto::{aws_lc_rs, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    server::WebPkiClientVerifier,
    ClientConfig, RootCertStore, ServerConfig, SupportedCipherSuite,
};
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};

use crate::{
    config::{CipherPolicy, ClientSettings, CredentialPaths, ProtocolSet, ServerSettings},
    error::{Artifact, TlsError},
};

static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();

/// Returns the process-wide crypto provider, initializing the engine on
/// first use. Safe to call from every role and every thread.
pub fn provider() -> Arc<CryptoProvider> {
    PROVIDER
        .get_or_init(|| {
            let provider = aws_lc_rs::default_provider();
            // Fails only if something else already installed a default, which is fine
            let _ = provider.clone().install_default();
            tracing::debug!("TLS engine initialized");
            Arc::new(provider)
        })
        .clone()
}

/// Reads a PEM certificate chain
pub fn load_certificates(
    path: &Path,
    artifact: Artifact,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = fs::read(path).map_err(|source| TlsError::ReadFile {
        artifact,
        path: path.to_path_buf(),
        source,
    })?;
    let chain = certs(&mut BufReader::new(&*pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Parse {
            artifact,
            path: path.to_path_buf(),
            source,
        })?;

    if chain.is_empty() {
        return Err(TlsError::Missing {
            artifact,
            path: path.to_path_buf(),
        });
    }
    Ok(chain)
}

/// Reads the first PEM private key (PKCS#1, PKCS#8 or SEC1) in `path`
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let artifact = Artifact::Key;
    let pem = fs::read(path).map_err(|source| TlsError::ReadFile {
        artifact,
        path: path.to_path_buf(),
        source,
    })?;
    private_key(&mut BufReader::new(&*pem))
        .map_err(|source| TlsError::Parse {
            artifact,
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::Missing {
            artifact,
            path: path.to_path_buf(),
        })
}

/// Builds the trust store from the CA file
pub fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    let ca_certs = load_certificates(path, Artifact::RootCa)?;
    let (added, ignored) = root_store.add_parsable_certificates(ca_certs);
    if ignored > 0 {
        tracing::warn!(
            "Ignored {} unparsable CA certificate(s) in {}",
            ignored,
            path.display()
        );
    }

    if added == 0 {
        return Err(TlsError::NoTrustAnchors(path.to_path_buf()));
    }
    Ok(root_store)
}

/// Client configuration presenting the role's certificate and trusting
/// the configured CA
pub fn client_config(settings: &ClientSettings) -> Result<Arc<ClientConfig>, TlsError> {
    let paths = &settings.credentials;
    let (cert_chain, key) = load_identity(paths)?;
    let root_store = load_root_store(&paths.ca_path)?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(TlsError::Configure)?
        .with_root_certificates(root_store)
        .with_client_auth_cert(cert_chain, key)
        .map_err(TlsError::Configure)?;

    Ok(Arc::new(config))
}

/// Client configuration that trusts the CA but presents no certificate
pub fn anonymous_client_config(ca_path: &Path) -> Result<Arc<ClientConfig>, TlsError> {
    let root_store = load_root_store(ca_path)?;
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(TlsError::Configure)?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Server configuration with the configured client verification,
/// protocol set and cipher policy
pub fn server_config(settings: &ServerSettings) -> Result<Arc<ServerConfig>, TlsError> {
    let paths = &settings.credentials;
    let (cert_chain, key) = load_identity(paths)?;
    let root_store = Arc::new(load_root_store(&paths.ca_path)?);

    let provider = Arc::new(CryptoProvider {
        cipher_suites: select_cipher_suites(settings.protocols, settings.ciphers)?,
        ..(*provider()).clone()
    });

    let verifier_builder = WebPkiClientVerifier::builder_with_provider(root_store, provider.clone());
    let client_verifier = if settings.require_client_cert {
        verifier_builder.build()?
    } else {
        verifier_builder.allow_unauthenticated().build()?
    };

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&settings.protocols.versions())
        .map_err(TlsError::Configure)?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(cert_chain, key)
        .map_err(TlsError::Configure)?;

    Ok(Arc::new(config))
}

/// Cipher suites allowed by `ciphers` that can run under `protocols`
pub fn select_cipher_suites(
    protocols: ProtocolSet,
    ciphers: CipherPolicy,
) -> Result<Vec<SupportedCipherSuite>, TlsError> {
    let suites: Vec<_> = aws_lc_rs::ALL_CIPHER_SUITES
        .iter()
        .copied()
        .filter(|suite| match suite {
            SupportedCipherSuite::Tls13(_) => protocols.includes_tls13(),
            SupportedCipherSuite::Tls12(_) => {
                protocols.includes_tls12() && ciphers == CipherPolicy::Legacy
            }
        })
        .collect();

    if suites.is_empty() {
        return Err(TlsError::Policy {
            protocols: protocols.to_string(),
            ciphers:   ciphers.to_string(),
        });
    }
    Ok(suites)
}

/// Parses the logical peer name the client verifies
pub fn peer_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string()).map_err(|_| TlsError::PeerName(name.to_string()))
}

/// Lowercase hex SHA-256 of a DER certificate
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

// Certificate first, then key: a role with no credentials at all reports
// its certificate file.
fn load_identity(
    paths: &CredentialPaths,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let cert_chain = load_certificates(&paths.cert_path, Artifact::Certificate)?;
    let key = load_private_key(&paths.key_path)?;
    Ok((cert_chain, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Credentials;

    #[test]
    fn provider_is_initialized_once() {
        let a = provider();
        let b = provider();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn missing_certificate_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings {
            credentials: CredentialPaths::in_dir(dir.path(), "server"),
            ..ServerSettings::default()
        };

        let err = server_config(&settings).unwrap_err();
        assert!(matches!(
            err,
            TlsError::ReadFile {
                artifact: Artifact::Certificate,
                ..
            }
        ));
        assert!(err.to_string().contains("server.crt"), "{err}");
    }

    #[test]
    fn empty_ca_file_is_reported_as_missing() {
        let creds = Credentials::generate().unwrap();
        let dir = creds.write_to_tempdir().unwrap();
        std::fs::write(dir.path().join("ca.crt"), b"").unwrap();

        let err = load_root_store(&dir.path().join("ca.crt")).unwrap_err();
        assert!(matches!(
            err,
            TlsError::Missing {
                artifact: Artifact::RootCa,
                ..
            }
        ));
    }

    #[test]
    fn key_file_without_key_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.key");
        std::fs::write(&path, b"not a key\n").unwrap();

        let err = load_private_key(&path).unwrap_err();
        assert!(err.to_string().contains("client.key"), "{err}");
    }

    #[test]
    fn configs_build_from_generated_credentials() {
        let creds = Credentials::generate().unwrap();
        let dir = creds.write_to_tempdir().unwrap();

        let client = ClientSettings {
            credentials: CredentialPaths::in_dir(dir.path(), "client"),
            ..ClientSettings::default()
        };
        let server = ServerSettings {
            credentials: CredentialPaths::in_dir(dir.path(), "server"),
            ..ServerSettings::default()
        };

        assert!(client_config(&client).is_ok());
        assert!(server_config(&server).is_ok());
        assert!(anonymous_client_config(&dir.path().join("ca.crt")).is_ok());
    }

    #[test]
    fn secure_policy_drops_tls12_suites() {
        let suites = select_cipher_suites(ProtocolSet::ALL, CipherPolicy::Secure).unwrap();
        assert!(suites
            .iter()
            .all(|suite| matches!(suite, SupportedCipherSuite::Tls13(_))));

        let legacy = select_cipher_suites(ProtocolSet::ALL, CipherPolicy::Legacy).unwrap();
        assert!(legacy.len() > suites.len());
    }

    #[test]
    fn tls12_with_secure_policy_is_rejected() {
        let err = select_cipher_suites(ProtocolSet::TLS12, CipherPolicy::Secure).unwrap_err();
        assert!(matches!(err, TlsError::Policy { .. }));
    }

    #[test]
    fn peer_name_must_be_a_dns_name() {
        assert!(peer_name("echo-server").is_ok());
        assert!(matches!(
            peer_name("echo server"),
            Err(TlsError::PeerName(_))
        ));
    }
}
