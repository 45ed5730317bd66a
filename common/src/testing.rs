//! Throwaway credentials and I/O helpers for tests.
//!
//! Generates a CA plus a server and a client certificate signed by it, the
//! layout the roles expect (`ca.crt`, `server.{crt,key}`,
//! `client.{crt,key}`). Not suitable for anything but tests.

use std::{
    fs, io,
    io::{Read, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};

use crate::config::DEFAULT_PEER_NAME;

/// Certificate generation errors
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("certificate generation error: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// PEM-encoded credentials for both roles
pub struct Credentials {
    pub ca_cert_pem:     String,
    pub server_cert_pem: String,
    pub server_key_pem:  String,
    pub client_cert_pem: String,
    pub client_key_pem:  String,
}

impl Credentials {
    /// Credentials whose server certificate matches the default peer name
    pub fn generate() -> Result<Self, CertError> {
        Self::generate_for(DEFAULT_PEER_NAME)
    }

    pub fn generate_for(server_name: &str) -> Result<Self, CertError> {
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "tlspipe test CA");
        ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        ca_params.key_usages.push(KeyUsagePurpose::CrlSign);

        let ca_key = KeyPair::generate()?;
        let ca_cert = ca_params.self_signed(&ca_key)?;
        let issuer = Issuer::from_params(&ca_params, &ca_key);

        let mut server_params = CertificateParams::new(vec![server_name.to_string()])?;
        server_params
            .distinguished_name
            .push(DnType::CommonName, server_name);
        server_params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);
        let server_key = KeyPair::generate()?;
        let server_cert = server_params.signed_by(&server_key, &issuer)?;

        let mut client_params = CertificateParams::default();
        client_params
            .distinguished_name
            .push(DnType::CommonName, "tlspipe test client");
        client_params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ClientAuth);
        let client_key = KeyPair::generate()?;
        let client_cert = client_params.signed_by(&client_key, &issuer)?;

        Ok(Self {
            ca_cert_pem:     ca_cert.pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem:  server_key.serialize_pem(),
            client_cert_pem: client_cert.pem(),
            client_key_pem:  client_key.serialize_pem(),
        })
    }

    /// Writes the five credential files into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<(), CertError> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("ca.crt"), &self.ca_cert_pem)?;
        fs::write(dir.join("server.crt"), &self.server_cert_pem)?;
        fs::write(dir.join("server.key"), &self.server_key_pem)?;
        fs::write(dir.join("client.crt"), &self.client_cert_pem)?;
        fs::write(dir.join("client.key"), &self.client_key_pem)?;
        Ok(())
    }

    /// Writes the credential files into a fresh temporary directory
    pub fn write_to_tempdir(&self) -> Result<tempfile::TempDir, CertError> {
        let dir = tempfile::tempdir()?;
        self.write_to(dir.path())?;
        Ok(dir)
    }
}

/// A cloneable `Write` sink whose contents the test can inspect after the
/// writer has moved into a role
#[derive(Clone, Default)]
pub struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl CaptureWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().map(|buf| buf.clone()).unwrap_or_default()
    }
}

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "capture buffer poisoned"))?;
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Transport that silently discards writes once muted. Lets a test drop a
/// session without its `close_notify` reaching the peer.
pub struct Mutable<T> {
    inner: T,
    muted: Arc<AtomicBool>,
}

impl<T> Mutable<T> {
    /// Wraps `inner`; storing `true` in the returned flag mutes it
    pub fn new(inner: T) -> (Self, Arc<AtomicBool>) {
        let muted = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                muted: muted.clone(),
            },
            muted,
        )
    }
}

impl<T: Read> Read for Mutable<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<T: Write> Write for Mutable<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.muted.load(Ordering::SeqCst) {
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
