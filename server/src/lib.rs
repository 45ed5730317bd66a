//! tlspipe server role
//!
//! Accepts one mutual-TLS session over a pair of pipe descriptors and
//! echoes every byte back until the client closes the session.

use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use rustls::ServerConfig;
use tlspipe_common::{
    config::ServerSettings, engine, DescriptorPair, TlsStream, ROLE_FAILED, ROLE_OK,
};

/// A configured TLS server. Holds the session template every accepted
/// connection is created from; each [`EchoServer::accept`] yields a new
/// connection-scoped session.
#[derive(Clone)]
pub struct EchoServer {
    tls_config: Arc<ServerConfig>,
    chunk_size: usize,
}

impl EchoServer {
    /// Creates the echo server with TLS configuration and client
    /// validation.
    ///
    /// # Arguments
    /// * `settings` - Server credentials, client verification, protocol set
    ///   and cipher policy
    pub fn new(settings: &ServerSettings) -> Result<Self> {
        tracing::info!("Creating echo server with certificates:");
        tracing::info!("  - Server cert: {:?}", settings.credentials.cert_path);
        tracing::info!("  - Server key: {:?}", settings.credentials.key_path);
        tracing::info!("  - CA cert: {:?}", settings.credentials.ca_path);
        tracing::debug!(
            "Protocols: {}, ciphers: {}, client certificate required: {}",
            settings.protocols,
            settings.ciphers,
            settings.require_client_cert
        );

        let tls_config =
            engine::server_config(settings).context("Failed to build TLS server configuration")?;

        Ok(Self::with_config(tls_config, settings.chunk_size))
    }

    /// Uses an already built TLS configuration
    pub fn with_config(tls_config: Arc<ServerConfig>, chunk_size: usize) -> Self {
        Self {
            tls_config,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Performs the TLS handshake over `transport` and returns the
    /// connection-scoped session
    pub fn accept(&self, transport: DescriptorPair) -> Result<TlsStream> {
        tracing::info!("Performing TLS handshake...");
        let session =
            TlsStream::accept(transport, self.tls_config.clone()).context("TLS accept failed")?;

        tracing::info!(
            "✓ Client authenticated ({}, {})",
            session.protocol().unwrap_or_default(),
            session.cipher_suite().unwrap_or_default()
        );
        match session.peer_fingerprint() {
            Some(fingerprint) => {
                tracing::info!("Client certificate SHA-256: {}", fingerprint)
            }
            None => tracing::warn!("Client presented no certificate"),
        }
        Ok(session)
    }

    /// Echoes every application-data chunk back until the client closes
    /// the session. Returns the number of bytes echoed.
    pub fn echo<T: Read + Write>(&self, session: &mut TlsStream<T>) -> Result<u64> {
        tracing::debug!("Starting echo loop...");
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;

        loop {
            let n = match session.read(&mut buf) {
                Ok(0) => {
                    tracing::info!("Client closed the session");
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(anyhow!(
                        "Client went away without closing the session after {} bytes",
                        total
                    ));
                }
                Err(e) => return Err(e).context("TLS read failed"),
            };

            session
                .write_all(&buf[..n])
                .context("Failed to echo data over the TLS session")?;
            total += n as u64;
            tracing::trace!("Echoed {} bytes", n);
        }

        Ok(total)
    }
}

/// Runs the whole server role: configure, accept, echo, close. The
/// connection session is closed before the template is released.
pub fn run(settings: &ServerSettings, transport: DescriptorPair) -> Result<u64> {
    let server = EchoServer::new(settings)?;
    let mut session = server.accept(transport)?;

    let total = server.echo(&mut session)?;

    // The client is usually gone by now, so close_notify may have nowhere to go
    if let Err(e) = session.close() {
        tracing::debug!("Closing the connection session failed: {}", e);
    }
    drop(server);

    Ok(total)
}

/// The server role as a spawnable peer function
pub fn server_role(settings: ServerSettings) -> impl FnOnce(DescriptorPair) -> i32 + Send + 'static {
    move |transport| match run(&settings, transport) {
        Ok(total) => {
            tracing::info!("Server finished: {} bytes echoed", total);
            ROLE_OK
        }
        Err(e) => {
            tracing::error!("Server role failed: {:#}", e);
            ROLE_FAILED
        }
    }
}
