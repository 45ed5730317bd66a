use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use rustls::{pki_types::ServerName, ClientConfig};
use tlspipe_common::{
    config::ClientSettings, engine, DescriptorPair, TlsStream, ROLE_FAILED, ROLE_OK,
};

/// Byte counts of a finished echo exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoSummary {
    /// Bytes read from local input and sent to the server
    pub sent:     u64,
    /// Bytes echoed back and written to local output
    pub received: u64,
}

/// A configured TLS client, ready to connect over a descriptor pair
pub struct EchoClient {
    tls_config: Arc<ClientConfig>,
    peer_name:  ServerName<'static>,
    chunk_size: usize,
}

impl EchoClient {
    /// Loads the client credentials and builds the TLS configuration
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        tracing::debug!("Loading client certificates:");
        tracing::debug!("  - Client cert: {:?}", settings.credentials.cert_path);
        tracing::debug!("  - Client key: {:?}", settings.credentials.key_path);
        tracing::debug!("  - CA cert: {:?}", settings.credentials.ca_path);

        let tls_config =
            engine::client_config(settings).context("Failed to build TLS client configuration")?;
        Self::with_config(tls_config, settings)
    }

    /// Uses an already built TLS configuration
    pub fn with_config(tls_config: Arc<ClientConfig>, settings: &ClientSettings) -> Result<Self> {
        let peer_name = engine::peer_name(&settings.peer_name)?;
        Ok(Self {
            tls_config,
            peer_name,
            chunk_size: settings.chunk_size.max(1),
        })
    }

    /// Performs the TLS handshake over `transport`
    pub fn connect(&self, transport: DescriptorPair) -> Result<TlsStream> {
        tracing::debug!("Starting TLS handshake with {:?}", self.peer_name);
        let session = TlsStream::connect(
            transport,
            self.tls_config.clone(),
            self.peer_name.clone(),
        )
        .context("TLS connect failed")?;

        tracing::info!(
            "✓ Secure session established ({}, {})",
            session.protocol().unwrap_or_default(),
            session.cipher_suite().unwrap_or_default()
        );
        Ok(session)
    }

    /// Sends local input to the server chunk by chunk and writes the echo
    /// to local output, until local input is exhausted
    pub fn echo<T, R, W>(
        &self,
        session: &mut TlsStream<T>,
        mut input: R,
        mut output: W,
    ) -> Result<EchoSummary>
    where
        T: Read + Write,
        R: Read,
        W: Write,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut summary = EchoSummary::default();

        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("Failed to read local input"),
            };

            session
                .write_all(&buf[..n])
                .context("Failed to send data over the TLS session")?;
            summary.sent += n as u64;

            let received = read_echo(session, &mut buf, &summary)?;
            write_output(&mut output, &buf[..received])?;
            summary.received += received as u64;
        }

        // The echo of the last chunks may still be in flight
        while summary.received < summary.sent {
            let received = read_echo(session, &mut buf, &summary)?;
            write_output(&mut output, &buf[..received])?;
            summary.received += received as u64;
        }

        Ok(summary)
    }
}

fn read_echo<T: Read + Write>(
    session: &mut TlsStream<T>,
    buf: &mut [u8],
    summary: &EchoSummary,
) -> Result<usize> {
    match session.read(buf) {
        Ok(0) => Err(anyhow!(
            "Server closed the TLS session with {} echoed bytes outstanding",
            summary.sent.saturating_sub(summary.received)
        )),
        Ok(n) => Ok(n),
        Err(e) => Err(e).context("Failed to read echoed data from the TLS session"),
    }
}

fn write_output<W: Write>(output: &mut W, data: &[u8]) -> Result<()> {
    output
        .write_all(data)
        .and_then(|()| output.flush())
        .context("Failed to write local output")
}

/// Runs the whole client role: configure, connect, echo local input,
/// close. The transport is kept until the server's `close_notify` arrives;
/// the session is released on every path.
pub fn run<R: Read, W: Write>(
    settings: &ClientSettings,
    transport: DescriptorPair,
    input: R,
    output: W,
) -> Result<EchoSummary> {
    let client = EchoClient::new(settings)?;
    let mut session = client.connect(transport)?;

    let summary = client.echo(&mut session, input, output)?;
    tracing::debug!("Local input exhausted, closing the TLS session");
    session
        .close_and_wait()
        .context("Failed to close the TLS session")?;

    Ok(summary)
}

/// The client role as a spawnable peer function
pub fn client_role<R, W>(
    settings: ClientSettings,
    input: R,
    output: W,
) -> impl FnOnce(DescriptorPair) -> i32 + Send + 'static
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    move |transport| match run(&settings, transport, input, output) {
        Ok(summary) => {
            tracing::info!(
                "Client finished: {} bytes sent, {} bytes echoed",
                summary.sent,
                summary.received
            );
            ROLE_OK
        }
        Err(e) => {
            tracing::error!("Client role failed: {:#}", e);
            ROLE_FAILED
        }
    }
}
