use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use rustls::{
    pki_types::ServerName, ClientConfig, ClientConnection, Connection, ServerConfig,
    ServerConnection,
};

use crate::{engine, error::TlsError, pipe::DescriptorPair};

/// Lifecycle of a TLS session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Established,
    Closed,
    Failed,
}

/// Synchronous TLS session over a byte transport, by default a pair of
/// pipe descriptors.
///
/// `Read` returns `Ok(0)` only when the peer sent `close_notify`; a
/// transport that ends without it is reported as `UnexpectedEof`. Dropping
/// an established session sends `close_notify` on a best-effort basis and
/// closes the transport.
pub struct TlsStream<T: Read + Write = DescriptorPair> {
    transport: T,
    tls:       Connection,
    state:     SessionState,
}

impl<T: Read + Write> TlsStream<T> {
    /// Connect as a client and complete the handshake
    pub fn connect(
        transport: T,
        config: Arc<ClientConfig>,
        peer_name: ServerName<'static>,
    ) -> Result<Self, TlsError> {
        let tls = ClientConnection::new(config, peer_name).map_err(TlsError::Configure)?;
        Self::handshake(transport, Connection::Client(tls))
    }

    /// Accept a client and complete the handshake
    pub fn accept(transport: T, config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let tls = ServerConnection::new(config).map_err(TlsError::Configure)?;
        Self::handshake(transport, Connection::Server(tls))
    }

    fn handshake(transport: T, tls: Connection) -> Result<Self, TlsError> {
        let mut stream = Self {
            transport,
            tls,
            state: SessionState::Handshaking,
        };
        match stream.complete_handshake() {
            Ok(()) => {
                stream.state = SessionState::Established;
                Ok(stream)
            }
            Err(e) => {
                stream.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Complete the TLS handshake
    fn complete_handshake(&mut self) -> Result<(), TlsError> {
        while self.tls.is_handshaking() {
            self.write_pending()?;
            if self.tls.is_handshaking() && self.tls.wants_read() {
                if self.read_transport()? == 0 {
                    return Err(TlsError::HandshakeEof);
                }
                if let Err(e) = self.tls.process_new_packets() {
                    // Deliver the alert rustls queued for the peer
                    let _ = self.write_pending();
                    return Err(TlsError::Handshake(e));
                }
            }
        }
        // The last flight (client Finished, server tickets) is still queued
        self.write_pending()?;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated protocol version, e.g. `TLSv1_3`
    pub fn protocol(&self) -> Option<String> {
        self.tls.protocol_version().map(|v| format!("{v:?}"))
    }

    /// Negotiated cipher suite, e.g. `TLS13_AES_256_GCM_SHA384`
    pub fn cipher_suite(&self) -> Option<String> {
        self.tls
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }

    /// SHA-256 fingerprint of the peer's end-entity certificate
    pub fn peer_fingerprint(&self) -> Option<String> {
        self.tls
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(engine::fingerprint)
    }

    /// Send `close_notify` and release the session and its transport
    pub fn close(mut self) -> Result<(), TlsError> {
        self.shutdown()
    }

    /// Send `close_notify`, then keep reading until the peer's own
    /// `close_notify` or the end of the transport before releasing it.
    /// The peer's closing records are delivered while this side's read
    /// end is still open.
    pub fn close_and_wait(mut self) -> Result<(), TlsError> {
        if self.state != SessionState::Established {
            return Ok(());
        }
        self.shutdown()?;

        let mut buf = [0u8; 512];
        loop {
            match self.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => tracing::debug!("Discarded {} bytes received after close_notify", n),
                // The peer hung up without answering; nothing is left to wait for
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(TlsError::Io(e)),
            }
        }
    }

    fn shutdown(&mut self) -> Result<(), TlsError> {
        if self.state != SessionState::Established {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.tls.send_close_notify();
        self.write_pending()?;
        Ok(())
    }

    fn read_transport(&mut self) -> io::Result<usize> {
        loop {
            match self.tls.read_tls(&mut self.transport) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Push every queued TLS record to the transport
    fn write_pending(&mut self) -> io::Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.transport) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.transport.flush()
    }

    fn fail(&mut self, e: io::Error) -> io::Error {
        self.state = SessionState::Failed;
        e
    }
}

impl<T: Read + Write> Read for TlsStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut eof = false;
        loop {
            // Buffered plaintext first; Ok(0) here means close_notify
            match self.tls.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && !eof => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(self.fail(io::ErrorKind::UnexpectedEof.into()))
                }
                Err(e) => return Err(self.fail(e)),
            }

            if self.tls.wants_write() {
                if let Err(e) = self.write_pending() {
                    return Err(self.fail(e));
                }
            }

            // On transport EOF the reader reports close_notify or truncation
            // on the next pass
            match self.read_transport() {
                Ok(n) => eof = n == 0,
                Err(e) => return Err(self.fail(e)),
            }
            if let Err(e) = self.tls.process_new_packets() {
                let _ = self.write_pending();
                return Err(self.fail(io::Error::new(io::ErrorKind::InvalidData, e)));
            }
        }
    }
}

impl<T: Read + Write> Write for TlsStream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.tls.writer().write(buf)?;
        if let Err(e) = self.write_pending() {
            return Err(self.fail(e));
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tls.writer().flush()?;
        self.write_pending()
    }
}

impl<T: Read + Write> Drop for TlsStream<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::debug!("close_notify on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{
        config::{ClientSettings, CredentialPaths, ServerSettings, DEFAULT_PEER_NAME},
        pipe::OsPipes,
        testing::{Credentials, Mutable},
    };

    struct Fixture {
        _dir:   tempfile::TempDir,
        client: ClientSettings,
        server: ServerSettings,
    }

    fn fixture() -> Fixture {
        let dir = Credentials::generate().unwrap().write_to_tempdir().unwrap();
        Fixture {
            client: ClientSettings {
                credentials: CredentialPaths::in_dir(dir.path(), "client"),
                ..ClientSettings::default()
            },
            server: ServerSettings {
                credentials: CredentialPaths::in_dir(dir.path(), "server"),
                ..ServerSettings::default()
            },
            _dir: dir,
        }
    }

    #[test]
    fn mutual_handshake_and_echo_over_pipes() {
        let fx = fixture();
        let (client_end, server_end) = DescriptorPair::connected(&OsPipes).unwrap();
        let server_config = engine::server_config(&fx.server).unwrap();

        let server = thread::spawn(move || {
            let mut session = TlsStream::accept(server_end, server_config).unwrap();
            assert!(session.peer_fingerprint().is_some());
            let mut buf = [0u8; 64];
            let n = session.read(&mut buf).unwrap();
            session.write_all(&buf[..n]).unwrap();
            assert_eq!(session.read(&mut buf).unwrap(), 0);
            // The client already dropped its pipes, so only the read matters
            let _ = session.close();
        });

        let mut session = TlsStream::connect(
            client_end,
            engine::client_config(&fx.client).unwrap(),
            engine::peer_name(DEFAULT_PEER_NAME).unwrap(),
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Established);

        session.write_all(b"ping\n").unwrap();
        let mut buf = [0u8; 64];
        let n = session.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping\n");
        session.close().unwrap();

        server.join().unwrap();
    }

    #[test]
    fn close_and_wait_keeps_the_transport_for_the_peer_close_notify() {
        let fx = fixture();
        let (client_end, server_end) = DescriptorPair::connected(&OsPipes).unwrap();
        let server_config = engine::server_config(&fx.server).unwrap();

        let server = thread::spawn(move || {
            let mut session = TlsStream::accept(server_end, server_config).unwrap();
            let mut buf = [0u8; 16];
            assert_eq!(session.read(&mut buf).unwrap(), 0);
            // The client is still reading, so this close_notify is delivered
            session.close()
        });

        let session = TlsStream::connect(
            client_end,
            engine::client_config(&fx.client).unwrap(),
            engine::peer_name(DEFAULT_PEER_NAME).unwrap(),
        )
        .unwrap();
        session.close_and_wait().unwrap();

        assert!(server.join().unwrap().is_ok());
    }

    #[test]
    fn close_and_wait_returns_when_the_peer_hangs_up_silently() {
        let fx = fixture();
        let (client_end, server_end) = DescriptorPair::connected(&OsPipes).unwrap();
        let server_config = engine::server_config(&fx.server).unwrap();

        let server = thread::spawn(move || {
            let (transport, muted) = Mutable::new(server_end);
            let mut session = TlsStream::accept(transport, server_config).unwrap();
            let mut buf = [0u8; 16];
            assert_eq!(session.read(&mut buf).unwrap(), 0);
            muted.store(true, std::sync::atomic::Ordering::SeqCst);
            drop(session);
        });

        let session = TlsStream::connect(
            client_end,
            engine::client_config(&fx.client).unwrap(),
            engine::peer_name(DEFAULT_PEER_NAME).unwrap(),
        )
        .unwrap();
        session.close_and_wait().unwrap();

        server.join().unwrap();
    }

    #[test]
    fn server_rejects_client_without_certificate() {
        let fx = fixture();
        let (client_end, server_end) = DescriptorPair::connected(&OsPipes).unwrap();
        let server_config = engine::server_config(&fx.server).unwrap();

        let server = thread::spawn(move || TlsStream::accept(server_end, server_config).err());

        let anonymous = engine::anonymous_client_config(&fx.client.credentials.ca_path).unwrap();
        // Under TLS 1.3 the client may finish its side first and only learn
        // about the rejection on its next read
        if let Ok(mut session) = TlsStream::connect(
            client_end,
            anonymous,
            engine::peer_name(DEFAULT_PEER_NAME).unwrap(),
        ) {
            let mut buf = [0u8; 8];
            assert!(session.read(&mut buf).is_err());
        }

        let err = server.join().unwrap().expect("accept should fail");
        assert!(matches!(err, TlsError::Handshake(_)), "{err}");
    }

    #[test]
    fn wrong_peer_name_fails_the_client_handshake() {
        let fx = fixture();
        let (client_end, server_end) = DescriptorPair::connected(&OsPipes).unwrap();
        let server_config = engine::server_config(&fx.server).unwrap();

        let server = thread::spawn(move || TlsStream::accept(server_end, server_config).is_err());

        let result = TlsStream::connect(
            client_end,
            engine::client_config(&fx.client).unwrap(),
            engine::peer_name("not-the-server").unwrap(),
        );
        assert!(matches!(result, Err(TlsError::Handshake(_))));
        assert!(server.join().unwrap());
    }

    #[test]
    fn vanished_peer_is_a_handshake_eof() {
        let fx = fixture();
        let (client_end, server_end) = DescriptorPair::connected(&OsPipes).unwrap();
        // Server side reads the hello and then goes away
        let server = thread::spawn(move || {
            let mut server_end = server_end;
            let mut buf = [0u8; 4096];
            let _ = server_end.read(&mut buf);
        });

        let result = TlsStream::connect(
            client_end,
            engine::client_config(&fx.client).unwrap(),
            engine::peer_name(DEFAULT_PEER_NAME).unwrap(),
        );
        server.join().unwrap();
        assert!(matches!(result, Err(TlsError::HandshakeEof)));
    }

    #[test]
    fn truncated_stream_is_not_a_clean_close() {
        let fx = fixture();
        let (client_end, server_end) = DescriptorPair::connected(&OsPipes).unwrap();
        let server_config = engine::server_config(&fx.server).unwrap();

        let server = thread::spawn(move || {
            let (transport, muted) = Mutable::new(server_end);
            let session = TlsStream::accept(transport, server_config).unwrap();
            // close_notify goes nowhere, then the pipes close
            muted.store(true, std::sync::atomic::Ordering::SeqCst);
            drop(session);
        });

        let mut session = TlsStream::connect(
            client_end,
            engine::client_config(&fx.client).unwrap(),
            engine::peer_name(DEFAULT_PEER_NAME).unwrap(),
        )
        .unwrap();
        server.join().unwrap();

        let mut buf = [0u8; 8];
        let err = session.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(session.state(), SessionState::Failed);
    }
}
