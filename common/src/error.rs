use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Credential file kinds, named the way diagnostics refer to them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Key,
    Certificate,
    RootCa,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key => f.write_str("TLS key"),
            Self::Certificate => f.write_str("TLS certificate"),
            Self::RootCa => f.write_str("root CA"),
        }
    }
}

/// Failures while configuring or driving a TLS session
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unable to set {artifact} file {}: {source}", path.display())]
    ReadFile {
        artifact: Artifact,
        path:     PathBuf,
        #[source]
        source:   io::Error,
    },
    #[error("unable to parse {artifact} file {}: {source}", path.display())]
    Parse {
        artifact: Artifact,
        path:     PathBuf,
        #[source]
        source:   io::Error,
    },
    #[error("no {artifact} found in {}", path.display())]
    Missing { artifact: Artifact, path: PathBuf },
    #[error("no valid CA certificates found in {}", .0.display())]
    NoTrustAnchors(PathBuf),
    #[error("no cipher suites left for protocols {protocols} with cipher policy {ciphers}")]
    Policy { protocols: String, ciphers: String },
    #[error("invalid peer name {0:?}")]
    PeerName(String),
    #[error("TLS configure failed: {0}")]
    Configure(#[source] rustls::Error),
    #[error("client verifier configuration failed: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] rustls::Error),
    #[error("peer closed the channel during the TLS handshake")]
    HandshakeEof,
    #[error("TLS session I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Failures while creating or reaping a peer execution context
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("pipe() failed: {0}")]
    Pipe(#[source] nix::Error),
    #[error("fork() failed: {0}")]
    Fork(#[source] nix::Error),
    #[error("failed to start {name} thread: {source}")]
    Thread {
        name:   &'static str,
        #[source]
        source: io::Error,
    },
    #[error("waitpid() failed for {name}: {source}")]
    Wait {
        name:   &'static str,
        #[source]
        source: nix::Error,
    },
}
