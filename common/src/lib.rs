//! tlspipe common library
//!
//! Shared plumbing for the client and server roles and the orchestrator
//! that connects them:
//!
//! - Settings and credential locations read from the environment
//! - The process-wide TLS engine and configuration builders
//! - Owned pipe descriptor pairs and the peer spawner
//! - The byte relay between two peers
//! - A synchronous TLS session over a descriptor pair
//!
//! Peers never share a socket. Each one talks TLS over two pipes, and the
//! orchestrator relays the ciphertext between them.

/// Settings, credential paths and policy types
pub mod config;

/// TLS engine initialization and configuration builders
pub mod engine;

/// Error types
pub mod error;

/// Owned pipe ends
pub mod pipe;

/// Unidirectional byte relay
pub mod relay;

/// Peer execution contexts
pub mod spawn;

/// TLS session over a descriptor pair
pub mod tls_stream;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types for convenience
pub use config::{
    CipherPolicy, ClientSettings, ConfigError, CredentialPaths, Isolation, ProtocolSet,
    ServerSettings, Settings, RELAY_CHUNK_SIZE,
};
pub use error::{Artifact, SpawnError, TlsError};
pub use pipe::DescriptorPair;
pub use spawn::{PeerChannel, PeerHandle, PeerStatus, Spawner, ROLE_FAILED, ROLE_OK};
pub use tls_stream::{SessionState, TlsStream};
