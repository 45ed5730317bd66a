use std::{env, fmt, path::PathBuf, str::FromStr};

use rustls::{version, SupportedProtocolVersion};
use thiserror::Error;

/// Bytes moved per read by the relay and by both echo loops
pub const RELAY_CHUNK_SIZE: usize = 1024;

/// Name the client verifies the server certificate against
pub const DEFAULT_PEER_NAME: &str = "echo-server";

const CERTS_DIR_ENV: &str = "TLSPIPE_CERTS_DIR";
const PEER_NAME_ENV: &str = "TLSPIPE_PEER_NAME";
const SERVER_PROTOCOLS_ENV: &str = "TLSPIPE_SERVER_PROTOCOLS";
const SERVER_CIPHERS_ENV: &str = "TLSPIPE_SERVER_CIPHERS";
const VERIFY_CLIENT_ENV: &str = "TLSPIPE_VERIFY_CLIENT";
const ISOLATION_ENV: &str = "TLSPIPE_ISOLATION";
const CHUNK_SIZE_ENV: &str = "TLSPIPE_CHUNK_SIZE";

const DEFAULT_CERTS_DIR: &str = ".";
const CA_FILE: &str = "ca.crt";

fn get_certs_dir() -> PathBuf {
    env::var(CERTS_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CERTS_DIR))
}

/// Errors raised while reading settings from the environment
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid protocol list {0:?}, expected all, default, tlsv1.2 or tlsv1.3")]
    Protocols(String),
    #[error("invalid cipher policy {0:?}, expected secure, default, compat, legacy or all")]
    Ciphers(String),
    #[error("invalid isolation mode {0:?}, expected process or thread")]
    Isolation(String),
    #[error("invalid value {value:?} for {var}")]
    Value { var: &'static str, value: String },
}

/// Key, certificate and trusted-root locations for one role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    /// Path to the role's private key file
    pub key_path:  PathBuf,
    /// Path to the role's certificate file
    pub cert_path: PathBuf,
    /// Path to the certificate authority file
    pub ca_path:   PathBuf,
}

impl CredentialPaths {
    /// Client credentials (`client.key`, `client.crt`, `ca.crt`) in the
    /// configured certs directory
    pub fn client() -> Self {
        Self::in_dir(get_certs_dir(), "client")
    }

    /// Server credentials (`server.key`, `server.crt`, `ca.crt`) in the
    /// configured certs directory
    pub fn server() -> Self {
        Self::in_dir(get_certs_dir(), "server")
    }

    /// Credentials named `<stem>.key` and `<stem>.crt` under `dir`
    pub fn in_dir(dir: impl Into<PathBuf>, stem: &str) -> Self {
        let base = dir.into();
        Self {
            key_path:  base.join(format!("{stem}.key")),
            cert_path: base.join(format!("{stem}.crt")),
            ca_path:   base.join(CA_FILE),
        }
    }
}

/// TLS protocol versions the server will negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSet {
    tls12: bool,
    tls13: bool,
}

impl ProtocolSet {
    /// Every version the engine supports
    pub const ALL: Self = Self {
        tls12: true,
        tls13: true,
    };
    /// TLS 1.2 only
    pub const TLS12: Self = Self {
        tls12: true,
        tls13: false,
    };
    /// TLS 1.3 only
    pub const TLS13: Self = Self {
        tls12: false,
        tls13: true,
    };

    /// The versions in the rustls representation, newest first
    pub fn versions(&self) -> Vec<&'static SupportedProtocolVersion> {
        let mut versions = Vec::with_capacity(2);
        if self.tls13 {
            versions.push(&version::TLS13);
        }
        if self.tls12 {
            versions.push(&version::TLS12);
        }
        versions
    }

    pub fn includes_tls12(&self) -> bool {
        self.tls12
    }

    pub fn includes_tls13(&self) -> bool {
        self.tls13
    }
}

impl Default for ProtocolSet {
    fn default() -> Self {
        Self::ALL
    }
}

impl FromStr for ProtocolSet {
    type Err = ConfigError;

    /// Accepts `all`, `default`, `secure`, `tlsv1.2`, `tlsv1.3` or a comma
    /// separated list of the version names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = Self {
            tls12: false,
            tls13: false,
        };
        for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            match item.to_ascii_lowercase().as_str() {
                "all" | "default" | "secure" => set = Self::ALL,
                "tlsv1.2" => set.tls12 = true,
                "tlsv1.3" => set.tls13 = true,
                _ => return Err(ConfigError::Protocols(s.to_string())),
            }
        }
        if !set.tls12 && !set.tls13 {
            return Err(ConfigError::Protocols(s.to_string()));
        }
        Ok(set)
    }
}

impl fmt::Display for ProtocolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tls12, self.tls13) {
            (true, true) => f.write_str("all"),
            (true, false) => f.write_str("tlsv1.2"),
            (false, true) => f.write_str("tlsv1.3"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// Cipher suite selection for the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CipherPolicy {
    /// TLS 1.3 suites only
    Secure,
    /// Every suite the provider ships, TLS 1.2 ECDHE suites included
    #[default]
    Legacy,
}

impl FromStr for CipherPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "secure" | "default" => Ok(Self::Secure),
            "compat" | "legacy" | "all" | "insecure" => Ok(Self::Legacy),
            _ => Err(ConfigError::Ciphers(s.to_string())),
        }
    }
}

impl fmt::Display for CipherPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secure => f.write_str("secure"),
            Self::Legacy => f.write_str("legacy"),
        }
    }
}

/// Kind of execution context a peer role runs in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    /// A forked child process
    #[default]
    Process,
    /// A thread of the orchestrator process
    Thread,
}

impl FromStr for Isolation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "fork" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            _ => Err(ConfigError::Isolation(s.to_string())),
        }
    }
}

/// Everything the client role needs before it can connect
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub credentials: CredentialPaths,
    /// Logical server identity checked during the handshake
    pub peer_name:   String,
    pub chunk_size:  usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            credentials: CredentialPaths::client(),
            peer_name:   DEFAULT_PEER_NAME.to_string(),
            chunk_size:  RELAY_CHUNK_SIZE,
        }
    }
}

/// Everything the server role needs before it can accept
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub credentials:         CredentialPaths,
    /// Mutual TLS: reject clients that present no valid certificate
    pub require_client_cert: bool,
    pub protocols:           ProtocolSet,
    pub ciphers:             CipherPolicy,
    pub chunk_size:          usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            credentials:         CredentialPaths::server(),
            require_client_cert: true,
            protocols:           ProtocolSet::ALL,
            ciphers:             CipherPolicy::Legacy,
            chunk_size:          RELAY_CHUNK_SIZE,
        }
    }
}

/// Settings for a whole run: both roles plus the plumbing between them
#[derive(Debug, Clone)]
pub struct Settings {
    pub client:           ClientSettings,
    pub server:           ServerSettings,
    pub isolation:        Isolation,
    pub relay_chunk_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_certs_dir(DEFAULT_CERTS_DIR)
    }
}

impl Settings {
    /// Defaults with credentials taken from `dir`
    pub fn with_certs_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            client: ClientSettings {
                credentials: CredentialPaths::in_dir(&dir, "client"),
                ..ClientSettings::default()
            },
            server: ServerSettings {
                credentials: CredentialPaths::in_dir(&dir, "server"),
                ..ServerSettings::default()
            },
            isolation: Isolation::default(),
            relay_chunk_size: RELAY_CHUNK_SIZE,
        }
    }

    /// Creates settings from the `TLSPIPE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::with_certs_dir(get_certs_dir());

        if let Ok(name) = env::var(PEER_NAME_ENV) {
            settings.client.peer_name = name;
        }
        if let Ok(protocols) = env::var(SERVER_PROTOCOLS_ENV) {
            settings.server.protocols = protocols.parse()?;
        }
        if let Ok(ciphers) = env::var(SERVER_CIPHERS_ENV) {
            settings.server.ciphers = ciphers.parse()?;
        }
        if let Ok(verify) = env::var(VERIFY_CLIENT_ENV) {
            settings.server.require_client_cert = parse_bool(VERIFY_CLIENT_ENV, &verify)?;
        }
        if let Ok(isolation) = env::var(ISOLATION_ENV) {
            settings.isolation = isolation.parse()?;
        }
        if let Ok(chunk) = env::var(CHUNK_SIZE_ENV) {
            let size = chunk
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| ConfigError::Value {
                    var:   CHUNK_SIZE_ENV,
                    value: chunk.clone(),
                })?;
            settings.relay_chunk_size = size;
            settings.client.chunk_size = size;
            settings.server.chunk_size = size;
        }

        Ok(settings)
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Value {
            var,
            value: value.to_string(),
        }),
    }
}
