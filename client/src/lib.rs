//! tlspipe client role
//!
//! Connects to the server role over a pair of pipe descriptors with mutual
//! TLS, then sends local input through the session and writes whatever the
//! server echoes to local output.
//!
//! # Example
//!
//! ```no_run
//! use std::io;
//!
//! use tlspipe_client::client_role;
//! use tlspipe_common::{ClientSettings, Isolation, Spawner};
//!
//! # fn main() -> anyhow::Result<()> {
//! let spawner = Spawner::new(Isolation::Thread);
//! let role = client_role(ClientSettings::default(), io::stdin(), io::stdout());
//! let channel = spawner.spawn("client", role, &[])?;
//! // relay channel.to_peer / channel.from_peer to a server role here
//! let status = channel.handle.wait()?;
//! println!("client {status}");
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
