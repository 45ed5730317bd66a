//! tlspipe orchestrator
//!
//! Starts the client and server roles in separate execution contexts and
//! cross-wires them with two relay threads, so the only path between the
//! peers is the parent's copying of opaque TLS records:
//!
//! ```text
//!   input ─▶ client ─▶ relay "client->server" ─▶ server
//!  output ◀─ client ◀─ relay "server->client" ◀─ server
//! ```

use std::{
    io::{Read, Write},
    thread,
};

use anyhow::{Context, Result};
use tlspipe_client::client_role;
use tlspipe_common::{
    relay::{self, RelayReport},
    PeerChannel, PeerHandle, PeerStatus, Settings, Spawner,
};
use tlspipe_server::server_role;

/// Outcome of one complete run
#[derive(Debug)]
pub struct RunReport {
    pub client: PeerStatus,
    pub server: PeerStatus,
    /// Reports of the relays that ran to completion
    pub relays: Vec<RelayReport>,
}

impl RunReport {
    /// True when both roles finished their exchange cleanly
    pub fn success(&self) -> bool {
        self.client.success() && self.server.success()
    }
}

/// Runs both roles to completion. The client reads `input` and writes
/// the echoed bytes to `output`.
///
/// Returns an error only when the plumbing itself could not be set up;
/// role failures are carried in the [`RunReport`].
pub fn run<R, W>(settings: &Settings, input: R, output: W) -> Result<RunReport>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let spawner = Spawner::new(settings.isolation);
    tracing::info!("Starting peers ({:?} isolation)", spawner.isolation());

    let client = spawner
        .spawn("client", client_role(settings.client.clone(), input, output), &[])
        .context("Failed to start the client peer")?;

    // A forked server must not keep the client's pipes open
    let server = match spawner.spawn(
        "server",
        server_role(settings.server.clone()),
        &client.raw_fds(),
    ) {
        Ok(server) => server,
        Err(e) => {
            let PeerChannel {
                to_peer,
                from_peer,
                handle,
            } = client;
            drop(to_peer);
            drop(from_peer);
            match handle.wait() {
                Ok(status) => {
                    tracing::warn!("Client {} after the server failed to start", status)
                }
                Err(wait_err) => tracing::error!("{}", wait_err),
            }
            return Err(e).context("Failed to start the server peer");
        }
    };

    let PeerChannel {
        to_peer: to_client,
        from_peer: from_client,
        handle: client_handle,
    } = client;
    let PeerChannel {
        to_peer: to_server,
        from_peer: from_server,
        handle: server_handle,
    } = server;

    let chunk_size = settings.relay_chunk_size;
    let relays = relay::spawn("client->server", from_client, to_server, chunk_size)
        .and_then(|upstream| {
            let downstream = relay::spawn("server->client", from_server, to_client, chunk_size)?;
            Ok([upstream, downstream])
        });

    let relays: Vec<RelayReport> = match relays {
        Ok(relays) => relays.into_iter().filter_map(join_relay).collect(),
        Err(e) => {
            // The unstarted relay's descriptors are closed by now, so both
            // peers run into end-of-stream and terminate
            let _ = wait_peer(client_handle);
            let _ = wait_peer(server_handle);
            return Err(e).context("Failed to start a relay thread");
        }
    };

    let report = RunReport {
        client: wait_peer(client_handle)?,
        server: wait_peer(server_handle)?,
        relays,
    };
    tracing::info!("Client {}, server {}", report.client, report.server);
    Ok(report)
}

fn join_relay(relay: thread::JoinHandle<RelayReport>) -> Option<RelayReport> {
    match relay.join() {
        Ok(report) => {
            if report.clean() {
                tracing::debug!("{}", report);
            } else {
                tracing::warn!("{}", report);
            }
            Some(report)
        }
        Err(_) => {
            tracing::error!("A relay thread panicked");
            None
        }
    }
}

fn wait_peer(handle: PeerHandle) -> Result<PeerStatus> {
    let name = handle.name();
    let status = handle
        .wait()
        .with_context(|| format!("Failed to wait for the {name} peer"))?;
    if !status.success() {
        tracing::warn!("The {} peer {}", name, status);
    }
    Ok(status)
}
