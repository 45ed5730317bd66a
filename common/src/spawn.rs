//! Peer execution contexts.
//!
//! A peer role is any `FnOnce(DescriptorPair) -> i32`. The spawner creates
//! two pipes, one carrying data into the peer and one carrying data out of
//! it, starts the role in a forked child or a thread, and hands the caller
//! the complementary ends. Every end is an owned descriptor, so each one is
//! closed exactly once by whichever side ends up holding it.

use std::{
    fmt,
    fs::File,
    io::{self, Write},
    os::fd::{AsRawFd, RawFd},
    process, thread,
};

use nix::{
    sys::wait::{waitpid, WaitStatus},
    unistd::{fork, ForkResult, Pid},
};

use crate::{
    config::Isolation,
    error::SpawnError,
    pipe::{DescriptorPair, OsPipes, PipeFactory},
};

/// Status a role returns when it finished its exchange cleanly
pub const ROLE_OK: i32 = 0;
/// Status a role returns when any step failed
pub const ROLE_FAILED: i32 = 1;

/// Identity of a running peer, consumed by [`PeerHandle::wait`]
pub enum PeerHandle {
    Process {
        name: &'static str,
        pid:  Pid,
    },
    Thread {
        name:   &'static str,
        handle: thread::JoinHandle<i32>,
    },
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process { name, pid } => write!(f, "{name} (pid {pid})"),
            Self::Thread { name, .. } => write!(f, "{name} (thread)"),
        }
    }
}

/// How a peer's execution context ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerStatus {
    /// The role returned, or the process exited, with this status
    Exited(i32),
    /// The process was killed by a signal
    Signaled(String),
    /// The role thread panicked
    Panicked,
}

impl PeerStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(ROLE_OK))
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(signal) => write!(f, "killed by {signal}"),
            Self::Panicked => f.write_str("panicked"),
        }
    }
}

impl PeerHandle {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Process { name, .. } | Self::Thread { name, .. } => name,
        }
    }

    /// Blocks until the peer terminates
    pub fn wait(self) -> Result<PeerStatus, SpawnError> {
        match self {
            Self::Process { name, pid } => loop {
                match waitpid(pid, None) {
                    Ok(WaitStatus::Exited(_, code)) => return Ok(PeerStatus::Exited(code)),
                    Ok(WaitStatus::Signaled(_, signal, _)) => {
                        return Ok(PeerStatus::Signaled(signal.as_str().to_string()))
                    }
                    Ok(_) => continue,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(source) => return Err(SpawnError::Wait { name, source }),
                }
            },
            Self::Thread { handle, .. } => Ok(match handle.join() {
                Ok(code) => PeerStatus::Exited(code),
                Err(_) => PeerStatus::Panicked,
            }),
        }
    }
}

/// The caller's side of a spawned peer
#[derive(Debug)]
pub struct PeerChannel {
    /// Write end of the pipe the peer reads from
    pub to_peer:   File,
    /// Read end of the pipe the peer writes to
    pub from_peer: File,
    pub handle:    PeerHandle,
}

impl PeerChannel {
    /// Descriptors a later-forked child must close so it does not hold
    /// this peer's pipes open
    pub fn raw_fds(&self) -> [RawFd; 2] {
        [self.to_peer.as_raw_fd(), self.from_peer.as_raw_fd()]
    }
}

/// Starts peer roles in their own execution contexts
#[derive(Debug, Clone)]
pub struct Spawner<P = OsPipes> {
    isolation: Isolation,
    pipes:     P,
}

impl Spawner<OsPipes> {
    pub fn new(isolation: Isolation) -> Self {
        Self::with_pipes(isolation, OsPipes)
    }
}

impl<P: PipeFactory> Spawner<P> {
    pub fn with_pipes(isolation: Isolation, pipes: P) -> Self {
        Self { isolation, pipes }
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Spawns `role` and returns the channel to talk to it.
    ///
    /// `detach` lists descriptors the caller holds for other peers; a
    /// forked child closes them before running the role.
    pub fn spawn<F>(
        &self,
        name: &'static str,
        role: F,
        detach: &[RawFd],
    ) -> Result<PeerChannel, SpawnError>
    where
        F: FnOnce(DescriptorPair) -> i32 + Send + 'static,
    {
        // Data into the peer, then data out of it. If the second pipe fails
        // the first pair is dropped, and closed, on return.
        let (inbound_read, inbound_write) = self.pipes.pipe().map_err(SpawnError::Pipe)?;
        let (outbound_read, outbound_write) = self.pipes.pipe().map_err(SpawnError::Pipe)?;

        let peer_ends = DescriptorPair::new(inbound_read, outbound_write);
        let to_peer = File::from(inbound_write);
        let from_peer = File::from(outbound_read);

        let handle = match self.isolation {
            Isolation::Thread => {
                let handle = thread::Builder::new()
                    .name(format!("{name}-role"))
                    .spawn(move || role(peer_ends))
                    .map_err(|source| SpawnError::Thread { name, source })?;
                PeerHandle::Thread { name, handle }
            }
            Isolation::Process => {
                // SAFETY: the child only closes descriptors, runs the role on
                // the ends it owns and exits without returning to the caller.
                match unsafe { fork() }.map_err(SpawnError::Fork)? {
                    ForkResult::Child => {
                        drop(to_peer);
                        drop(from_peer);
                        for fd in detach {
                            let _ = nix::unistd::close(*fd);
                        }
                        let status = role(peer_ends);
                        let _ = io::stdout().flush();
                        let _ = io::stderr().flush();
                        process::exit(status);
                    }
                    ForkResult::Parent { child } => {
                        drop(peer_ends);
                        PeerHandle::Process { name, pid: child }
                    }
                }
            }
        };

        tracing::debug!("Spawned {:?}", handle);
        Ok(PeerChannel {
            to_peer,
            from_peer,
            handle,
        })
    }
}
