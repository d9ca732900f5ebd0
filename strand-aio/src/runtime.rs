//! The handler-facing contract with the ambient event loop.
//!
//! The outer supervisor owns the listening sockets, the epoll loop and the
//! worker threads; this crate only sees it through [`Runtime`]. Everything
//! here is non-blocking: `write` may accept fewer bytes than offered and the
//! rest is retried when the loop reports the descriptor writable again.

use std::{io, sync::Arc};

use crate::fd::Fd;

/// Identity of one worker within the cluster: `(host, port, worker index)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeId {
    pub name: String,
    pub port: u16,
    pub worker: usize,
    pub workers: usize,
}

impl NodeId {
    pub fn from_env(worker: usize, workers: usize) -> NodeId {
        NodeId {
            name: std::env::var("NODE_NAME").unwrap_or_else(|_| "localhost".to_owned()),
            port: std::env::var("NODE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            worker,
            workers,
        }
    }
}

/// Shared secret keying actor-message signatures and signed query
/// parameters.
pub fn master_key_from_env() -> String {
    std::env::var("MASTER_KEY").unwrap_or_default()
}

/// Outbound calls into the ambient runtime.
pub trait Runtime {
    /// Dial `ip:port`; the returned descriptor is not yet connected for TCP
    /// (wait for the first writable event).
    fn connect(&self, ip: &str, port: u16, udp: bool) -> io::Result<Fd>;

    /// Non-blocking write; returns how many bytes the kernel took.
    fn write(&self, fd: Fd, data: &[u8]) -> io::Result<usize>;

    /// Close a descriptor. With `immediate` the runtime delivers `on_close`
    /// before returning; without it no close event will come back.
    fn close(&self, fd: Fd, immediate: bool);

    fn quit(&self);
    fn reload(&self);

    /// Thread-safe handle for posting mailbox messages; pool and tick threads
    /// hold one of these.
    fn mailer(&self) -> Arc<dyn Mailer>;
}

/// Cross-worker mailbox producer. Order per sender is preserved by the
/// runtime's queue.
pub trait Mailer: Send + Sync {
    fn mail(&self, worker: usize, message: Vec<u8>);
}
