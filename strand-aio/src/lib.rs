//! Asynchronous I/O substrate for one-event-loop-per-worker services.
//!
//! The ambient runtime delivers raw events (`accept`, `receive`, `write`,
//! `close`, `message`) to a per-worker [`Context`]. The context demultiplexes
//! them onto [`BufferedFd`]s, which turn byte arrivals into resolved
//! [`Promise`]s for the protocol state machines awaiting them. Nothing in
//! here ever blocks the worker thread; blocking work goes through
//! [`Context::exec_async`] onto a small thread pool and comes back as a
//! mailbox message.

pub mod actor;
pub mod errors;
pub mod fd;
pub mod kmp;
pub mod lock;
pub mod mailbox;
pub mod promise;
pub mod runtime;
pub mod sim;

mod context;

pub use context::{
    ConnectResult, ConnectionHandler, Context, Proto, RecordKind, Storable, TaskResult,
};
pub use fd::{BufferedFd, Fd, FdKind, ReadArg, SslResult};
pub use promise::{Promise, WeakPromise};
pub use runtime::{master_key_from_env, Mailer, NodeId, Runtime};
