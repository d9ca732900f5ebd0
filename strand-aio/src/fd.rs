//! The buffered file descriptor.
//!
//! One [`BufferedFd`] owns one kernel socket or pipe and turns the runtime's
//! raw `receive`/`write` events into framed reads and coalesced writes:
//!
//! - reads are a queue of commands (`any`, `exactly n`, `until delimiter`)
//!   resolved strictly in enqueue order by the drive pass;
//! - writes append to one outgoing buffer, with one completion promise per
//!   submitted range, resolved as the send cursor passes the range end;
//! - an optional TLS pipe (rustls) sits between the wire and both paths, so
//!   callers only ever see plaintext.
//!
//! Nothing here retries: any I/O error moves the descriptor to `closing` and
//! deterministically fails every queued read (`error = true`) and write
//! (`false`).

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    fmt, io,
    io::{Read, Write},
    rc::Rc,
    sync::Arc,
};

use tracing::trace;

use crate::{
    kmp::DelimiterMatcher,
    lock::FairLock,
    promise::{Promise, WeakPromise},
    runtime::Runtime,
};

/// Raw descriptor handle as handed out by the ambient runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Fd(pub u64);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd#{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FdKind {
    Socket,
    Pipe,
    Other,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CloseState {
    Open,
    Closing,
    Closed,
}

/// Outcome of one read command: either bytes or a failed descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadArg {
    pub error: bool,
    pub data: Vec<u8>,
}

impl ReadArg {
    pub fn ok(data: Vec<u8>) -> ReadArg {
        ReadArg { error: false, data }
    }

    pub fn failed() -> ReadArg {
        ReadArg {
            error: true,
            data: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        !self.error
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SslResult {
    pub error: bool,
    pub message: String,
}

impl SslResult {
    fn ok() -> SslResult {
        SslResult {
            error: false,
            message: String::new(),
        }
    }

    fn err(message: impl Into<String>) -> SslResult {
        SslResult {
            error: true,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        !self.error
    }
}

enum ReadCommandKind {
    Any,
    Exactly(usize),
    Until(DelimiterMatcher),
}

struct ReadCommand {
    promise: WeakPromise<ReadArg>,
    kind: ReadCommandKind,
}

struct WriteCompletion {
    promise: WeakPromise<bool>,
    length: usize,
    sent: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TlsStatus {
    ClientHandshake,
    ClientReady,
    ServerHandshake,
    ServerReady,
}

struct TlsPipe {
    conn: rustls::Connection,
    status: TlsStatus,
}

impl TlsPipe {
    fn is_ready(&self) -> bool {
        matches!(self.status, TlsStatus::ClientReady | TlsStatus::ServerReady)
    }
}

fn drain_ciphertext(conn: &mut rustls::Connection) -> Vec<u8> {
    let mut out = Vec::new();
    while conn.wants_write() {
        match conn.write_tls(&mut out) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    out
}

fn drain_plaintext(conn: &mut rustls::Connection, out: &mut Vec<u8>) {
    let mut buf = [0u8; 4096];
    loop {
        match conn.reader().read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
}

fn feed_ciphertext(conn: &mut rustls::Connection, mut data: &[u8]) -> Result<(), rustls::Error> {
    while !data.is_empty() {
        match conn.read_tls(&mut data) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        conn.process_new_packets()?;
    }
    Ok(())
}

pub struct BufferedFd {
    runtime: Rc<dyn Runtime>,
    fd: Fd,
    kind: FdKind,
    closed: Cell<CloseState>,
    has_error: Cell<bool>,
    accepted: Cell<bool>,
    name: RefCell<String>,

    read_buffer: RefCell<Vec<u8>>,
    read_offset: Cell<usize>,
    read_commands: RefCell<VecDeque<ReadCommand>>,
    on_empty: RefCell<Option<Rc<dyn Fn()>>>,

    write_buffer: RefCell<Vec<u8>>,
    write_offset: Cell<usize>,
    write_completions: RefCell<VecDeque<WriteCompletion>>,

    tls: RefCell<Option<TlsPipe>>,
    lock: FairLock,
    user_data: RefCell<HashMap<String, String>>,
    remote: RefCell<Option<(String, u16)>>,
}

impl BufferedFd {
    pub fn new(runtime: Rc<dyn Runtime>, fd: Fd, kind: FdKind) -> BufferedFd {
        BufferedFd {
            runtime,
            fd,
            kind,
            closed: Cell::new(CloseState::Open),
            has_error: Cell::new(false),
            accepted: Cell::new(false),
            name: RefCell::new(fd.to_string()),
            read_buffer: RefCell::new(Vec::new()),
            read_offset: Cell::new(0),
            read_commands: RefCell::new(VecDeque::new()),
            on_empty: RefCell::new(None),
            write_buffer: RefCell::new(Vec::new()),
            write_offset: Cell::new(0),
            write_completions: RefCell::new(VecDeque::new()),
            tls: RefCell::new(None),
            lock: FairLock::new(),
            user_data: RefCell::new(HashMap::new()),
            remote: RefCell::new(None),
        }
    }

    /// Placeholder descriptor standing in for a dial that never happened.
    pub fn failed(runtime: Rc<dyn Runtime>) -> BufferedFd {
        let fd = BufferedFd::new(runtime, Fd(0), FdKind::Other);
        fd.closed.set(CloseState::Closed);
        fd.has_error.set(true);
        fd
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub fn kind(&self) -> FdKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get() != CloseState::Open
    }

    pub fn is_error(&self) -> bool {
        self.has_error.get()
    }

    pub fn is_secure(&self) -> bool {
        self.tls.borrow().is_some()
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.borrow_mut() = name.into();
    }

    pub fn was_accepted(&self) -> bool {
        self.accepted.get()
    }

    pub fn set_user_data(&self, key: impl Into<String>, value: impl Into<String>) {
        self.user_data.borrow_mut().insert(key.into(), value.into());
    }

    pub fn user_data(&self, key: &str) -> Option<String> {
        self.user_data.borrow().get(key).cloned()
    }

    pub fn remote_addr(&self) -> Option<(String, u16)> {
        self.remote.borrow().clone()
    }

    pub fn set_remote_addr(&self, ip: impl Into<String>, port: u16) {
        *self.remote.borrow_mut() = Some((ip.into(), port));
    }

    /// Called when the read-command queue drains; cyclic protocols use this
    /// to enqueue the next command without recursing.
    pub fn set_on_empty_queue(&self, on_empty: impl Fn() + 'static) {
        *self.on_empty.borrow_mut() = Some(Rc::new(on_empty));
    }

    pub fn lock(&self) -> Promise<bool> {
        self.lock.lock()
    }

    pub fn unlock(&self) {
        self.lock.unlock()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    // --- read path -------------------------------------------------------

    /// Resolve with whatever bytes arrive next.
    pub fn read_any(&self) -> Promise<ReadArg> {
        self.push_read_command(ReadCommandKind::Any)
    }

    /// Resolve with exactly `n` bytes once that many are buffered.
    pub fn read_n(&self, n: usize) -> Promise<ReadArg> {
        self.push_read_command(ReadCommandKind::Exactly(n))
    }

    /// Resolve with the bytes preceding `delimiter`; the delimiter itself is
    /// consumed and never shows up in any later read.
    pub fn read_until(&self, delimiter: &[u8]) -> Promise<ReadArg> {
        self.push_read_command(ReadCommandKind::Until(DelimiterMatcher::new(delimiter)))
    }

    fn push_read_command(&self, kind: ReadCommandKind) -> Promise<ReadArg> {
        let promise = Promise::new();
        if self.is_closed() {
            promise.resolve(ReadArg::failed());
            return promise;
        }
        let force_cycle = {
            let mut commands = self.read_commands.borrow_mut();
            commands.push_back(ReadCommand {
                promise: promise.downgrade(),
                kind,
            });
            commands.len() == 1 && !self.read_buffer.borrow().is_empty()
        };
        if force_cycle {
            // older leftover bytes may already satisfy this command
            self.on_data(&[], true);
        }
        promise
    }

    /// One drive pass: ingest newly arrived bytes and satisfy as many queued
    /// read commands as the buffered window allows.
    pub fn on_data(&self, data: &[u8], cycle: bool) {
        let decoded;
        let mut data = data;
        if !data.is_empty() && self.tls_ready() {
            decoded = self.tls_decode(data);
            data = &decoded;
        }

        if self.is_closed() {
            return;
        }

        if !cycle && self.read_commands.borrow().is_empty() {
            let on_empty = self.on_empty.borrow().clone();
            if let Some(cb) = on_empty {
                cb();
            }
        }

        if !cycle && data.is_empty() {
            return;
        }
        if self.read_buffer.borrow().len() + data.len() - self.read_offset.get() == 0 {
            return;
        }

        let mut resolutions: Vec<(WeakPromise<ReadArg>, ReadArg)> = Vec::new();
        {
            let mut buffer = self.read_buffer.borrow_mut();
            buffer.extend_from_slice(data);
            let mut commands = self.read_commands.borrow_mut();
            let mut offset = self.read_offset.get();

            // (consumed, returned, whether the pass stops after resolving)
            struct Step(usize, usize, bool);
            loop {
                if offset == buffer.len() {
                    break;
                }
                let step = {
                    let front = match commands.front_mut() {
                        Some(front) => front,
                        None => break,
                    };
                    let window = &buffer[offset..];
                    match &mut front.kind {
                        ReadCommandKind::Any => Some(Step(window.len(), window.len(), true)),
                        ReadCommandKind::Exactly(n) => {
                            if window.len() < *n {
                                None
                            } else {
                                Some(Step(*n, *n, false))
                            }
                        }
                        // a partial match parks inside the matcher and waits
                        // for the next arrival
                        ReadCommandKind::Until(matcher) => {
                            let delimiter_len = matcher.delimiter_len();
                            matcher
                                .find(window)
                                .map(|end| Step(end, end - delimiter_len, false))
                        }
                    }
                };
                match step {
                    None => break,
                    Some(Step(consumed, returned, stop_after)) => {
                        let arg = ReadArg::ok(buffer[offset..offset + returned].to_vec());
                        offset += consumed;
                        let cmd = commands.pop_front().expect("front exists");
                        resolutions.push((cmd.promise, arg));
                        if stop_after {
                            break;
                        }
                    }
                }
            }

            if offset == buffer.len() {
                buffer.clear();
                offset = 0;
            }
            self.read_offset.set(offset);
        }

        for (promise, arg) in resolutions {
            promise.resolve(arg);
        }
    }

    // --- write path ------------------------------------------------------

    /// Queue `data` for sending; resolves `true` once the runtime has
    /// acknowledged every byte of it.
    pub fn write(&self, data: &[u8]) -> Promise<bool> {
        self.write_with(data, true)
    }

    /// Like [`write`](Self::write) but skipping the TLS layer; the handshake
    /// uses this to put raw ciphertext on the wire.
    pub fn write_raw(&self, data: &[u8]) -> Promise<bool> {
        self.write_with(data, false)
    }

    fn write_with(&self, data: &[u8], layers: bool) -> Promise<bool> {
        let promise = Promise::new();
        let encoded;
        let mut data = data;
        if layers && self.tls_ready() {
            encoded = self.tls_encode(data);
            data = &encoded;
        }

        if self.is_closed() {
            trace!(fd = %self.fd, "write on a closed descriptor");
            promise.resolve(false);
            return promise;
        }

        let first = {
            let mut buffer = self.write_buffer.borrow_mut();
            buffer.extend_from_slice(data);
            let mut completions = self.write_completions.borrow_mut();
            completions.push_back(WriteCompletion {
                promise: promise.downgrade(),
                length: data.len(),
                sent: 0,
            });
            completions.len() == 1
        };

        if first {
            // nothing was in flight, so kick the kernel now instead of
            // waiting for a writable event that will never come
            match self.perform_write() {
                Ok(n) if n > 0 => self.on_write(n),
                Ok(_) => {}
                Err(_) => self.fail_all(),
            }
        }
        promise
    }

    fn perform_write(&self) -> io::Result<usize> {
        let result = {
            let buffer = self.write_buffer.borrow();
            self.runtime.write(self.fd, &buffer[self.write_offset.get()..])
        };
        if result.is_err() {
            self.closed.set(CloseState::Closing);
        }
        result
    }

    /// Advance the send cursor and resolve every fully covered completion, in
    /// queue order. `written == 0` means "the descriptor is writable again".
    pub fn on_write(&self, written: usize) {
        if self.is_closed() {
            return;
        }
        let mut written = written;
        let mut resolutions: Vec<WeakPromise<bool>> = Vec::new();
        loop {
            let do_write = written == 0;
            self.write_offset.set(self.write_offset.get() + written);

            {
                let mut completions = self.write_completions.borrow_mut();
                loop {
                    let covered = match completions.front_mut() {
                        Some(head) => {
                            if head.sent + written >= head.length {
                                written -= head.length - head.sent;
                                true
                            } else if written > 0 {
                                // first partially covered completion; nothing
                                // behind it can be complete either
                                head.sent += written;
                                written = 0;
                                false
                            } else {
                                false
                            }
                        }
                        None => false,
                    };
                    if !covered {
                        break;
                    }
                    let done = completions.pop_front().expect("front exists");
                    resolutions.push(done.promise);
                }
            }

            let pending = self.write_offset.get() < self.write_buffer.borrow().len();
            if pending && do_write {
                match self.perform_write() {
                    Ok(n) if n > 0 => written = n,
                    Ok(_) => break,
                    Err(_) => {
                        self.fail_all();
                        return;
                    }
                }
            } else {
                break;
            }
        }

        if self.write_completions.borrow().is_empty() {
            self.write_buffer.borrow_mut().clear();
            self.write_offset.set(0);
        }
        for promise in resolutions {
            promise.resolve(true);
        }
    }

    // --- lifecycle -------------------------------------------------------

    pub fn on_accept(&self) {
        self.accepted.set(true);
    }

    pub fn on_close(&self) {
        if self.closed.get() != CloseState::Closed {
            self.closed.set(CloseState::Closed);
            self.fail_all();
        }
    }

    /// Close the descriptor. Calling this twice is benign. With `immediate`
    /// the runtime delivers `on_close` synchronously; otherwise the queued
    /// operations are failed right here since no event will come back.
    pub fn close(&self, immediate: bool) {
        if self.closed.get() == CloseState::Open {
            self.closed.set(CloseState::Closing);
            self.runtime.close(self.fd, immediate);
            if !immediate {
                self.closed.set(CloseState::Closed);
                self.fail_all();
            }
        }
    }

    /// Fail every queued read and write, in queue order, and drop both
    /// buffers.
    fn fail_all(&self) {
        let reads: Vec<_> = self.read_commands.borrow_mut().drain(..).collect();
        let writes: Vec<_> = self.write_completions.borrow_mut().drain(..).collect();
        self.read_buffer.borrow_mut().clear();
        self.read_offset.set(0);
        self.write_buffer.borrow_mut().clear();
        self.write_offset.set(0);
        for cmd in reads {
            cmd.promise.resolve(ReadArg::failed());
        }
        for completion in writes {
            completion.promise.resolve(false);
        }
    }

    // --- TLS pipe --------------------------------------------------------

    fn tls_ready(&self) -> bool {
        self.tls.borrow().as_ref().map_or(false, TlsPipe::is_ready)
    }

    fn tls_encode(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(pipe) = self.tls.borrow_mut().as_mut() {
            let _ = pipe.conn.writer().write_all(data);
            out = drain_ciphertext(&mut pipe.conn);
        }
        out
    }

    fn tls_decode(&self, data: &[u8]) -> Vec<u8> {
        let mut plaintext = Vec::new();
        let mut outgoing = Vec::new();
        if let Some(pipe) = self.tls.borrow_mut().as_mut() {
            if feed_ciphertext(&mut pipe.conn, data).is_err() {
                self.has_error.set(true);
            }
            drain_plaintext(&mut pipe.conn, &mut plaintext);
            outgoing = drain_ciphertext(&mut pipe.conn);
        }
        if !outgoing.is_empty() {
            // session tickets and the like flow back out through the raw path
            let _ = self.write_raw(&outgoing);
        }
        plaintext
    }

    fn teardown_tls(&self) {
        *self.tls.borrow_mut() = None;
    }

    /// Finish whatever the handshake decoded beyond the handshake itself.
    fn tls_finish(&self, status: TlsStatus) {
        let mut plaintext = Vec::new();
        if let Some(pipe) = self.tls.borrow_mut().as_mut() {
            drain_plaintext(&mut pipe.conn, &mut plaintext);
            pipe.status = status;
        }
        if !plaintext.is_empty() {
            self.read_buffer.borrow_mut().extend_from_slice(&plaintext);
        }
    }

    /// Drive a client-side TLS handshake over this descriptor. Reads and
    /// writes keep using the raw path until the handshake completes; from
    /// then on both directions pass through the cipher pipe.
    pub async fn enable_client_ssl(
        self: Rc<Self>,
        config: Arc<rustls::ClientConfig>,
        hostname: &str,
    ) -> SslResult {
        let server_name = rustls::ServerName::try_from(hostname)
            .or_else(|_| rustls::ServerName::try_from("localhost"))
            .map_err(|e| e.to_string());
        let server_name = match server_name {
            Ok(n) => n,
            Err(e) => return SslResult::err(e),
        };
        let conn = match rustls::ClientConnection::new(config, server_name) {
            Ok(c) => rustls::Connection::Client(c),
            Err(e) => return SslResult::err(e.to_string()),
        };
        *self.tls.borrow_mut() = Some(TlsPipe {
            conn,
            status: TlsStatus::ClientHandshake,
        });

        loop {
            let outgoing = match self.tls.borrow_mut().as_mut() {
                Some(pipe) => drain_ciphertext(&mut pipe.conn),
                None => return SslResult::err("handshake aborted"),
            };
            if !outgoing.is_empty() && !self.write_raw(&outgoing).await {
                self.teardown_tls();
                return SslResult::err("failed to write to fd");
            }

            let handshaking = self
                .tls
                .borrow()
                .as_ref()
                .map_or(false, |p| p.conn.is_handshaking());
            if !handshaking {
                break;
            }

            let arg = self.read_any().await;
            if arg.error {
                self.teardown_tls();
                return SslResult::err("failed to read from fd");
            }
            let fed = match self.tls.borrow_mut().as_mut() {
                Some(pipe) => feed_ciphertext(&mut pipe.conn, &arg.data),
                None => return SslResult::err("handshake aborted"),
            };
            if let Err(e) = fed {
                self.teardown_tls();
                return SslResult::err(e.to_string());
            }
        }

        self.tls_finish(TlsStatus::ClientReady);
        SslResult::ok()
    }

    /// Server-side counterpart of [`enable_client_ssl`](Self::enable_client_ssl).
    pub async fn enable_server_ssl(
        self: Rc<Self>,
        config: Arc<rustls::ServerConfig>,
    ) -> SslResult {
        let conn = match rustls::ServerConnection::new(config) {
            Ok(c) => rustls::Connection::Server(c),
            Err(e) => return SslResult::err(e.to_string()),
        };
        *self.tls.borrow_mut() = Some(TlsPipe {
            conn,
            status: TlsStatus::ServerHandshake,
        });

        loop {
            let handshaking = self
                .tls
                .borrow()
                .as_ref()
                .map_or(false, |p| p.conn.is_handshaking());
            if !handshaking {
                break;
            }

            let arg = self.read_any().await;
            if arg.error {
                self.teardown_tls();
                return SslResult::err("failed to read from fd");
            }
            let fed = match self.tls.borrow_mut().as_mut() {
                Some(pipe) => feed_ciphertext(&mut pipe.conn, &arg.data),
                None => return SslResult::err("handshake aborted"),
            };
            if let Err(e) = fed {
                self.teardown_tls();
                return SslResult::err(e.to_string());
            }

            let outgoing = match self.tls.borrow_mut().as_mut() {
                Some(pipe) => drain_ciphertext(&mut pipe.conn),
                None => return SslResult::err("handshake aborted"),
            };
            if !outgoing.is_empty() && !self.write_raw(&outgoing).await {
                self.teardown_tls();
                return SslResult::err("failed to write to fd");
            }
        }

        self.tls_finish(TlsStatus::ServerReady);
        SslResult::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedLoop;
    use std::{cell::RefCell, rc::Rc};

    fn fresh_fd() -> (Rc<SimulatedLoop>, Rc<BufferedFd>) {
        let sim = Rc::new(SimulatedLoop::new(1));
        let fd = Rc::new(BufferedFd::new(sim.clone(), Fd(7), FdKind::Socket));
        (sim, fd)
    }

    fn results_of(promise: &Promise<ReadArg>, into: &Rc<RefCell<Vec<ReadArg>>>) {
        let into = into.clone();
        promise.then(move |arg| into.borrow_mut().push(arg));
    }

    #[test]
    fn exact_reads_across_packet_splits() {
        // 10-byte and 5-byte commands fed 3 + 4 + 20 bytes: the first two
        // resolve with their exact ranges and the 12-byte tail stays buffered.
        let (_sim, fd) = fresh_fd();
        let got = Rc::new(RefCell::new(Vec::new()));
        let p1 = fd.read_n(10);
        results_of(&p1, &got);
        let p2 = fd.read_n(5);
        results_of(&p2, &got);

        fd.on_data(b"abc", false);
        assert!(got.borrow().is_empty());
        fd.on_data(b"defg", false);
        assert!(got.borrow().is_empty());
        fd.on_data(b"hijKLMNOPQRSTUVWXYZ!", false);

        assert_eq!(
            *got.borrow(),
            vec![
                ReadArg::ok(b"abcdefghij".to_vec()),
                ReadArg::ok(b"KLMNO".to_vec()),
            ]
        );
        assert_eq!(fd.read_buffer.borrow().len() - fd.read_offset.get(), 12);

        // the tail feeds the next command untouched
        let last = Rc::new(RefCell::new(Vec::new()));
        let p3 = fd.read_n(12);
        results_of(&p3, &last);
        assert_eq!(*last.borrow(), vec![ReadArg::ok(b"PQRSTUVWXYZ!".to_vec())]);
    }

    #[test]
    fn split_delimiter_resolves_once_completed() {
        let (_sim, fd) = fresh_fd();
        let got = Rc::new(RefCell::new(Vec::new()));
        let p1 = fd.read_until(b"\r\n\r\n");
        results_of(&p1, &got);

        fd.on_data(b"abc\r\n", false);
        assert!(got.borrow().is_empty());
        fd.on_data(b"\r", false);
        assert!(got.borrow().is_empty());
        fd.on_data(b"\n", false);
        assert_eq!(*got.borrow(), vec![ReadArg::ok(b"abc".to_vec())]);

        // delimiter was consumed; the very next byte is visible to the next
        // command
        let next = Rc::new(RefCell::new(Vec::new()));
        let p2 = fd.read_any();
        results_of(&p2, &next);
        fd.on_data(b"x", false);
        assert_eq!(*next.borrow(), vec![ReadArg::ok(b"x".to_vec())]);
    }

    #[test]
    fn buffered_bytes_satisfy_a_late_command() {
        let (_sim, fd) = fresh_fd();
        fd.on_data(b"early", false);
        let got = Rc::new(RefCell::new(Vec::new()));
        results_of(&fd.read_any(), &got);
        assert_eq!(*got.borrow(), vec![ReadArg::ok(b"early".to_vec())]);
    }

    #[test]
    fn reads_resolve_in_enqueue_order() {
        let (_sim, fd) = fresh_fd();
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut pending = Vec::new();
        for (i, n) in [3usize, 2, 4].into_iter().enumerate() {
            let order = order.clone();
            let p = fd.read_n(n);
            p.then(move |arg| {
                assert!(arg.is_ok());
                order.borrow_mut().push(i);
            });
            pending.push(p);
        }
        fd.on_data(b"aaabbccccdd", false);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn byte_conservation_over_arbitrary_chunking() {
        let (_sim, fd) = fresh_fd();
        let input = b"the quick brown fox jumps over the lazy dog";
        let got = Rc::new(RefCell::new(Vec::new()));
        let mut pending = Vec::new();
        for _ in 0..6 {
            let got = got.clone();
            let p = fd.read_n(7);
            p.then(move |arg| {
                got.borrow_mut().extend_from_slice(&arg.data);
            });
            pending.push(p);
        }
        for chunk in input.chunks(5) {
            fd.on_data(chunk, false);
        }
        assert_eq!(&got.borrow()[..], &input[..42]);
    }

    #[test]
    fn write_completion_tracks_acknowledged_bytes() {
        let (sim, fd) = fresh_fd();
        sim.set_write_window(4);

        let done = Rc::new(RefCell::new(Vec::new()));
        let done2 = done.clone();
        let pending = fd.write(b"0123456789");
        pending.then(move |ok| done2.borrow_mut().push(ok));

        // only 4 bytes went out so far
        assert!(done.borrow().is_empty());
        assert_eq!(sim.written(Fd(7)), b"0123".to_vec());

        // writable again: flush the next windows
        fd.on_write(0);
        assert!(done.borrow().is_empty());
        fd.on_write(0);
        assert_eq!(*done.borrow(), vec![true]);
        assert_eq!(sim.written(Fd(7)), b"0123456789".to_vec());
    }

    #[test]
    fn queued_writes_resolve_in_order() {
        let (sim, fd) = fresh_fd();
        sim.set_write_window(0);
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut pending = Vec::new();
        for (i, data) in [&b"aa"[..], b"bbb", b"c"].iter().enumerate() {
            let order = order.clone();
            let p = fd.write(data);
            p.then(move |ok| {
                assert!(ok);
                order.borrow_mut().push(i);
            });
            pending.push(p);
        }
        sim.set_write_window(usize::MAX);
        fd.on_write(0);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(sim.written(Fd(7)), b"aabbbc".to_vec());
    }

    #[test]
    fn close_fails_pending_operations_deterministically() {
        let (sim, fd) = fresh_fd();
        sim.set_write_window(0);
        let read = fd.read_n(4);
        let write = fd.write(b"data");
        let reads = Rc::new(RefCell::new(Vec::new()));
        results_of(&read, &reads);
        let writes = Rc::new(RefCell::new(Vec::new()));
        let writes2 = writes.clone();
        write.then(move |ok| writes2.borrow_mut().push(ok));

        fd.close(false);
        assert_eq!(*reads.borrow(), vec![ReadArg::failed()]);
        assert_eq!(*writes.borrow(), vec![false]);

        // second close is a no-op
        fd.close(false);
        assert_eq!(sim.closes(), vec![(Fd(7), false)]);

        // commands issued after the close fail immediately
        assert!(fd.read_any().is_resolved());
    }

    #[test]
    fn on_empty_queue_callback_feeds_the_loop() {
        let (_sim, fd) = fresh_fd();
        let fired = Rc::new(RefCell::new(0));
        {
            let fired = fired.clone();
            fd.set_on_empty_queue(move || *fired.borrow_mut() += 1);
        }
        fd.on_data(b"ignored", false);
        assert_eq!(*fired.borrow(), 1);
    }
}
