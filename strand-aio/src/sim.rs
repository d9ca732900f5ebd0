//! Simulated event loop.
//!
//! Stands in for the ambient runtime in tests: dialed descriptors are
//! fabricated, written bytes are captured per descriptor, closes are
//! recorded, and mailbox messages land in an inspectable queue instead of
//! another worker. Protocol tests drive wire bytes through
//! `Context::on_receive` and assert on what landed here.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
};

use crate::{
    fd::Fd,
    runtime::{Mailer, Runtime},
};

pub struct SimulatedLoop {
    workers: usize,
    next_fd: Cell<u64>,
    write_window: Cell<usize>,
    fail_connects: Cell<bool>,
    writes: RefCell<HashMap<Fd, Vec<u8>>>,
    closes: RefCell<Vec<(Fd, bool)>>,
    dials: RefCell<Vec<(String, u16, bool, Fd)>>,
    quits: Cell<usize>,
    reloads: Cell<usize>,
    mailer: Arc<SimMailer>,
}

impl SimulatedLoop {
    pub fn new(workers: usize) -> SimulatedLoop {
        SimulatedLoop {
            workers,
            next_fd: Cell::new(100),
            write_window: Cell::new(usize::MAX),
            fail_connects: Cell::new(false),
            writes: RefCell::new(HashMap::new()),
            closes: RefCell::new(Vec::new()),
            dials: RefCell::new(Vec::new()),
            quits: Cell::new(0),
            reloads: Cell::new(0),
            mailer: Arc::new(SimMailer::default()),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Cap how many bytes a single `write` call accepts; lets tests exercise
    /// partial-write accounting.
    pub fn set_write_window(&self, bytes: usize) {
        self.write_window.set(bytes);
    }

    pub fn set_fail_connects(&self, fail: bool) {
        self.fail_connects.set(fail);
    }

    pub fn written(&self, fd: Fd) -> Vec<u8> {
        self.writes.borrow().get(&fd).cloned().unwrap_or_default()
    }

    pub fn take_written(&self, fd: Fd) -> Vec<u8> {
        self.writes.borrow_mut().remove(&fd).unwrap_or_default()
    }

    pub fn closes(&self) -> Vec<(Fd, bool)> {
        self.closes.borrow().clone()
    }

    pub fn quit_requests(&self) -> usize {
        self.quits.get()
    }

    pub fn reload_requests(&self) -> usize {
        self.reloads.get()
    }

    pub fn dials(&self) -> Vec<(String, u16, bool, Fd)> {
        self.dials.borrow().clone()
    }

    pub fn last_dialed(&self) -> Option<Fd> {
        self.dials.borrow().last().map(|d| d.3)
    }

    /// Drain every mailbox message queued so far as `(worker, payload)`.
    pub fn take_mail(&self) -> Vec<(usize, Vec<u8>)> {
        let mut queue = self.mailer.queue.lock().expect("sim mailbox poisoned");
        std::mem::take(&mut *queue)
    }
}

impl Runtime for SimulatedLoop {
    fn connect(&self, ip: &str, port: u16, udp: bool) -> io::Result<Fd> {
        if self.fail_connects.get() {
            return Err(io::Error::new(io::ErrorKind::Other, "dial refused"));
        }
        let fd = Fd(self.next_fd.get());
        self.next_fd.set(fd.0 + 1);
        self.dials.borrow_mut().push((ip.to_owned(), port, udp, fd));
        Ok(fd)
    }

    fn write(&self, fd: Fd, data: &[u8]) -> io::Result<usize> {
        let take = data.len().min(self.write_window.get());
        self.writes
            .borrow_mut()
            .entry(fd)
            .or_default()
            .extend_from_slice(&data[..take]);
        Ok(take)
    }

    fn close(&self, fd: Fd, immediate: bool) {
        self.closes.borrow_mut().push((fd, immediate));
    }

    fn quit(&self) {
        self.quits.set(self.quits.get() + 1);
    }

    fn reload(&self) {
        self.reloads.set(self.reloads.get() + 1);
    }

    fn mailer(&self) -> Arc<dyn Mailer> {
        self.mailer.clone()
    }
}

#[derive(Default)]
pub struct SimMailer {
    pub queue: Mutex<Vec<(usize, Vec<u8>)>>,
}

impl Mailer for SimMailer {
    fn mail(&self, worker: usize, message: Vec<u8>) {
        self.queue
            .lock()
            .expect("sim mailbox poisoned")
            .push((worker, message));
    }
}
