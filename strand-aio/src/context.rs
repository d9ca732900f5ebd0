//! Per-worker context.
//!
//! One context per worker owns every live descriptor (weakly; the in-flight
//! protocol handlers hold them strongly), routes runtime events onto them,
//! dials outbound connections with optional name-deduplication, offloads
//! blocking jobs to a small thread pool, exchanges mailbox messages with the
//! other workers (task completions, actor messages, ticks) and mints
//! snowflake identifiers.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    fs::File,
    future::Future,
    io::BufReader,
    rc::{Rc, Weak},
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use chrono::Utc;
use futures::{
    executor::{LocalPool, LocalSpawner},
    future::LocalBoxFuture,
    task::LocalSpawnExt,
};
use tracing::{trace, warn};

use crate::{
    actor::{sign_message, Actor, Pid},
    errors,
    fd::{BufferedFd, Fd, FdKind},
    mailbox::MailboxMessage,
    promise::{Promise, WeakPromise},
    runtime::{Mailer, NodeId, Runtime},
};

const POOL_THREADS: usize = 4;
const TICK_PERIOD: u64 = 1;
const SNOWFLAKE_EPOCH: u64 = 1_713_377_769;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Proto {
    Tcp,
    Udp,
    Tls,
}

/// DNS record kinds the framework cares about; values are the RFC-1035
/// numeric types.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordKind {
    A = 1,
    Cname = 5,
    Mx = 15,
    Txt = 16,
    Aaaa = 28,
}

/// `(error, fd, message)` triple handed back by [`Context::connect`].
#[derive(Clone)]
pub struct ConnectResult {
    pub error: bool,
    pub fd: Option<Rc<BufferedFd>>,
    pub message: String,
}

impl ConnectResult {
    pub fn ok(fd: Rc<BufferedFd>) -> ConnectResult {
        ConnectResult {
            error: false,
            fd: Some(fd),
            message: String::new(),
        }
    }

    pub fn err(message: impl Into<String>) -> ConnectResult {
        ConnectResult {
            error: true,
            fd: None,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        !self.error && self.fd.is_some()
    }

    pub fn fd_ok(&self) -> Option<Rc<BufferedFd>> {
        if self.error {
            None
        } else {
            self.fd.clone()
        }
    }
}

/// Named side-table the context keeps alive across requests; `update` is the
/// periodic flush hook driven by ticks.
pub trait Storable: 'static {
    fn update(&self) {}
    fn as_any(&self) -> &dyn Any;
}

/// A protocol server: gets one call per accepted connection plus the
/// load/refresh lifecycle.
#[async_trait::async_trait(?Send)]
pub trait ConnectionHandler {
    async fn on_accept(self: Rc<Self>, ctx: Rc<Context>, fd: Rc<BufferedFd>);

    fn on_load(&self, _ctx: &Rc<Context>) {}
    fn on_pre_refresh(&self) {}
    fn on_refresh(&self) {}
}

/// Boxed outcome of an offloaded blocking job.
pub type TaskResult = Box<dyn Any + Send>;
type TaskJob = Box<dyn FnOnce() -> TaskResult + Send>;

struct TickListener {
    callback: Rc<dyn Fn() -> LocalBoxFuture<'static, ()>>,
    periodicity: u64,
    next_run: u64,
}

pub struct Context {
    runtime: Rc<dyn Runtime>,
    node: NodeId,
    master_key: String,
    machine_id: u64,

    fds: RefCell<HashMap<Fd, Weak<BufferedFd>>>,
    connect_promises: RefCell<HashMap<Fd, Promise<Option<Rc<BufferedFd>>>>>,
    named_fds: RefCell<HashMap<String, Rc<BufferedFd>>>,
    named_connecting: RefCell<HashSet<String>>,
    named_waiters: RefCell<HashMap<String, VecDeque<WeakPromise<ConnectResult>>>>,

    client_tls: RefCell<HashMap<String, Arc<rustls::ClientConfig>>>,
    server_tls: RefCell<HashMap<String, Arc<rustls::ServerConfig>>>,

    stores: RefCell<HashMap<String, Rc<dyn Storable>>>,
    handler: RefCell<Option<Rc<dyn ConnectionHandler>>>,

    task_counter: Cell<u64>,
    task_promises: RefCell<HashMap<u64, WeakPromise<TaskResult>>>,
    task_results: Arc<Mutex<HashMap<u64, TaskResult>>>,
    task_tx: Sender<(u64, TaskJob)>,

    actors: RefCell<HashMap<String, Weak<dyn Actor>>>,
    tick_listeners: RefCell<Vec<TickListener>>,
    sleeps: RefCell<Vec<(u64, WeakPromise<()>)>>,
    current_tick: Cell<u64>,

    counter: Cell<u64>,
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
}

impl Context {
    pub fn new(runtime: Rc<dyn Runtime>, node: NodeId, master_key: String) -> Rc<Context> {
        let machine_id = (node.port as u64 + node.worker as u64) & 0x3FF;
        let (task_tx, task_rx) = channel::<(u64, TaskJob)>();
        let task_rx = Arc::new(Mutex::new(task_rx));
        let task_results: Arc<Mutex<HashMap<u64, TaskResult>>> =
            Arc::new(Mutex::new(HashMap::new()));

        for _ in 0..POOL_THREADS {
            spawn_pool_thread(
                node.worker,
                task_rx.clone(),
                task_results.clone(),
                runtime.mailer(),
            );
        }
        if node.worker == 0 {
            spawn_tick_thread(runtime.mailer(), node.workers);
        }

        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Rc::new(Context {
            runtime,
            node,
            master_key,
            machine_id,
            fds: RefCell::new(HashMap::new()),
            connect_promises: RefCell::new(HashMap::new()),
            named_fds: RefCell::new(HashMap::new()),
            named_connecting: RefCell::new(HashSet::new()),
            named_waiters: RefCell::new(HashMap::new()),
            client_tls: RefCell::new(HashMap::new()),
            server_tls: RefCell::new(HashMap::new()),
            stores: RefCell::new(HashMap::new()),
            handler: RefCell::new(None),
            task_counter: Cell::new(0),
            task_promises: RefCell::new(HashMap::new()),
            task_results,
            task_tx,
            actors: RefCell::new(HashMap::new()),
            tick_listeners: RefCell::new(Vec::new()),
            sleeps: RefCell::new(Vec::new()),
            current_tick: Cell::new(0),
            counter: Cell::new(0),
            pool: RefCell::new(pool),
            spawner,
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn runtime(&self) -> &Rc<dyn Runtime> {
        &self.runtime
    }

    pub fn master_key(&self) -> &str {
        &self.master_key
    }

    pub fn set_handler(&self, handler: Rc<dyn ConnectionHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    pub fn quit(&self) {
        self.runtime.quit();
    }

    pub fn reload(&self) {
        self.runtime.reload();
    }

    /// Run the cooperative loop until every runnable task has suspended
    /// again. Called after each runtime event burst.
    pub fn pump(&self) {
        if let Ok(mut pool) = self.pool.try_borrow_mut() {
            pool.run_until_stalled();
        }
    }

    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        if self.spawner.spawn_local(future).is_err() {
            warn!("spawning on a shut-down worker pool");
        }
    }

    // --- runtime events --------------------------------------------------

    pub fn on_init(self: &Rc<Self>) {
        let handler = self.handler.borrow().clone();
        if let Some(handler) = handler {
            handler.on_load(self);
        }
        self.pump();
    }

    pub fn on_pre_refresh(&self) {
        let handler = self.handler.borrow().clone();
        if let Some(handler) = handler {
            handler.on_pre_refresh();
        }
    }

    pub fn on_refresh(&self) {
        let handler = self.handler.borrow().clone();
        if let Some(handler) = handler {
            handler.on_refresh();
        }
    }

    pub fn on_accept(self: &Rc<Self>, child: Fd, kind: FdKind, remote: Option<(String, u16)>) {
        let existing = self.fds.borrow().get(&child).and_then(Weak::upgrade);
        let fd = match existing {
            Some(fd) => fd,
            None => {
                let fd = Rc::new(BufferedFd::new(self.runtime.clone(), child, kind));
                self.fds.borrow_mut().insert(child, Rc::downgrade(&fd));
                fd
            }
        };
        if !fd.was_accepted() {
            if let Some((ip, port)) = remote {
                fd.set_remote_addr(ip, port);
            }
            fd.on_accept();
            let handler = self.handler.borrow().clone();
            if let Some(handler) = handler {
                let ctx = self.clone();
                self.spawn(async move {
                    handler.on_accept(ctx, fd).await;
                });
            }
        }
        self.pump();
    }

    pub fn on_receive(self: &Rc<Self>, child: Fd, data: &[u8]) {
        let fd = self.fds.borrow().get(&child).and_then(Weak::upgrade);
        match fd {
            Some(fd) => fd.on_data(data, false),
            None => {
                // descriptor adopted by the runtime without a prior accept
                // event; synthesize one, then forward the bytes
                self.on_accept(child, FdKind::Socket, None);
                let fd = self.fds.borrow().get(&child).and_then(Weak::upgrade);
                if let Some(fd) = fd {
                    fd.on_data(data, false);
                }
            }
        }
        self.pump();
    }

    pub fn on_write(self: &Rc<Self>, child: Fd, written: usize) {
        let fd = self.fds.borrow().get(&child).and_then(Weak::upgrade);
        match fd {
            Some(fd) => {
                fd.on_write(written);
                let pending = self.connect_promises.borrow_mut().remove(&child);
                if let Some(promise) = pending {
                    promise.resolve(Some(fd));
                }
            }
            None => {
                self.fds.borrow_mut().remove(&child);
            }
        }
        self.pump();
    }

    pub fn on_close(self: &Rc<Self>, child: Fd) {
        let entry = self.fds.borrow_mut().remove(&child);
        if let Some(fd) = entry.and_then(|weak| weak.upgrade()) {
            self.named_fds.borrow_mut().remove(&fd.name());
            let pending = self.connect_promises.borrow_mut().remove(&child);
            if let Some(promise) = pending {
                promise.resolve(None);
            }
            fd.on_close();
        }
        self.pump();
    }

    pub fn on_message(self: &Rc<Self>, message: &[u8]) {
        match MailboxMessage::decode(message) {
            Some(MailboxMessage::Task { task_id, .. }) => {
                trace!(task_id, "task completion");
                let promise = self.task_promises.borrow_mut().remove(&task_id);
                let result = self
                    .task_results
                    .lock()
                    .ok()
                    .and_then(|mut table| table.remove(&task_id));
                if let (Some(promise), Some(result)) = (promise, result) {
                    promise.resolve(result);
                }
            }
            Some(MailboxMessage::Actor {
                signature,
                to,
                from,
                kind,
                message,
            }) => {
                let ctx = self.clone();
                self.spawn(async move {
                    if let Err(reason) = ctx
                        .on_actor_message(&signature, &to, &from, &kind, &message)
                        .await
                    {
                        warn!(%reason, "dropping actor message");
                    }
                });
            }
            Some(MailboxMessage::Tick) => {
                let ctx = self.clone();
                self.spawn(async move {
                    ctx.on_tick().await;
                });
            }
            None => warn!("undecodable mailbox message"),
        }
        self.pump();
    }

    // --- outbound connections --------------------------------------------

    /// Dial out. `addr` may be `host@ip` to carry an SNI hostname while
    /// connecting by address. With `name`, concurrent callers coalesce onto
    /// a single dial and later callers reuse the live descriptor.
    pub async fn connect(
        self: Rc<Self>,
        addr: &str,
        _record: RecordKind,
        port: u16,
        protocol: Proto,
        name: Option<String>,
        disable_local: bool,
    ) -> ConnectResult {
        if let Some(name) = &name {
            let existing = self.named_fds.borrow().get(name).cloned();
            if let Some(fd) = existing {
                if fd.is_closed() || fd.is_error() {
                    self.named_fds.borrow_mut().remove(name);
                } else {
                    return ConnectResult::ok(fd);
                }
            }
            if self.named_connecting.borrow().contains(name) {
                let promise = Promise::new();
                self.named_waiters
                    .borrow_mut()
                    .entry(name.clone())
                    .or_default()
                    .push_back(promise.downgrade());
                return promise.await;
            }
            self.named_connecting.borrow_mut().insert(name.clone());
        }

        let (host_name, target_ip) = match addr.split_once('@') {
            Some((host, ip)) => (host.to_owned(), ip.to_owned()),
            None => (addr.to_owned(), addr.to_owned()),
        };

        let result = self
            .clone()
            .dial(&host_name, &target_ip, port, protocol, disable_local)
            .await;

        if let Some(name) = &name {
            if let Some(fd) = result.fd_ok() {
                fd.set_name(name.clone());
                self.named_fds.borrow_mut().insert(name.clone(), fd);
            }
            let waiters = self.named_waiters.borrow_mut().remove(name);
            if let Some(waiters) = waiters {
                for waiter in waiters {
                    waiter.resolve(result.clone());
                }
            }
            self.named_connecting.borrow_mut().remove(name);
        }
        result
    }

    async fn dial(
        self: Rc<Self>,
        host_name: &str,
        target_ip: &str,
        port: u16,
        protocol: Proto,
        disable_local: bool,
    ) -> ConnectResult {
        if disable_local && is_local_address(target_ip) {
            return ConnectResult::err(errors::INVALID_ADDRESS);
        }

        let raw = match self.runtime.connect(target_ip, port, protocol == Proto::Udp) {
            Ok(raw) => raw,
            Err(_) => return ConnectResult::err("failed to create fd"),
        };
        let fd = Rc::new(BufferedFd::new(self.runtime.clone(), raw, FdKind::Socket));
        self.fds.borrow_mut().insert(raw, Rc::downgrade(&fd));

        if protocol == Proto::Udp {
            return ConnectResult::ok(fd);
        }

        // TCP settles on the first writable event
        let promise = Promise::new();
        self.connect_promises.borrow_mut().insert(raw, promise.clone());
        let fd = match promise.await {
            Some(fd) => fd,
            None => return ConnectResult::err("failed to connect"),
        };

        if protocol == Proto::Tls {
            let config = match self.client_tls_context(None, None, None, None) {
                Ok(config) => config,
                Err(e) => return ConnectResult::err(e),
            };
            let ssl = fd.clone().enable_client_ssl(config, host_name).await;
            if ssl.error {
                fd.close(true);
                return ConnectResult::err(ssl.message);
            }
        }
        ConnectResult::ok(fd)
    }

    /// Drop a pooled descriptor from the name table (its owner noticed it
    /// went bad).
    pub fn revoke_named_fd(&self, fd: &Rc<BufferedFd>) {
        self.named_fds.borrow_mut().remove(&fd.name());
    }

    pub fn fd_count(&self) -> usize {
        self.fds.borrow().len()
    }

    // --- task offload ----------------------------------------------------

    /// Run a blocking job on the pool; the promise resolves on this worker
    /// once the completion message comes back through the mailbox.
    pub fn exec_async<F, R>(&self, job: F) -> Promise<TaskResult>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let promise = Promise::new();
        let task_id = self.task_counter.get();
        self.task_counter.set(task_id + 1);
        self.task_promises
            .borrow_mut()
            .insert(task_id, promise.downgrade());
        let boxed: TaskJob = Box::new(move || Box::new(job()) as TaskResult);
        if self.task_tx.send((task_id, boxed)).is_err() {
            self.task_promises.borrow_mut().remove(&task_id);
            warn!(task_id, "task pool is gone");
        }
        promise
    }

    /// Typed wrapper around [`exec_async`](Self::exec_async).
    pub async fn offload<F, R>(&self, job: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let result = self.exec_async(job).await;
        result.downcast::<R>().ok().map(|boxed| *boxed)
    }

    // --- actors ----------------------------------------------------------

    pub fn register_actor(self: &Rc<Self>, actor: Rc<dyn Actor>) -> Pid {
        let pid = Pid {
            host: self.node.name.clone(),
            port: self.node.port,
            worker: self.node.worker,
            id: format!("{:x}", self.snowflake()),
        };
        self.actors
            .borrow_mut()
            .insert(pid.to_string(), Rc::downgrade(&actor));
        pid
    }

    pub fn deregister_actor(&self, pid: &Pid) {
        self.actors.borrow_mut().remove(&pid.to_string());
    }

    /// Deliver a signed message to `to`: in-process when the pid lives on
    /// this worker, over the mailbox for a sibling worker, over a pooled TCP
    /// forward for another node.
    pub async fn send_message(
        self: Rc<Self>,
        to: String,
        from: String,
        kind: String,
        message: String,
    ) -> Result<bool, String> {
        let signature = sign_message(&self.master_key, &to, &from, &kind, &message);
        let pid = match Pid::parse(&to) {
            Some(pid) => pid,
            None => return Err("invalid actor id".to_owned()),
        };
        if pid.host == self.node.name && pid.port == self.node.port {
            if pid.worker == self.node.worker {
                self.on_actor_message(&signature, &to, &from, &kind, &message)
                    .await
            } else {
                self.runtime.mailer().mail(
                    pid.worker,
                    MailboxMessage::Actor {
                        signature,
                        to,
                        from,
                        kind,
                        message,
                    }
                    .encode(),
                );
                Ok(true)
            }
        } else {
            let pool_name = format!("{}:{}", pid.host, pid.port);
            let conn = self
                .clone()
                .connect(
                    &pid.host,
                    RecordKind::A,
                    pid.port,
                    Proto::Tcp,
                    Some(pool_name),
                    false,
                )
                .await;
            match conn.fd_ok() {
                Some(fd) => {
                    let request = format!(
                        "POST /90s/internal/forward HTTP/1.1\r\n\
                         Signature: {signature}\r\n\
                         From: {from}\r\n\
                         To: {to}\r\n\
                         Type: {kind}\r\n\
                         Content-Length: {}\r\n\
                         Connection: keep-alive\r\n\r\n{message}",
                        message.len()
                    );
                    if fd.write(request.as_bytes()).await {
                        Ok(true)
                    } else {
                        Err(errors::WRITE_ERROR.to_owned())
                    }
                }
                None => Err(conn.message),
            }
        }
    }

    /// Inbound side: recompute the signature, reject mismatches, then route
    /// to the registered actor (or one hop further towards it).
    pub async fn on_actor_message(
        self: &Rc<Self>,
        signature: &str,
        to: &str,
        from: &str,
        kind: &str,
        message: &str,
    ) -> Result<bool, String> {
        let expected = sign_message(&self.master_key, to, from, kind, message);
        if expected != signature {
            return Err("invalid signature".to_owned());
        }
        let pid = match Pid::parse(to) {
            Some(pid) => pid,
            None => return Err(errors::INVALID_ADDRESS.to_owned()),
        };
        if pid.host != self.node.name || pid.port != self.node.port {
            return Err(errors::INVALID_ADDRESS.to_owned());
        }
        if pid.worker != self.node.worker {
            self.runtime.mailer().mail(
                pid.worker,
                MailboxMessage::Actor {
                    signature: signature.to_owned(),
                    to: to.to_owned(),
                    from: from.to_owned(),
                    kind: kind.to_owned(),
                    message: message.to_owned(),
                }
                .encode(),
            );
            return Ok(true);
        }
        let actor = self.actors.borrow().get(to).cloned();
        match actor.and_then(|weak| weak.upgrade()) {
            Some(actor) => {
                actor.on_receive(from, kind, message).await;
                Ok(true)
            }
            None => Err(errors::INVALID_ENTITY.to_owned()),
        }
    }

    // --- tick wheel ------------------------------------------------------

    pub fn add_tick_listener(
        &self,
        periodicity: u64,
        callback: impl Fn() -> LocalBoxFuture<'static, ()> + 'static,
    ) {
        let next_run = self.current_tick.get() + periodicity;
        self.tick_listeners.borrow_mut().push(TickListener {
            callback: Rc::new(callback),
            periodicity,
            next_run,
        });
    }

    /// Resolves after roughly `seconds` ticks.
    pub fn sleep(&self, seconds: u64) -> Promise<()> {
        let promise = Promise::new();
        self.sleeps
            .borrow_mut()
            .push((self.current_tick.get() + seconds, promise.downgrade()));
        promise
    }

    pub async fn on_tick(self: &Rc<Self>) {
        let stores: Vec<_> = self.stores.borrow().values().cloned().collect();
        for store in stores {
            store.update();
        }

        let now = self.current_tick.get();
        let due: Vec<_> = {
            let mut listeners = self.tick_listeners.borrow_mut();
            listeners
                .iter_mut()
                .filter(|listener| now >= listener.next_run)
                .map(|listener| {
                    listener.next_run = now + listener.periodicity;
                    listener.callback.clone()
                })
                .collect()
        };
        for callback in due {
            callback().await;
        }

        let mut awake = Vec::new();
        self.sleeps.borrow_mut().retain(|(deadline, waiter)| {
            if now >= *deadline {
                awake.push(waiter.clone());
                false
            } else {
                true
            }
        });
        self.current_tick.set(now + TICK_PERIOD);
        for waiter in awake {
            waiter.resolve(());
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick.get()
    }

    // --- stores ----------------------------------------------------------

    pub fn store(&self, name: impl Into<String>, entity: Rc<dyn Storable>) {
        self.stores.borrow_mut().insert(name.into(), entity);
    }

    pub fn store_named(&self, name: &str) -> Option<Rc<dyn Storable>> {
        self.stores.borrow().get(name).cloned()
    }

    // --- identifiers -----------------------------------------------------

    pub fn machine_id(&self) -> u64 {
        self.machine_id
    }

    /// `[32 bits seconds-since-epoch-offset][10 bits machine][22 bits
    /// counter]`; strictly increasing within one worker.
    pub fn snowflake(&self) -> u64 {
        let seconds = (Utc::now().timestamp() as u64).wrapping_sub(SNOWFLAKE_EPOCH);
        let counter = self.counter.get();
        self.counter.set(counter + 1);
        ((seconds << 32) & 0xFFFF_FFFF_0000_0000)
            | (self.machine_id << 22)
            | (counter & 0x3F_FFFF)
    }

    // --- TLS contexts ----------------------------------------------------

    /// Client-side TLS context, cached by `(cafile, capath, pubkey,
    /// privkey)`. Without a CA file the peer certificate is not verified
    /// (outbound hops are opportunistic).
    pub fn client_tls_context(
        &self,
        ca_file: Option<&str>,
        ca_path: Option<&str>,
        pubkey: Option<&str>,
        privkey: Option<&str>,
    ) -> Result<Arc<rustls::ClientConfig>, String> {
        let key = format!(
            "c.{},{},{},{}",
            ca_file.unwrap_or(""),
            ca_path.unwrap_or(""),
            pubkey.unwrap_or(""),
            privkey.unwrap_or("")
        );
        if let Some(config) = self.client_tls.borrow().get(&key) {
            return Ok(config.clone());
        }

        let builder = rustls::ClientConfig::builder().with_safe_defaults();
        let config = match ca_file {
            Some(ca_file) => {
                let mut roots = rustls::RootCertStore::empty();
                for cert in read_certs(ca_file)? {
                    roots
                        .add(&cert)
                        .map_err(|e| format!("bad CA certificate: {e}"))?;
                }
                let builder = builder.with_root_certificates(roots);
                match (pubkey, privkey) {
                    (Some(pubkey), Some(privkey)) => builder
                        .with_client_auth_cert(read_certs(pubkey)?, read_key(privkey)?)
                        .map_err(|e| format!("bad client certificate: {e}"))?,
                    _ => builder.with_no_client_auth(),
                }
            }
            None => {
                let builder = builder.with_custom_certificate_verifier(Arc::new(NoCertVerifier));
                match (pubkey, privkey) {
                    (Some(pubkey), Some(privkey)) => builder
                        .with_client_auth_cert(read_certs(pubkey)?, read_key(privkey)?)
                        .map_err(|e| format!("bad client certificate: {e}"))?,
                    _ => builder.with_no_client_auth(),
                }
            }
        };

        let config = Arc::new(config);
        self.client_tls.borrow_mut().insert(key, config.clone());
        Ok(config)
    }

    /// Server-side TLS context from PEM files, cached by `(pubkey, privkey)`.
    pub fn server_tls_context(
        &self,
        pubkey: &str,
        privkey: &str,
    ) -> Result<Arc<rustls::ServerConfig>, String> {
        let key = format!("s.{},{}", pubkey, privkey);
        if let Some(config) = self.server_tls.borrow().get(&key) {
            return Ok(config.clone());
        }

        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(read_certs(pubkey)?, read_key(privkey)?)
            .map_err(|e| format!("bad server certificate: {e}"))?;

        let config = Arc::new(config);
        self.server_tls.borrow_mut().insert(key, config.clone());
        Ok(config)
    }
}

struct NoCertVerifier;

impl rustls::client::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn read_certs(path: &str) -> Result<Vec<rustls::Certificate>, String> {
    let file = File::open(path).map_err(|e| format!("opening certificate file {path}: {e}"))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|e| format!("parsing certificate file {path}: {e}"))?;
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn read_key(path: &str) -> Result<rustls::PrivateKey, String> {
    let file = File::open(path).map_err(|e| format!("opening key file {path}: {e}"))?;
    let mut reader = BufReader::new(file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| format!("parsing key file {path}: {e}"))?;
    if keys.is_empty() {
        let file = File::open(path).map_err(|e| format!("opening key file {path}: {e}"))?;
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(file))
            .map_err(|e| format!("parsing key file {path}: {e}"))?;
    }
    match keys.len() {
        1 => Ok(rustls::PrivateKey(keys.remove(0))),
        n => Err(format!("key file {path} holds {n} keys, expected one")),
    }
}

/// RFC-1918, loopback, link-local and 0/8 targets; used to keep
/// user-supplied dial targets away from the inside of the network.
pub fn is_local_address(addr: &str) -> bool {
    if addr.starts_with("v6:") {
        return false;
    }
    let mut octets = [0u32; 4];
    let mut parts = addr.split('.');
    for octet in octets.iter_mut() {
        match parts.next().and_then(|p| p.parse::<u32>().ok()) {
            Some(v) => *octet = v,
            None => return false,
        }
    }
    if parts.next().is_some() {
        return false;
    }
    if octets.iter().any(|&o| o > 255) {
        return true;
    }
    let ip = (octets[0] << 24) | (octets[1] << 16) | (octets[2] << 8) | octets[3];
    (ip & 0xFF00_0000) == 0x0000_0000          // 0.0.0.0/8
        || (ip & 0xFF00_0000) == 0x7F00_0000   // 127.0.0.0/8
        || (ip & 0xFF00_0000) == 0x0A00_0000   // 10.0.0.0/8
        || (ip & 0xFFFF_0000) == 0xC0A8_0000   // 192.168.0.0/16
        || (ip & 0xFFF0_0000) == 0xAC10_0000   // 172.16.0.0/12
        || (ip & 0xFFFF_0000) == 0xA9FE_0000   // 169.254.0.0/16
}

fn spawn_pool_thread(
    worker: usize,
    rx: Arc<Mutex<Receiver<(u64, TaskJob)>>>,
    results: Arc<Mutex<HashMap<u64, TaskResult>>>,
    mailer: Arc<dyn Mailer>,
) {
    std::thread::spawn(move || loop {
        let job = match rx.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => break,
        };
        match job {
            Ok((task_id, job)) => {
                trace!(task_id, "running offloaded task");
                let result = job();
                if let Ok(mut table) = results.lock() {
                    table.insert(task_id, result);
                }
                mailer.mail(
                    worker,
                    MailboxMessage::Task {
                        task_id,
                        result_slot: task_id,
                    }
                    .encode(),
                );
            }
            Err(_) => break,
        }
    });
}

fn spawn_tick_thread(mailer: Arc<dyn Mailer>, workers: usize) {
    std::thread::spawn(move || {
        let now = Utc::now().timestamp();
        let to_minute = 60 - (now % 60) as u64;
        std::thread::sleep(Duration::from_secs(to_minute));
        loop {
            for worker in 0..workers {
                mailer.mail(worker, MailboxMessage::Tick.encode());
            }
            std::thread::sleep(Duration::from_secs(TICK_PERIOD));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedLoop;
    use std::cell::RefCell;

    fn fresh() -> (Rc<SimulatedLoop>, Rc<Context>) {
        let sim = Rc::new(SimulatedLoop::new(2));
        let ctx = Context::new(sim.clone(), test_node(), "master-secret".into());
        (sim, ctx)
    }

    fn test_node() -> NodeId {
        NodeId {
            name: "localhost".into(),
            port: 9000,
            // worker 1 so the tick thread stays out of the test's mailbox
            worker: 1,
            workers: 2,
        }
    }

    #[test]
    fn named_connections_share_a_single_dial() {
        let (sim, ctx) = fresh();
        let results = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..3 {
            let ctx2 = ctx.clone();
            let results = results.clone();
            ctx.spawn(async move {
                let conn = ctx2
                    .clone()
                    .connect(
                        "192.0.2.10",
                        RecordKind::A,
                        2525,
                        Proto::Tcp,
                        Some("smtp.example.org".into()),
                        false,
                    )
                    .await;
                results.borrow_mut().push(conn);
            });
        }
        ctx.pump();
        assert_eq!(sim.dials().len(), 1);
        assert!(results.borrow().is_empty());

        let raw = sim.last_dialed().expect("one dial");
        ctx.on_write(raw, 0);
        let results = results.borrow();
        assert_eq!(results.len(), 3);
        let first = results[0].fd_ok().expect("connected");
        for conn in results.iter() {
            assert!(conn.is_ok());
            assert!(Rc::ptr_eq(&first, &conn.fd_ok().expect("connected")));
        }
        assert_eq!(first.name(), "smtp.example.org");

        // a later caller reuses the pooled descriptor without dialing
        let ctx2 = ctx.clone();
        let reused = Rc::new(RefCell::new(None));
        let reused2 = reused.clone();
        ctx.spawn(async move {
            let conn = ctx2
                .clone()
                .connect(
                    "192.0.2.10",
                    RecordKind::A,
                    2525,
                    Proto::Tcp,
                    Some("smtp.example.org".into()),
                    false,
                )
                .await;
            *reused2.borrow_mut() = Some(conn);
        });
        ctx.pump();
        assert_eq!(sim.dials().len(), 1);
        assert!(reused.borrow().as_ref().expect("resolved").is_ok());
    }

    #[test]
    fn disable_local_rejects_private_targets_without_dialing() {
        let (sim, ctx) = fresh();
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let ctx2 = ctx.clone();
        ctx.spawn(async move {
            let conn = ctx2
                .clone()
                .connect("10.1.2.3", RecordKind::A, 80, Proto::Tcp, None, true)
                .await;
            *result2.borrow_mut() = Some(conn);
        });
        ctx.pump();
        let result = result.borrow();
        let conn = result.as_ref().expect("resolved");
        assert!(conn.error);
        assert_eq!(conn.message, errors::INVALID_ADDRESS);
        assert!(sim.dials().is_empty());
    }

    #[test]
    fn local_address_classification() {
        for local in ["0.1.2.3", "127.0.0.1", "10.255.0.1", "192.168.1.1", "172.16.9.9", "169.254.0.1"] {
            assert!(is_local_address(local), "{local}");
        }
        for public in ["192.0.2.1", "8.8.8.8", "172.32.0.1", "v6:::1", "example.org"] {
            assert!(!is_local_address(public), "{public}");
        }
    }

    #[test]
    fn failed_dial_resolves_with_an_error() {
        let (sim, ctx) = fresh();
        sim.set_fail_connects(true);
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let ctx2 = ctx.clone();
        ctx.spawn(async move {
            let conn = ctx2
                .clone()
                .connect("192.0.2.1", RecordKind::A, 80, Proto::Tcp, None, false)
                .await;
            *result2.borrow_mut() = Some(conn);
        });
        ctx.pump();
        assert!(result.borrow().as_ref().expect("resolved").error);
    }

    #[test]
    fn snowflakes_are_strictly_increasing() {
        let (_sim, ctx) = fresh();
        let mut last = 0;
        for _ in 0..1000 {
            let id = ctx.snowflake();
            assert!(id > last);
            last = id;
        }
        // machine field: (9000 + 1) & 0x3FF, sitting above the counter
        assert_eq!((last >> 22) & 0x3FF, (9000 + 1) & 0x3FF);
    }

    #[test]
    fn offloaded_tasks_come_back_through_the_mailbox() {
        let (sim, ctx) = fresh();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        let ctx2 = ctx.clone();
        ctx.spawn(async move {
            *got2.borrow_mut() = ctx2.offload(|| 6 * 7).await;
        });
        ctx.pump();

        // the pool runs on real threads; wait for the completion message
        let mut mail = Vec::new();
        for _ in 0..200 {
            mail = sim.take_mail();
            if !mail.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let (worker, payload) = mail.pop().expect("task completion posted");
        assert_eq!(worker, 1);
        ctx.on_message(&payload);
        assert_eq!(*got.borrow(), Some(42));
    }

    struct RecordingActor {
        seen: RefCell<Vec<(String, String, String)>>,
    }

    #[async_trait::async_trait(?Send)]
    impl Actor for RecordingActor {
        async fn on_receive(&self, sender: &str, kind: &str, message: &str) {
            self.seen
                .borrow_mut()
                .push((sender.into(), kind.into(), message.into()));
        }
    }

    #[test]
    fn local_actor_delivery_round_trips() {
        let (_sim, ctx) = fresh();
        let actor = Rc::new(RecordingActor {
            seen: RefCell::new(Vec::new()),
        });
        let pid = ctx.register_actor(actor.clone());
        let to = pid.to_string();
        let ctx2 = ctx.clone();
        let outcome = Rc::new(RefCell::new(None));
        let outcome2 = outcome.clone();
        ctx.spawn(async move {
            let sent = ctx2
                .send_message(to, "<peer 1 0 z>".into(), "ping".into(), "hello".into())
                .await;
            *outcome2.borrow_mut() = Some(sent);
        });
        ctx.pump();
        assert_eq!(*outcome.borrow(), Some(Ok(true)));
        assert_eq!(
            *actor.seen.borrow(),
            vec![("<peer 1 0 z>".to_owned(), "ping".to_owned(), "hello".to_owned())]
        );
    }

    #[test]
    fn tampered_actor_messages_are_rejected() {
        let (_sim, ctx) = fresh();
        let actor = Rc::new(RecordingActor {
            seen: RefCell::new(Vec::new()),
        });
        let pid = ctx.register_actor(actor.clone());
        let to = pid.to_string();
        let ctx2 = ctx.clone();
        let outcome = Rc::new(RefCell::new(None));
        let outcome2 = outcome.clone();
        ctx.spawn(async move {
            let bad = sign_message("wrong-key", &to, "<p 1 0 z>", "ping", "hello");
            let result = ctx2
                .on_actor_message(&bad, &to, "<p 1 0 z>", "ping", "hello")
                .await;
            *outcome2.borrow_mut() = Some(result);
        });
        ctx.pump();
        assert_eq!(
            *outcome.borrow(),
            Some(Err("invalid signature".to_owned()))
        );
        assert!(actor.seen.borrow().is_empty());
    }

    #[test]
    fn sibling_worker_delivery_goes_through_the_mailbox() {
        let (sim, ctx) = fresh();
        let to = "<localhost 9000 0 abc>".to_owned();
        let ctx2 = ctx.clone();
        ctx.spawn(async move {
            let _ = ctx2
                .send_message(to, "<localhost 9000 1 d>".into(), "k".into(), "m".into())
                .await;
        });
        ctx.pump();
        let mail = sim.take_mail();
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].0, 0);
        match MailboxMessage::decode(&mail[0].1) {
            Some(MailboxMessage::Actor { to, kind, .. }) => {
                assert_eq!(to, "<localhost 9000 0 abc>");
                assert_eq!(kind, "k");
            }
            other => panic!("unexpected mailbox payload: {other:?}"),
        }
    }

    #[test]
    fn sleeps_resolve_as_ticks_advance() {
        let (_sim, ctx) = fresh();
        let woke = Rc::new(Cell::new(false));
        let woke2 = woke.clone();
        let ctx2 = ctx.clone();
        ctx.spawn(async move {
            ctx2.sleep(2).await;
            woke2.set(true);
        });
        ctx.pump();

        for _ in 0..2 {
            ctx.on_message(&MailboxMessage::Tick.encode());
            assert!(!woke.get());
        }
        ctx.on_message(&MailboxMessage::Tick.encode());
        assert!(woke.get());
    }

    #[test]
    fn tick_listeners_fire_on_their_period() {
        let (_sim, ctx) = fresh();
        let fires = Rc::new(Cell::new(0));
        let fires2 = fires.clone();
        ctx.add_tick_listener(2, move || {
            let fires = fires2.clone();
            Box::pin(async move {
                fires.set(fires.get() + 1);
            })
        });
        for _ in 0..5 {
            ctx.on_message(&MailboxMessage::Tick.encode());
        }
        // next_run starts at tick 2, fires at ticks 2 and 4
        assert_eq!(fires.get(), 2);
    }

    struct RecordingHandler {
        accepted: RefCell<Vec<Fd>>,
    }

    #[async_trait::async_trait(?Send)]
    impl ConnectionHandler for RecordingHandler {
        async fn on_accept(self: Rc<Self>, _ctx: Rc<Context>, fd: Rc<BufferedFd>) {
            self.accepted.borrow_mut().push(fd.fd());
        }
    }

    #[test]
    fn receive_on_unknown_descriptor_synthesizes_an_accept() {
        let (_sim, ctx) = fresh();
        let handler = Rc::new(RecordingHandler {
            accepted: RefCell::new(Vec::new()),
        });
        ctx.set_handler(handler.clone());
        ctx.on_receive(Fd(55), b"hello");
        assert_eq!(*handler.accepted.borrow(), vec![Fd(55)]);
    }
}
