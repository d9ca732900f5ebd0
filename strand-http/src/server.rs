//! HTTP/1.1 server loop.
//!
//! One task per keep-alive connection: read up to the blank line, parse the
//! request line and headers, pull in the body when `content-length` says so,
//! dispatch on `"METHOD /path"`, render, serialize, loop. Render failures
//! turn into the built-in error page; a failed write drops the connection.

use std::{any::Any, cell::RefCell, collections::HashMap, rc::Rc};

use async_trait::async_trait;
use tracing::{debug, info};

use strand_aio::{BufferedFd, ConnectionHandler, Context};

use crate::{
    environment::{Environment, Status},
    registry::{self, Page, PageLibrary},
    util::{parse_query_string, url_decode, verify_signed_query},
};

pub struct HttpServer {
    pages: RefCell<HashMap<String, Rc<dyn Page>>>,
    lib_pages: RefCell<HashMap<String, String>>,
    local: RefCell<Option<Rc<dyn Any>>>,
    ctx: RefCell<Option<Rc<Context>>>,
}

impl Default for HttpServer {
    fn default() -> HttpServer {
        let server = HttpServer {
            pages: RefCell::new(HashMap::new()),
            lib_pages: RefCell::new(HashMap::new()),
            local: RefCell::new(None),
            ctx: RefCell::new(None),
        };
        server.load_page(Box::new(ActorForwardPage));
        server
    }
}

impl HttpServer {
    pub fn new() -> Rc<HttpServer> {
        Rc::new(HttpServer::default())
    }

    /// Register a page directly, outside any library.
    pub fn load_page(&self, page: Box<dyn Page>) {
        let page: Rc<dyn Page> = Rc::from(page);
        self.pages.borrow_mut().insert(page.name().to_owned(), page);
    }

    fn load_libs(&self, ctx: &Rc<Context>) {
        for (path, library) in registry::checkout() {
            info!(library = path.as_str(), "loading page library");
            if let Some(page) = library.load_page() {
                let page: Rc<dyn Page> = Rc::from(page);
                self.lib_pages
                    .borrow_mut()
                    .insert(path, page.name().to_owned());
                self.pages.borrow_mut().insert(page.name().to_owned(), page);
            }
            let local = self.local.borrow_mut().take();
            *self.local.borrow_mut() = library.initialize(ctx, local);
        }
    }

    fn unload_libs(&self) {
        let ctx = self.ctx.borrow().clone();
        for (path, library) in registry::checkin() {
            info!(library = path.as_str(), "unloading page library");
            // the page's name was captured at load time; dropping the page
            // happens only after the table no longer points at it
            if let Some(name) = self.lib_pages.borrow_mut().remove(&path) {
                self.pages.borrow_mut().remove(&name);
            }
            if let Some(ctx) = &ctx {
                let local = self.local.borrow_mut().take();
                *self.local.borrow_mut() = library.release(ctx, local);
            }
        }
    }

    fn lookup(&self, key: &str) -> Option<Rc<dyn Page>> {
        self.pages.borrow().get(key).cloned()
    }

    async fn handle_connection(self: Rc<Self>, ctx: Rc<Context>, fd: Rc<BufferedFd>) {
        loop {
            let head = fd.read_until(b"\r\n\r\n").await;
            if head.error {
                return;
            }
            let head = String::from_utf8_lossy(&head.data).into_owned();
            let mut lines = head.split("\r\n");
            let request_line = match lines.next() {
                Some(line) => line,
                None => return,
            };
            let mut parts = request_line.splitn(3, ' ');
            let (method, target) = match (parts.next(), parts.next(), parts.next()) {
                (Some(method), Some(target), Some(_version)) => (method.to_owned(), target),
                _ => return,
            };

            let env = Environment::new();
            for line in lines {
                if let Some((key, value)) = line.split_once(": ") {
                    env.write_header(key.to_owned(), value.to_owned());
                }
            }

            let (path, query) = match target.split_once('?') {
                Some((path, query)) => (path, query),
                None => (target, ""),
            };
            let params = parse_query_string(query);
            env.write_signed_query(verify_signed_query(&params, ctx.master_key()));
            env.write_query(params);
            let endpoint = url_decode(path);
            env.write_method(method.clone());
            env.write_endpoint(endpoint.clone());

            if let Some(length) = env.header("content-length") {
                if let Ok(length) = length.trim().parse::<usize>() {
                    if length > 0 {
                        let body = fd.read_n(length).await;
                        if body.error {
                            return;
                        }
                        env.write_body(body.data);
                    }
                }
            }

            let page = self.lookup(&format!("{} {}", method, endpoint));
            env.set_header("connection", "keep-alive");
            env.write_global_context(ctx.clone());
            env.write_local_context(self.local.borrow().clone());

            match page {
                Some(page) => {
                    debug!(method, endpoint, "dispatching");
                    if let Err(status) = page.render(&env).await {
                        env.clear();
                        render_error(&env, status);
                    }
                }
                None => render_error(&env, Status::NotFound),
            }

            if !fd.write(&env.http_response()).await {
                return;
            }
        }
    }
}

/// The built-in error page bodies are the short fixed strings; pages that
/// want custom error output render it themselves.
pub fn render_error(env: &Environment, status: Status) {
    env.content_type("text/plain");
    env.status(status.line());
    env.output().write(status.body());
}

#[async_trait(?Send)]
impl ConnectionHandler for HttpServer {
    async fn on_accept(self: Rc<Self>, ctx: Rc<Context>, fd: Rc<BufferedFd>) {
        self.handle_connection(ctx, fd).await;
    }

    fn on_load(&self, ctx: &Rc<Context>) {
        *self.ctx.borrow_mut() = Some(ctx.clone());
        self.load_libs(ctx);
    }

    fn on_pre_refresh(&self) {
        self.unload_libs();
    }

    fn on_refresh(&self) {
        let ctx = self.ctx.borrow().clone();
        if let Some(ctx) = ctx {
            self.load_libs(&ctx);
        }
    }
}

/// Receiving end of the cross-node actor forward: verify the signature
/// headers and hand the body to the context's actor router.
struct ActorForwardPage;

#[async_trait(?Send)]
impl Page for ActorForwardPage {
    fn name(&self) -> &str {
        "POST /90s/internal/forward"
    }

    async fn render(&self, env: &Environment) -> Result<(), Status> {
        let ctx = env.global_context().ok_or(Status::InternalServerError)?;
        let signature = env.header("signature").ok_or(Status::BadRequest)?;
        let from = env.header("from").ok_or(Status::BadRequest)?;
        let to = env.header("to").ok_or(Status::BadRequest)?;
        let kind = env.header("type").ok_or(Status::BadRequest)?;
        let message = String::from_utf8_lossy(&env.body()).into_owned();
        match ctx
            .on_actor_message(&signature, &to, &from, &kind, &message)
            .await
        {
            Ok(_) => {
                env.content_type("text/plain");
                env.output().write("OK");
                Ok(())
            }
            Err(_) => Err(Status::Forbidden),
        }
    }
}
