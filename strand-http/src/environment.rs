//! Per-request environment: the parsed request view on one side, the
//! response builder on the other.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    rc::Rc,
};

use strand_aio::Context;

use crate::{
    render::RenderContext,
    util::{parse_query_string, sign_query, url_encode, SIGNATURE_PARAM},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    InternalServerError,
}

impl Status {
    pub fn line(self) -> &'static str {
        match self {
            Status::BadRequest => "400 Bad request",
            Status::Unauthorized => "401 Unauthorized",
            Status::Forbidden => "403 Forbidden",
            Status::NotFound => "404 Not found",
            Status::InternalServerError => "500 Internal server error",
        }
    }

    pub fn body(self) -> &'static str {
        match self {
            Status::BadRequest => "Bad request",
            Status::Unauthorized => "Unauthorized",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not found",
            Status::InternalServerError => "Internal server error",
        }
    }
}

pub struct Environment {
    // response side
    status_line: RefCell<String>,
    output_headers: RefCell<BTreeMap<String, String>>,
    output: Rc<RenderContext>,
    disabled: Cell<bool>,

    // request side
    method: RefCell<String>,
    endpoint: RefCell<String>,
    query: RefCell<HashMap<String, String>>,
    signed_query: RefCell<HashMap<String, String>>,
    headers: RefCell<HashMap<String, String>>,
    body: RefCell<Vec<u8>>,

    global: RefCell<Option<Rc<Context>>>,
    local: RefCell<Option<Rc<dyn Any>>>,
}

impl Default for Environment {
    fn default() -> Environment {
        Environment {
            status_line: RefCell::new("200 OK".to_owned()),
            output_headers: RefCell::new(BTreeMap::new()),
            output: RenderContext::new(),
            disabled: Cell::new(false),
            method: RefCell::new("GET".to_owned()),
            endpoint: RefCell::new("/".to_owned()),
            query: RefCell::new(HashMap::new()),
            signed_query: RefCell::new(HashMap::new()),
            headers: RefCell::new(HashMap::new()),
            body: RefCell::new(Vec::new()),
            global: RefCell::new(None),
            local: RefCell::new(None),
        }
    }
}

impl Environment {
    pub fn new() -> Environment {
        Environment::default()
    }

    // --- request view ----------------------------------------------------

    pub fn method(&self) -> String {
        self.method.borrow().clone()
    }

    pub fn endpoint(&self) -> String {
        self.endpoint.borrow().clone()
    }

    /// Request header by lower-cased name.
    pub fn header(&self, key: &str) -> Option<String> {
        self.headers.borrow().get(&key.to_ascii_lowercase()).cloned()
    }

    pub fn query(&self, key: &str) -> Option<String> {
        self.query.borrow().get(key).cloned()
    }

    pub fn query_map(&self) -> HashMap<String, String> {
        self.query.borrow().clone()
    }

    /// Parameters whose signature checked out; empty when the request was
    /// unsigned or tampered with.
    pub fn signed_query(&self, key: &str) -> Option<String> {
        self.signed_query.borrow().get(key).cloned()
    }

    pub fn signed_query_map(&self) -> HashMap<String, String> {
        self.signed_query.borrow().clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.body.borrow().clone()
    }

    /// URL-encoded request body as a map.
    pub fn form(&self) -> HashMap<String, String> {
        parse_query_string(&String::from_utf8_lossy(&self.body.borrow()))
    }

    pub fn global_context(&self) -> Option<Rc<Context>> {
        self.global.borrow().clone()
    }

    pub fn local_context(&self) -> Option<Rc<dyn Any>> {
        self.local.borrow().clone()
    }

    /// Signed URL for `endpoint` carrying `params`; the receiving side sees
    /// them in [`signed_query`](Self::signed_query).
    pub fn url(&self, endpoint: &str, mut params: HashMap<String, String>) -> String {
        let key = self
            .global
            .borrow()
            .as_ref()
            .map(|ctx| ctx.master_key().to_owned())
            .unwrap_or_default();
        let signature = sign_query(&params, &key);
        params.insert(SIGNATURE_PARAM.to_owned(), signature);
        let mut keys: Vec<_> = params.keys().cloned().collect();
        keys.sort();
        let query = keys
            .iter()
            .map(|k| format!("{}={}", url_encode(k), url_encode(&params[k])))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", endpoint, query)
    }

    // --- response builder ------------------------------------------------

    pub fn status(&self, status_line: impl Into<String>) {
        if !self.disabled.get() {
            *self.status_line.borrow_mut() = status_line.into();
        }
    }

    pub fn set_header(&self, key: impl Into<String>, value: impl Into<String>) {
        if !self.disabled.get() {
            self.output_headers.borrow_mut().insert(key.into(), value.into());
        }
    }

    pub fn content_type(&self, value: impl Into<String>) {
        self.set_header("content-type", value);
    }

    pub fn output(&self) -> Rc<RenderContext> {
        self.output.clone()
    }

    /// Drop everything built so far, disable further writes, and answer with
    /// a `302` to `target`.
    pub fn redirect(&self, target: &str) {
        self.clear();
        self.status("302 Found");
        self.set_header("location", target);
        self.disabled.set(true);
        self.output.disable();
    }

    /// Reset the response side to a blank 200.
    pub fn clear(&self) {
        self.disabled.set(false);
        *self.status_line.borrow_mut() = "200 OK".to_owned();
        self.output_headers.borrow_mut().clear();
        self.output.clear();
    }

    /// Serialize the whole response; `content-length` is computed after the
    /// render tree collapses.
    pub fn http_response(&self) -> Vec<u8> {
        let body = self.output.finalize();
        let mut out = Vec::with_capacity(body.len() + 256);
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status_line.borrow().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (key, value) in self.output_headers.borrow().iter() {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
        out.extend_from_slice(body.as_bytes());
        out
    }

    // --- populated by the server -----------------------------------------

    pub(crate) fn write_method(&self, method: String) {
        *self.method.borrow_mut() = method;
    }

    pub(crate) fn write_endpoint(&self, endpoint: String) {
        *self.endpoint.borrow_mut() = endpoint;
    }

    pub(crate) fn write_header(&self, key: String, value: String) {
        self.headers
            .borrow_mut()
            .insert(key.to_ascii_lowercase(), value);
    }

    pub(crate) fn write_query(&self, query: HashMap<String, String>) {
        *self.query.borrow_mut() = query;
    }

    pub(crate) fn write_signed_query(&self, query: HashMap<String, String>) {
        *self.signed_query.borrow_mut() = query;
    }

    pub(crate) fn write_body(&self, body: Vec<u8>) {
        *self.body.borrow_mut() = body;
    }

    pub(crate) fn write_global_context(&self, ctx: Rc<Context>) {
        *self.global.borrow_mut() = Some(ctx);
    }

    pub(crate) fn write_local_context(&self, local: Option<Rc<dyn Any>>) {
        *self.local.borrow_mut() = local;
    }
}
