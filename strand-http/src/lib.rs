//! HTTP/1.1 on the asynchronous substrate: a keep-alive page server, the
//! render-context tree it serializes through, and a one-shot client with
//! pooled connections.

pub mod client;
pub mod environment;
pub mod registry;
pub mod render;
pub mod server;
pub mod util;

pub use client::{HttpClient, HttpResponse};
pub use environment::{Environment, Status};
pub use registry::{register_library, Page, PageLibrary};
pub use render::{escape, RenderContext};
pub use server::{render_error, HttpServer};
