//! Process-wide page-library registry.
//!
//! Libraries register a constructor-style [`PageLibrary`] under a path-like
//! key; every worker's server checks the registry out on load and back in on
//! refresh, mirroring the lifecycle a dynamically loaded page library would
//! have (`load_page` / `initialize` / `release`), with one global mutex
//! guarding the table.

use std::{
    any::Any,
    collections::BTreeMap,
    rc::Rc,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use once_cell::sync::Lazy;

use strand_aio::Context;

use crate::environment::{Environment, Status};

/// One HTTP endpoint. `name` is the dispatch key, `"METHOD /path"`.
#[async_trait(?Send)]
pub trait Page {
    fn name(&self) -> &str;
    async fn render(&self, env: &Environment) -> Result<(), Status>;
}

/// A page library: builds the per-worker page instance and owns the
/// per-library local context.
pub trait PageLibrary: Send + Sync {
    fn load_page(&self) -> Option<Box<dyn Page>> {
        None
    }

    #[allow(unused_variables)]
    fn initialize(&self, ctx: &Rc<Context>, local: Option<Rc<dyn Any>>) -> Option<Rc<dyn Any>> {
        local
    }

    #[allow(unused_variables)]
    fn release(&self, ctx: &Rc<Context>, local: Option<Rc<dyn Any>>) -> Option<Rc<dyn Any>> {
        local
    }
}

struct LibraryEntry {
    library: Arc<dyn PageLibrary>,
    references: usize,
}

static LIBRARIES: Lazy<Mutex<BTreeMap<String, LibraryEntry>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

pub fn register_library(path: impl Into<String>, library: Arc<dyn PageLibrary>) {
    if let Ok(mut libs) = LIBRARIES.lock() {
        libs.insert(
            path.into(),
            LibraryEntry {
                library,
                references: 0,
            },
        );
    }
}

/// Take a reference on every registered library. User code runs outside the
/// lock.
pub(crate) fn checkout() -> Vec<(String, Arc<dyn PageLibrary>)> {
    let mut libs = match LIBRARIES.lock() {
        Ok(libs) => libs,
        Err(_) => return Vec::new(),
    };
    libs.iter_mut()
        .map(|(path, entry)| {
            entry.references += 1;
            (path.clone(), entry.library.clone())
        })
        .collect()
}

/// Give the references back; the entries stay registered for the next scan.
pub(crate) fn checkin() -> Vec<(String, Arc<dyn PageLibrary>)> {
    let mut libs = match LIBRARIES.lock() {
        Ok(libs) => libs,
        Err(_) => return Vec::new(),
    };
    libs.iter_mut()
        .map(|(path, entry)| {
            entry.references = entry.references.saturating_sub(1);
            (path.clone(), entry.library.clone())
        })
        .collect()
}
