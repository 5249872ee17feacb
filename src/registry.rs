//! Verb handler registry.
//!
//! Handlers are installed during service construction and whenever a
//! subsystem (un)registers its verbs; dispatch happens on every inbound
//! message. Single writer, many readers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::{Error, Result};
use crate::listener::ClientInfo;
use crate::verb::Verb;

/// A type-erased handler: payload bytes in, reply bytes out.
pub(crate) type RawHandler =
    Arc<dyn Fn(Arc<ClientInfo>, Bytes) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<Verb, RawHandler>>,
}

impl HandlerRegistry {
    /// Installs a handler. Fails if one is already registered for `verb`.
    pub(crate) fn register(&self, verb: Verb, handler: RawHandler) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&verb) {
            return Err(Error::HandlerExists(verb));
        }
        handlers.insert(verb, handler);
        Ok(())
    }

    /// Removes the handler for `verb`. Idempotent.
    pub(crate) fn unregister(&self, verb: Verb) {
        self.handlers.write().unwrap().remove(&verb);
    }

    pub(crate) fn get(&self, verb: Verb) -> Option<RawHandler> {
        self.handlers.read().unwrap().get(&verb).cloned()
    }
}
