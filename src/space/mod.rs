//! In-process tuple space.
//!
//! A [`TupleSpace`] is a set of independently locked, named [`Context`]s. Each
//! context is a TTL-aware FIFO queue: producers `write` at the tail, consumers
//! block in `take`/`read` on the head, and `give_back` re-queues a value at the
//! head so it keeps its read priority. Channel I/O threads hand received
//! messages to worker threads through these contexts.
pub mod context;

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use log::debug;
use parking_lot::Mutex;

pub use context::{Context, Entry};

/// Name of the context every space creates up front.
pub const DEFAULT_CONTEXT: &str = "default";

type Factory<T> = Box<dyn Fn(&str) -> Context<T> + Send + Sync>;

pub struct TupleSpace<T> {
    default: Arc<Context<T>>,
    contexts: Mutex<HashMap<String, Arc<Context<T>>>>,
    factory: Factory<T>,
}

impl<T: 'static> TupleSpace<T> {
    pub fn new() -> Self {
        Self::with_factory(|name: &str| Context::new(name))
    }

    /// Uses `factory` to build contexts the first time a name is used.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&str) -> Context<T> + Send + Sync + 'static,
    {
        Self {
            default: Arc::new(factory(DEFAULT_CONTEXT)),
            contexts: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    pub fn default_context(&self) -> Arc<Context<T>> {
        Arc::clone(&self.default)
    }

    /// Returns the context called `name`, creating it on first use.
    pub fn context(&self, name: &str) -> Arc<Context<T>> {
        if name == DEFAULT_CONTEXT {
            return self.default_context();
        }

        let mut contexts = self.contexts.lock();
        let context = contexts.entry(name.to_string()).or_insert_with(|| {
            debug!("creating tuple space context '{name}'");
            Arc::new((self.factory)(name))
        });
        Arc::clone(context)
    }

    /// Names of the contexts created so far, the default one excluded.
    pub fn context_names(&self) -> Vec<String> {
        self.contexts.lock().keys().cloned().collect()
    }

    pub fn write(&self, name: &str, value: T, ttl: Option<Duration>) {
        self.context(name).write(value, ttl);
    }

    pub fn give_back(&self, name: &str, value: T, ttl: Option<Duration>) {
        self.context(name).give_back(value, ttl);
    }

    pub fn take(&self, name: &str, timeout: Option<Duration>) -> Option<T> {
        self.context(name).take(timeout)
    }
}

impl<T: Clone + 'static> TupleSpace<T> {
    pub fn read(&self, name: &str, timeout: Option<Duration>) -> Option<T> {
        self.context(name).read(timeout)
    }
}

impl<T: 'static> Default for TupleSpace<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Debug for TupleSpace<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleSpace")
            .field("contexts", &self.context_names())
            .finish()
    }
}
