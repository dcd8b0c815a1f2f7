use std::{collections::HashMap, net::SocketAddr};

use log::debug;
use parking_lot::Mutex;

/// In-process registry of listening channels, keyed by channel name.
///
/// Listeners register the address they bound to; client channels look their
/// `remote_address` up here before falling back to name resolution, which is
/// how two channels in the same process find each other.
#[derive(Debug, Default)]
pub struct Directory {
    entries: Mutex<HashMap<String, SocketAddr>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, address: SocketAddr) {
        debug!("directory: '{name}' -> {address}");
        self.entries.lock().insert(name.to_string(), address);
    }

    pub fn unregister(&self, name: &str) -> Option<SocketAddr> {
        self.entries.lock().remove(name)
    }

    pub fn lookup(&self, name: &str) -> Option<SocketAddr> {
        self.entries.lock().get(name).copied()
    }
}
