use std::sync::Arc;

use crate::{connections::SessionRegistry, session::TunnelSession};

pub mod config;

mod addressing;
mod connections;
mod entrypoint;
mod error;
mod files;
mod http;
mod session;
mod ssh;

pub use crate::{config::ApplicationConfig, entrypoint::entrypoint};

// State shared by every SSH connection handler. The HTTP side never sees
// this struct; it holds its own Arc of the registry.
pub(crate) struct PortholeServer {
    // Routing table of registered forwards, keyed by subdomain label.
    pub(crate) registry: Arc<SessionRegistry<Arc<TunnelSession>>>,
    // Shared password for SSH authentication. None disables authentication.
    pub(crate) password: Option<String>,
}
