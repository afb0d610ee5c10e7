use std::net::SocketAddr;

use dashmap::DashMap;

use crate::addressing::{split_host, subdomain_label};

// Concurrent routing table mapping a subdomain label to the session serving
// it. Keys are the lowercased first label of the requested bind address.
// Mutated only by SSH handler tasks; read by HTTP tasks. Entries remember the
// peer address of the owning SSH connection so that teardown can be keyed by
// connection identity rather than by subdomain.
pub(crate) struct SessionRegistry<H> {
    map: DashMap<String, (SocketAddr, H)>,
}

impl<H: Clone> SessionRegistry<H> {
    pub(crate) fn new() -> Self {
        SessionRegistry {
            map: DashMap::new(),
        }
    }

    /// Registers a session under the first label of `subdomain`. Any entry
    /// already bound to that label is displaced and returned; the caller is
    /// responsible for closing the displaced session's connection, keeping
    /// I/O out of the map lock.
    pub(crate) fn insert(&self, subdomain: &str, peer: SocketAddr, session: H) -> Option<H> {
        let key = subdomain_label(subdomain);
        self.map
            .insert(key, (peer, session))
            .map(|(_, displaced)| displaced)
    }

    /// Removes the session bound to the first label of `subdomain`, if any.
    pub(crate) fn remove(&self, subdomain: &str) -> Option<H> {
        self.map
            .remove(&subdomain_label(subdomain))
            .map(|(_, (_, session))| session)
    }

    /// Resolves an HTTP Host value (port and brackets included) to the
    /// session serving its first label.
    pub(crate) fn lookup(&self, host: &str) -> Option<H> {
        let key = subdomain_label(split_host(host));
        self.map.get(&key).map(|entry| entry.value().1.clone())
    }

    /// Removes every session owned by the given SSH connection and returns
    /// them, for cleanup when the connection closes.
    pub(crate) fn remove_by_connection(&self, peer: &SocketAddr) -> Vec<H> {
        let mut removed = Vec::new();
        self.map.retain(|_, (address, session)| {
            if address == peer {
                removed.push(session.clone());
                false
            } else {
                true
            }
        });
        removed
    }
}
