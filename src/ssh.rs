use std::{net::SocketAddr, sync::Arc};

use russh::{
    Channel, ChannelId, MethodKind, MethodSet,
    server::{Auth, Handler, Msg, Session},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{PortholeServer, session::TunnelSession};

pub(crate) trait Server {
    fn new_client(&mut self, peer_address: SocketAddr) -> ServerHandler;
}

impl Server for Arc<PortholeServer> {
    // Create a new handler for the SSH connection.
    fn new_client(&mut self, peer_address: SocketAddr) -> ServerHandler {
        debug!(peer = %peer_address, "SSH client connected.");
        ServerHandler {
            peer: peer_address,
            user: None,
            session_tasks: Vec::new(),
            server: Arc::clone(self),
        }
    }
}

// Per-connection state for one SSH control connection.
pub(crate) struct ServerHandler {
    // The IP and port of this connection, doubling as its identity in the
    // registry for teardown.
    peer: SocketAddr,
    // The username from this connection's authentication.
    user: Option<String>,
    // Drain tasks holding inert session channels open until the client
    // closes them. Aborted when the connection goes away.
    session_tasks: Vec<JoinHandle<()>>,
    server: Arc<PortholeServer>,
}

impl ServerHandler {
    fn reject_with_password_method() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
            partial_success: false,
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    // With no password configured, every authentication method accepts any
    // user. Otherwise only `password` may proceed.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.server.password.is_none() {
            self.user = Some(user.into());
            info!(user, peer = %self.peer, "SSH client authenticated (none).");
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject_with_password_method())
        }
    }

    // The password must match byte for byte; the username is not checked.
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.server.password {
            Some(ref expected) if expected.as_bytes() != password.as_bytes() => {
                warn!(user, peer = %self.peer, "SSH client failed password authentication.");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
            _ => {
                self.user = Some(user.into());
                info!(user, peer = %self.peer, "SSH client authenticated (password).");
                Ok(Auth::Accept)
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.server.password.is_none() {
            self.user = Some(user.into());
            info!(user, peer = %self.peer, "SSH client authenticated (publickey).");
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject_with_password_method())
        }
    }

    // Session channels are accepted but inert, so that stock SSH clients
    // survive negotiation. The channel is held open and drained until the
    // client closes it; nothing is ever executed.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, "Opened session channel.");
        self.session_tasks.push(tokio::spawn(async move {
            let mut channel = channel;
            while channel.wait().await.is_some() {}
        }));
        Ok(true)
    }

    // Handle a remote forwarding request: register the requested subdomain
    // and serve HTTP into this connection from now on.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if *port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        if address.is_empty() || address.starts_with('.') {
            debug!(peer = %self.peer, address, "Rejecting tcpip-forward without a usable bind address.");
            return Ok(false);
        }
        // A requested port of 0 binds the default HTTP port; russh echoes the
        // normalized value in the success reply.
        if *port == 0 {
            *port = 80;
        }
        let user = self.user.clone().unwrap_or_default();
        let tunnel = Arc::new(TunnelSession::new(
            address.to_string(),
            user,
            *port as u16,
            self.peer,
            session.handle(),
        ));
        let displaced = self
            .server
            .registry
            .insert(address, self.peer, Arc::clone(&tunnel));
        // Last writer wins: a previous holder on another connection loses
        // that connection. Re-registering on the same connection only
        // replaces the entry.
        if let Some(displaced) = displaced
            && displaced.peer != self.peer
        {
            info!(
                subdomain = %displaced.subdomain,
                user = %displaced.user,
                "Evicting previous tunnel for rebound subdomain."
            );
            displaced.close().await;
        }
        info!(
            subdomain = %address,
            port = *port,
            peer = %self.peer,
            "Serving tunnel."
        );
        Ok(true)
    }

    // Closing a forward removes the matching registry entry but leaves the
    // SSH connection open.
    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        match self.server.registry.remove(address) {
            Some(removed) => {
                info!(
                    subdomain = %removed.subdomain,
                    opened_at = %removed.created_at,
                    peer = %self.peer,
                    "Canceled tunnel."
                );
            }
            None => {
                debug!(address, peer = %self.peer, "Canceling unknown forward.");
            }
        }
        Ok(true)
    }

    // The remaining session requests reply according to RFC 4254 framing but
    // allocate nothing: environment and command requests succeed, terminal
    // requests fail.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, variable_name, "Acknowledging env request.");
        session.channel_success(channel)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = %self.peer, command = %String::from_utf8_lossy(data), "Acknowledging exec request.");
        session.channel_success(channel)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)
    }
}

// Clean up registry state when the connection goes away, whatever the cause.
// Cleanup is keyed by connection identity, so every forward held by this
// connection is removed.
impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        debug!(user, peer = %self.peer, "SSH client disconnected.");
        for task in &self.session_tasks {
            task.abort();
        }
        for session in self.server.registry.remove_by_connection(&self.peer) {
            info!(
                subdomain = %session.subdomain,
                user = %session.user,
                opened_at = %session.created_at,
                "Removed tunnel for closed connection."
            );
        }
    }
}
