//! Post-authentication session bookkeeping.
//!
//! The router hands out a session once authentication completes and
//! indexes it by channel id and child process id. A failed lookup is an
//! ordinary miss, never a crash; channels and processes come and go
//! independently of each other.

use std::collections::HashMap;

pub type SessionId = u32;

/// One interactive session, port forward or subsystem.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub user: String,
    pub channel_id: Option<u32>,
    pub pid: Option<u32>,
    /// Permission flags flipped by the corresponding channel requests.
    pub x11_forwarding: bool,
    pub agent_forwarding: bool,
}

/// Owns all live sessions of a connection.
#[derive(Debug, Default)]
pub struct SessionRouter {
    next_id: SessionId,
    sessions: HashMap<SessionId, Session>,
    by_channel: HashMap<u32, SessionId>,
    by_pid: HashMap<u32, SessionId>,
}

impl SessionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry point from the auth engines: allocates a session for the
    /// freshly authenticated user.
    pub fn authenticated(&mut self, user: &str) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        tracing::debug!("session {} allocated for {}", id, user);
        self.sessions.insert(
            id,
            Session {
                id,
                user: user.to_owned(),
                channel_id: None,
                pid: None,
                x11_forwarding: false,
                agent_forwarding: false,
            },
        );
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Binds the session to a channel, replacing any previous binding.
    pub fn bind_channel(&mut self, id: SessionId, channel_id: u32) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                if let Some(old) = session.channel_id.replace(channel_id) {
                    self.by_channel.remove(&old);
                }
                self.by_channel.insert(channel_id, id);
                true
            }
            None => false,
        }
    }

    pub fn bind_pid(&mut self, id: SessionId, pid: u32) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                if let Some(old) = session.pid.replace(pid) {
                    self.by_pid.remove(&old);
                }
                self.by_pid.insert(pid, id);
                true
            }
            None => false,
        }
    }

    pub fn by_channel(&self, channel_id: u32) -> Option<&Session> {
        self.by_channel
            .get(&channel_id)
            .and_then(|id| self.sessions.get(id))
    }

    pub fn by_pid(&self, pid: u32) -> Option<&Session> {
        self.by_pid.get(&pid).and_then(|id| self.sessions.get(id))
    }

    /// Drops a session and both of its index entries.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        if let Some(channel_id) = session.channel_id {
            self.by_channel.remove(&channel_id);
        }
        if let Some(pid) = session.pid {
            self.by_pid.remove(&pid);
        }
        tracing::debug!("session {} closed", id);
        Some(session)
    }
}
