//! Session registry: routes upgraded sockets to a role and a session.
//!
//! `master == slave` declares a new session under that key; any other pair
//! attaches a slave to the session named by `master`. A second master for a
//! key already in use closes the prior session (and its slaves) before the
//! new one is stored. Sessions remove themselves when their master goes away.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::connection::Transport;
use super::links::LinkPermit;
use super::session::{Session, SessionInfo, SessionMap, SessionOptions};
use crate::error::RelayError;

/// Close code sent to a socket whose routing failed.
const CLOSE_POLICY: u16 = 1008;

/// Role a socket takes once routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Session keys: ASCII alphanumerics plus `-`, `_`, `.`; 1 to 64 characters.
pub fn is_valid_key(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Decide the role for a `master`/`slave` query pair.
pub fn resolve_role(master_key: &str, slave_key: &str) -> Result<Role, RelayError> {
    if master_key.is_empty() || slave_key.is_empty() {
        return Err(RelayError::InvalidRole(
            "master and slave must both be non-empty".to_string(),
        ));
    }
    // Only the master key names a recording file.
    if !is_valid_key(master_key) {
        return Err(RelayError::InvalidRole(
            "master key must be 1-64 characters of [A-Za-z0-9._-]".to_string(),
        ));
    }
    Ok(if master_key == slave_key {
        Role::Master
    } else {
        Role::Slave
    })
}

/// Shared map of live sessions. Cloneable; all clones share one map.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    options: SessionOptions,
}

impl SessionRegistry {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            options,
        }
    }

    /// Route an upgraded socket.
    ///
    /// Every error path closes `transport` before returning, so the caller
    /// has nothing left to release.
    pub async fn handle_upgrade(
        &self,
        transport: Transport,
        master_key: &str,
        slave_key: &str,
        permit: Option<LinkPermit>,
    ) -> Result<Role, RelayError> {
        let role = match resolve_role(master_key, slave_key) {
            Ok(role) => role,
            Err(e) => {
                transport.reject(CLOSE_POLICY, "invalid role").await;
                return Err(e);
            }
        };

        match role {
            Role::Master => {
                self.create_session(master_key, transport, permit).await?;
            }
            Role::Slave => {
                let session = self.sessions.read().await.get(master_key).cloned();
                let Some(session) = session else {
                    warn!(session = %master_key, conn = %transport.id(), "slave for unknown session");
                    transport.reject(CLOSE_POLICY, "unknown session").await;
                    return Err(RelayError::UnknownSession(master_key.to_string()));
                };
                session.add_slave(transport, permit).await?;
            }
        }
        Ok(role)
    }

    async fn create_session(
        &self,
        key: &str,
        transport: Transport,
        permit: Option<LinkPermit>,
    ) -> Result<Arc<Session>, RelayError> {
        let prior = self.sessions.write().await.remove(key);
        if let Some(prior) = prior {
            info!(session = %key, uid = %prior.uid(), "new master for key in use, closing prior session");
            prior.close().await;
        }

        let session = Session::create(
            key,
            transport,
            permit,
            self.options.clone(),
            Arc::downgrade(&self.sessions),
        )
        .await?;

        let displaced = self
            .sessions
            .write()
            .await
            .insert(key.to_string(), Arc::clone(&session));
        if let Some(displaced) = displaced {
            // Two masters raced for the key; the later insert wins.
            displaced.close().await;
        }
        // The master may already be gone; its eviction could have run before
        // the insert above.
        if session.is_closed() {
            self.remove_if_current(&session).await;
        }
        Ok(session)
    }

    async fn remove_if_current(&self, session: &Session) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session.key())
            .is_some_and(|s| s.uid() == session.uid())
        {
            sessions.remove(session.key());
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.sessions.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of every live session, sorted by key.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Close every session. Used on shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "closing all sessions");
        }
        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
    }
}
