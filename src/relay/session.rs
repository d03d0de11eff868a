//! One master, its slaves, and the recording of the master's stream.
//!
//! The master's `on_data` feeds [`SessionCore::broadcast`]; its
//! `on_disconnect` closes the whole session. Master loss is terminal: there
//! is no state in which a session waits for a replacement master.
//!
//! Fan-out never blocks on one consumer for longer than the configured slave
//! queue timeout. A slave whose queue stays full is disconnected, so a slow
//! subscriber can delay the publisher by at most that bound per message.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{Connection, ConnectionHandler, ConnectionOptions, Transport};
use super::links::LinkPermit;
use crate::config::Config;
use crate::error::RelayError;
use crate::recording::Recorder;

/// Key → session map shared with the registry.
pub(crate) type SessionMap = RwLock<HashMap<String, Arc<Session>>>;

/// Close code sent to a slave that arrives after the session has ended.
const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent to a rejected duplicate slave.
const CLOSE_POLICY: u16 = 1008;
/// Close code sent to a master whose recording cannot be opened.
const CLOSE_INTERNAL: u16 = 1011;

/// Per-session parameters, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connection: ConnectionOptions,
    /// Longest wait for room in a slave's outbound queue before the slave is
    /// disconnected. Zero means no wait.
    pub slave_queue_timeout: Duration,
    /// Recording directory and container, or `None` when recording is off.
    pub recording: Option<(PathBuf, String)>,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connection: ConnectionOptions::from_config(&config.relay),
            slave_queue_timeout: config.relay.slave_queue_timeout(),
            recording: config
                .recording
                .enabled
                .then(|| (config.recording.dir_path(), config.recording.container.clone())),
        }
    }
}

/// Summary of a live session for the listing API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub uid: String,
    pub master: String,
    pub slaves: Vec<String>,
    pub age_secs: u64,
    pub messages: u64,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<String>,
}

/// A live session. Owned by the registry through an `Arc`.
pub struct Session {
    master: Connection,
    core: Arc<SessionCore>,
}

struct SessionCore {
    key: String,
    uid: Uuid,
    options: SessionOptions,
    master: OnceLock<Connection>,
    slaves: RwLock<HashMap<String, Connection>>,
    recorder: Option<Recorder>,
    /// Set before teardown takes the slave lock.
    closing: AtomicBool,
    closed: OnceCell<()>,
    done: CancellationToken,
    sessions: Weak<SessionMap>,
    created_at: Instant,
    messages: AtomicU64,
    bytes: AtomicU64,
    recording_failed: AtomicBool,
}

impl Session {
    /// Open the recording and start the master connection on `transport`.
    ///
    /// On failure the transport is closed before returning.
    pub(crate) async fn create(
        key: &str,
        transport: Transport,
        permit: Option<LinkPermit>,
        options: SessionOptions,
        sessions: Weak<SessionMap>,
    ) -> Result<Arc<Self>, RelayError> {
        let recorder = match &options.recording {
            Some((dir, container)) => match Recorder::create(dir, key, container).await {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(session = %key, error = %e, "cannot open recording");
                    transport.reject(CLOSE_INTERNAL, "recording unavailable").await;
                    return Err(e);
                }
            },
            None => None,
        };

        let core = Arc::new(SessionCore {
            key: key.to_string(),
            uid: Uuid::new_v4(),
            master: OnceLock::new(),
            slaves: RwLock::new(HashMap::new()),
            recorder,
            closing: AtomicBool::new(false),
            closed: OnceCell::new(),
            done: CancellationToken::new(),
            sessions,
            created_at: Instant::now(),
            messages: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            recording_failed: AtomicBool::new(false),
            options,
        });

        let master = Connection::open(
            transport,
            core.options.connection.clone(),
            Arc::new(MasterHandler {
                core: Arc::clone(&core),
            }),
            permit,
        );
        let _ = core.master.set(master.clone());

        info!(session = %key, uid = %core.uid, master = %master.id(), "session created");
        Ok(Arc::new(Self { master, core }))
    }

    pub fn key(&self) -> &str {
        &self.core.key
    }

    /// Unique per session instance; a re-created key gets a new uid.
    pub fn uid(&self) -> Uuid {
        self.core.uid
    }

    pub fn master(&self) -> &Connection {
        &self.master
    }

    /// Attach a slave on `transport`. A second slave with an identity that is
    /// already attached is closed and rejected; the first one stays.
    pub async fn add_slave(
        &self,
        transport: Transport,
        permit: Option<LinkPermit>,
    ) -> Result<Connection, RelayError> {
        let id = transport.id().to_string();
        let mut slaves = self.core.slaves.write().await;

        if self.core.closing.load(Ordering::SeqCst) {
            drop(slaves);
            transport.reject(CLOSE_GOING_AWAY, "session closed").await;
            return Err(RelayError::UnknownSession(self.core.key.clone()));
        }
        if slaves.contains_key(&id) {
            drop(slaves);
            warn!(session = %self.core.key, slave = %id, "duplicate slave rejected");
            transport.reject(CLOSE_POLICY, "duplicate slave").await;
            return Err(RelayError::DuplicateSlave(id));
        }

        let conn = Connection::open(
            transport,
            self.core.options.connection.clone(),
            Arc::new(SlaveHandler {
                core: Arc::downgrade(&self.core),
            }),
            permit,
        );
        slaves.insert(id, conn.clone());
        info!(
            session = %self.core.key,
            slave = %conn.id(),
            slaves = slaves.len(),
            "slave attached"
        );
        Ok(conn)
    }

    /// Fan `message` out to every slave and append it to the recording.
    pub async fn broadcast(&self, message: Bytes) {
        self.core.broadcast(message).await;
    }

    /// Close every slave, the master, and the recording. Idempotent.
    pub async fn close(&self) {
        self.core.close().await;
    }

    /// Whether teardown has started.
    pub fn is_closed(&self) -> bool {
        self.core.closing.load(Ordering::SeqCst)
    }

    /// Wait until teardown has finished.
    pub async fn closed(&self) {
        self.core.done.cancelled().await;
    }

    pub async fn slave_count(&self) -> usize {
        self.core.slaves.read().await.len()
    }

    pub async fn info(&self) -> SessionInfo {
        let mut slaves: Vec<String> = self.core.slaves.read().await.keys().cloned().collect();
        slaves.sort();
        SessionInfo {
            key: self.core.key.clone(),
            uid: self.core.uid.to_string(),
            master: self.master.id().to_string(),
            slaves,
            age_secs: self.core.created_at.elapsed().as_secs(),
            messages: self.core.messages.load(Ordering::Relaxed),
            bytes: self.core.bytes.load(Ordering::Relaxed),
            recording: self
                .core
                .recorder
                .as_ref()
                .map(|r| r.path().display().to_string()),
        }
    }
}

impl SessionCore {
    async fn broadcast(&self, message: Bytes) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(message.len() as u64, Ordering::Relaxed);

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.append(message.clone()).await {
                // Log once per session; the stream keeps flowing to slaves.
                if !self.recording_failed.swap(true, Ordering::Relaxed) {
                    warn!(session = %self.key, error = %e, "recording append failed");
                }
            }
        }

        let targets: Vec<Connection> = self.slaves.read().await.values().cloned().collect();
        let wait = self.options.slave_queue_timeout;
        for slave in targets {
            match slave.send_timeout(message.clone(), wait).await {
                Ok(()) => {}
                Err(RelayError::QueueFull) => {
                    warn!(
                        session = %self.key,
                        slave = %slave.id(),
                        queued = slave.queued(),
                        "slave queue saturated, disconnecting"
                    );
                    tokio::spawn(async move {
                        let _ = slave.close().await;
                    });
                }
                // Already closing; its disconnect handler removes it.
                Err(e) => debug!(session = %self.key, slave = %slave.id(), error = %e, "skip slave"),
            }
        }
    }

    async fn close(&self) {
        self.closed
            .get_or_init(|| async {
                self.closing.store(true, Ordering::SeqCst);

                let slaves: Vec<Connection> =
                    self.slaves.write().await.drain().map(|(_, c)| c).collect();
                let count = slaves.len();
                futures::future::join_all(slaves.iter().map(|s| s.close())).await;

                if let Some(master) = self.master.get() {
                    let _ = master.close().await;
                }
                if let Some(recorder) = &self.recorder {
                    recorder.close().await;
                }
                self.evict().await;

                info!(
                    session = %self.key,
                    uid = %self.uid,
                    slaves = count,
                    messages = self.messages.load(Ordering::Relaxed),
                    "session closed"
                );
                self.done.cancel();
            })
            .await;
    }

    /// Remove this session from the registry unless the key has already been
    /// taken over by a newer session.
    async fn evict(&self) {
        let Some(sessions) = self.sessions.upgrade() else {
            return;
        };
        let mut sessions = sessions.write().await;
        if sessions.get(&self.key).is_some_and(|s| s.uid() == self.uid) {
            sessions.remove(&self.key);
            debug!(session = %self.key, "session evicted");
        }
    }

    async fn remove_slave(&self, conn: &Connection) {
        let mut slaves = self.slaves.write().await;
        if slaves.get(conn.id()).is_some_and(|c| c.ptr_eq(conn)) {
            slaves.remove(conn.id());
            debug!(session = %self.key, slave = %conn.id(), remaining = slaves.len(), "slave detached");
        }
    }
}

struct MasterHandler {
    core: Arc<SessionCore>,
}

#[async_trait]
impl ConnectionHandler for MasterHandler {
    async fn on_connect(&self, conn: &Connection) {
        info!(session = %self.core.key, master = %conn.id(), "[OnConnect] master connected");
    }

    async fn on_data(&self, _conn: &Connection, message: Bytes) {
        self.core.broadcast(message).await;
    }

    async fn on_disconnect(&self, conn: &Connection, error: Option<RelayError>) {
        match error {
            Some(e) => info!(session = %self.core.key, master = %conn.id(), error = %e, "[OnDisconnect] master disconnected"),
            None => info!(session = %self.core.key, master = %conn.id(), "[OnDisconnect] master disconnected"),
        }
        self.core.close().await;
    }
}

struct SlaveHandler {
    core: Weak<SessionCore>,
}

#[async_trait]
impl ConnectionHandler for SlaveHandler {
    async fn on_data(&self, conn: &Connection, message: Bytes) {
        debug!(slave = %conn.id(), bytes = message.len(), "ignoring data from slave");
    }

    async fn on_disconnect(&self, conn: &Connection, error: Option<RelayError>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        match error {
            Some(e) => info!(session = %core.key, slave = %conn.id(), error = %e, "[OnDisconnect] slave disconnected"),
            None => info!(session = %core.key, slave = %conn.id(), "[OnDisconnect] slave disconnected"),
        }
        core.remove_slave(conn).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessageType;
    use crate::relay::connection::testing::{stalled_transport, transport};
    use axum::extract::ws::Message;

    fn options(dir: Option<&std::path::Path>) -> SessionOptions {
        SessionOptions {
            connection: ConnectionOptions {
                ping_period: Duration::from_secs(30),
                max_missed_pongs: 3,
                message_type: MessageType::Binary,
                read_deadline: Duration::from_secs(3600),
                write_deadline: Duration::from_secs(10),
            },
            slave_queue_timeout: Duration::ZERO,
            recording: dir.map(|d| (d.to_path_buf(), "webm".to_string())),
        }
    }

    async fn binary(peer: &mut crate::relay::connection::testing::Peer) -> Vec<u8> {
        match peer.next_data().await {
            Some(Message::Binary(b)) => b.to_vec(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_slaves_and_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (mt, master) = transport("10.0.0.1:1");
        let session = Session::create("room1", mt, None, options(Some(dir.path())), Weak::new())
            .await
            .unwrap();

        let (s1, mut p1) = transport("10.0.0.2:1");
        let (s2, mut p2) = transport("10.0.0.3:1");
        session.add_slave(s1, None).await.unwrap();
        session.add_slave(s2, None).await.unwrap();

        master.send_binary(&[1, 2, 3]);
        master.send_binary(&[4]);
        assert_eq!(binary(&mut p1).await, vec![1, 2, 3]);
        assert_eq!(binary(&mut p1).await, vec![4]);
        assert_eq!(binary(&mut p2).await, vec![1, 2, 3]);
        assert_eq!(binary(&mut p2).await, vec![4]);

        drop(master);
        session.closed().await;
        let content = std::fs::read(dir.path().join("master_room1.webm")).unwrap();
        assert_eq!(content, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_recording_without_slaves() {
        let dir = tempfile::tempdir().unwrap();
        let (mt, master) = transport("10.0.0.1:2");
        let session = Session::create("solo", mt, None, options(Some(dir.path())), Weak::new())
            .await
            .unwrap();

        master.send_binary(b"abc");
        master.send_binary(b"def");
        drop(master);
        session.closed().await;

        let content = std::fs::read(dir.path().join("master_solo.webm")).unwrap();
        assert_eq!(content, b"abcdef");
        assert_eq!(session.info().await.messages, 2);
    }

    #[tokio::test]
    async fn test_master_disconnect_closes_every_slave() {
        let (mt, master) = transport("10.0.0.1:3");
        let session = Session::create("room2", mt, None, options(None), Weak::new())
            .await
            .unwrap();
        let (s1, mut p1) = transport("10.0.0.2:3");
        let (s2, mut p2) = transport("10.0.0.3:3");
        let c1 = session.add_slave(s1, None).await.unwrap();
        let c2 = session.add_slave(s2, None).await.unwrap();

        drop(master);
        session.closed().await;
        c1.closed().await;
        c2.closed().await;
        assert!(c1.is_closed() && c2.is_closed());
        assert_eq!(session.slave_count().await, 0);
        assert!(p1.next_data().await.is_none());
        assert!(p2.next_data().await.is_none());
    }

    #[tokio::test]
    async fn test_slave_disconnect_removes_it() {
        let (mt, _master) = transport("10.0.0.1:4");
        let session = Session::create("room3", mt, None, options(None), Weak::new())
            .await
            .unwrap();
        let (s1, p1) = transport("10.0.0.2:4");
        let c1 = session.add_slave(s1, None).await.unwrap();
        assert_eq!(session.slave_count().await, 1);

        drop(p1);
        c1.closed().await;
        assert_eq!(session.slave_count().await, 0);
        assert!(!session.is_closed());
        session.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_slave_identity_keeps_first() {
        let (mt, _master) = transport("10.0.0.1:5");
        let session = Session::create("room4", mt, None, options(None), Weak::new())
            .await
            .unwrap();
        let (first, _p1) = transport("10.0.0.9:9");
        let (second, mut p2) = transport("10.0.0.9:9");
        let kept = session.add_slave(first, None).await.unwrap();

        let err = session.add_slave(second, None).await.unwrap_err();
        assert_eq!(err, RelayError::DuplicateSlave("10.0.0.9:9".to_string()));
        assert!(matches!(p2.next_data().await, Some(Message::Close(_))));
        assert_eq!(session.slave_count().await, 1);
        assert!(!kept.is_closed());
        session.close().await;
    }

    #[tokio::test]
    async fn test_saturated_slave_is_disconnected() {
        let (mt, master) = transport("10.0.0.1:6");
        let mut opts = options(None);
        opts.slave_queue_timeout = Duration::from_millis(200);
        let session = Session::create("room5", mt, None, opts, Weak::new())
            .await
            .unwrap();

        let (fast, mut fast_peer) = transport("10.0.0.2:6");
        let (slow, _slow_peer) = stalled_transport("10.0.0.3:6", 0);
        session.add_slave(fast, None).await.unwrap();
        let slow = session.add_slave(slow, None).await.unwrap();

        for i in 0..100u8 {
            master.send_binary(&[i]);
        }
        for i in 0..100u8 {
            assert_eq!(binary(&mut fast_peer).await, vec![i]);
        }
        slow.closed().await;
        assert_eq!(session.slave_count().await, 1);
        assert!(!session.is_closed());
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_late_slaves() {
        let (mt, _master) = transport("10.0.0.1:7");
        let session = Session::create("room6", mt, None, options(None), Weak::new())
            .await
            .unwrap();
        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert!(session.master().is_closed());

        let (late, _p) = transport("10.0.0.2:7");
        assert!(matches!(
            session.add_slave(late, None).await,
            Err(RelayError::UnknownSession(_))
        ));
    }
}
