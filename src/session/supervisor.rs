//! Session supervisor and handles.
//!
//! The supervisor owns the directory of live sessions. Each orchestrator is
//! handed the same directory at construction and removes its own entry on
//! teardown, so the directory never lists a finished session.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::orchestrator::{SessionControl, SessionDeps, SessionOrchestrator};
use super::{EndReason, SessionStatus, SessionSummary};
use crate::broadcast::EventBroadcaster;
use crate::config::Config;
use crate::error::{ParleyError, Result};
use crate::log_component;
use crate::protocol::SpeechConnector;
use crate::recovery::RecoveryStore;
use crate::tools::ToolRegistry;

/// Live sessions by id.
pub type SessionDirectory = Arc<DashMap<String, SessionHandle>>;

/// Cheap, cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    control: mpsc::Sender<SessionControl>,
}

impl SessionHandle {
    pub fn new(session_id: impl Into<String>, control: mpsc::Sender<SessionControl>) -> Self {
        Self {
            session_id: session_id.into(),
            control,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// State, running calls and context size, answered by the session task.
    pub async fn status(&self) -> Result<SessionStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionControl::Status(tx)).await?;
        rx.await
            .map_err(|_| ParleyError::ChannelClosed(format!("session {} status", self.session_id)))
    }

    /// Ask the session to end. Returns once the request is queued.
    pub async fn close(&self, reason: EndReason) -> Result<()> {
        self.send(SessionControl::Close { reason }).await
    }

    pub async fn set_preference(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        self.send(SessionControl::SetPreference {
            key: key.into(),
            value: value.into(),
        })
        .await
    }

    pub async fn playback_started(&self) -> Result<()> {
        self.send(SessionControl::PlaybackStarted).await
    }

    pub async fn playback_flushed(&self, bytes: u64) -> Result<()> {
        self.send(SessionControl::PlaybackFlushed { bytes }).await
    }

    pub async fn cancel_tools(&self, immediate: bool) -> Result<()> {
        self.send(SessionControl::CancelTools { immediate }).await
    }

    /// The session task has exited.
    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    async fn send(&self, msg: SessionControl) -> Result<()> {
        self.control
            .send(msg)
            .await
            .map_err(|_| ParleyError::ChannelClosed(format!("session {}", self.session_id)))
    }
}

/// Spawns sessions and keeps the directory of live ones.
pub struct SessionSupervisor {
    config: Arc<Config>,
    registry: Arc<ToolRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    connector: Arc<dyn SpeechConnector>,
    store: Option<Arc<dyn RecoveryStore>>,
    directory: SessionDirectory,
    tasks: Mutex<HashMap<String, JoinHandle<SessionSummary>>>,
}

impl SessionSupervisor {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ToolRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        connector: Arc<dyn SpeechConnector>,
        store: Option<Arc<dyn RecoveryStore>>,
    ) -> Self {
        Self {
            config,
            registry,
            broadcaster,
            connector,
            store,
            directory: SessionDirectory::default(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session. Without an id a fresh one is generated. With
    /// `resume`, the stored record for that id is consumed and used to seed
    /// the new session; a missing record starts it fresh.
    pub async fn spawn_session(
        &self,
        session_id: Option<String>,
        resume: bool,
    ) -> Result<SessionHandle> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.directory.contains_key(&session_id) {
            return Err(ParleyError::Protocol(format!(
                "session {} is already running",
                session_id
            )));
        }

        let record = match (&self.store, resume) {
            (Some(store), true) => store.take(&session_id).await?,
            _ => None,
        };
        let resumed = record.is_some();

        let (control, control_rx) = mpsc::channel(self.config.session.channel_buffer.max(1));
        let handle = SessionHandle::new(session_id.clone(), control);
        match self.directory.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                return Err(ParleyError::Protocol(format!(
                    "session {} is already running",
                    session_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }

        let deps = SessionDeps {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            broadcaster: Arc::clone(&self.broadcaster),
            connector: Arc::clone(&self.connector),
            store: self.store.clone(),
            directory: Arc::clone(&self.directory),
        };
        let orchestrator = SessionOrchestrator::new(session_id.clone(), deps, control_rx, record);
        let task = tokio::spawn(orchestrator.run());
        self.tasks.lock().insert(session_id.clone(), task);

        log_component!(
            info,
            "supervisor",
            "Session spawned",
            session_id = session_id.as_str(),
            resumed = resumed
        );
        Ok(handle)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.directory.get(session_id).map(|h| h.value().clone())
    }

    /// Ids of live sessions, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.directory.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    /// Close a session and wait for its summary.
    pub async fn close(&self, session_id: &str, reason: EndReason) -> Result<SessionSummary> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| ParleyError::NotFound(format!("session {}", session_id)))?;
        // The task may already be winding down on its own.
        if handle.close(reason).await.is_err() {
            log_component!(
                debug,
                "supervisor",
                "Session already closing",
                session_id = session_id
            );
        }
        self.wait(session_id).await
    }

    /// Wait for a session's run loop to finish.
    pub async fn wait(&self, session_id: &str) -> Result<SessionSummary> {
        let task = self
            .tasks
            .lock()
            .remove(session_id)
            .ok_or_else(|| ParleyError::NotFound(format!("session {}", session_id)))?;
        task.await
            .map_err(|e| ParleyError::ChannelClosed(format!("session {} task: {}", session_id, e)))
    }

    /// Close every session and collect the summaries of those that finished cleanly.
    pub async fn shutdown_all(&self, reason: EndReason) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> =
            self.directory.iter().map(|e| e.value().clone()).collect();
        for handle in &handles {
            let _ = handle.close(reason).await;
        }

        let tasks: Vec<(String, JoinHandle<SessionSummary>)> =
            self.tasks.lock().drain().collect();
        log_component!(
            info,
            "supervisor",
            "Shutting down sessions",
            count = tasks.len()
        );

        let (ids, joins): (Vec<String>, Vec<_>) = tasks.into_iter().unzip();
        let mut summaries = Vec::with_capacity(ids.len());
        for (id, joined) in ids.into_iter().zip(join_all(joins).await) {
            match joined {
                Ok(summary) => summaries.push(summary),
                Err(e) => log_component!(
                    warn,
                    "supervisor",
                    "Session task failed",
                    session_id = id.as_str(),
                    error = e.to_string()
                ),
            }
        }
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }
}
