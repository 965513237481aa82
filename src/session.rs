use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::resolve::{ResolveError, ResolverTable};
use crate::signal::SignalSet;
use crate::tag::Tag;

/// Resolved payloads keyed by the tag's wire form.
pub type Updates = serde_json::Map<String, Value>;

/// Validate a session id. Ids must be 1-128 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_session_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("session id must not be empty".into());
    }
    if id.len() > 128 {
        return Err(format!("session id too long ({} chars, max 128)", id.len()));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
        return Err(format!(
            "session id contains invalid characters: {}",
            id.chars().take(128).collect::<String>()
        ));
    }
    Ok(())
}

/// Timeouts governing session liveness and long-poll waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// A session that has not polled for longer than this is evicted by the
    /// next announcement sweep.
    pub session_timeout: Duration,
    /// How long a poll waits for a tag when nothing is pending.
    pub long_poll_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(300),
            long_poll_timeout: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// A poll refreshes liveness only when it starts, so the wait must end
    /// before the session could be considered idle.
    pub fn validate(&self) -> Result<(), String> {
        if self.session_timeout.is_zero() {
            return Err("session timeout must be greater than zero".into());
        }
        if self.long_poll_timeout.is_zero() {
            return Err("long-poll timeout must be greater than zero".into());
        }
        if self.long_poll_timeout >= self.session_timeout {
            return Err(format!(
                "long-poll timeout ({:?}) must be shorter than session timeout ({:?})",
                self.long_poll_timeout, self.session_timeout
            ));
        }
        Ok(())
    }
}

/// One observer's pending-tag state and liveness.
pub struct Session {
    id: String,
    principal: String,
    pending: SignalSet<Tag>,
    last_activity: Mutex<Instant>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("principal", &self.principal)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// New sessions start with every global tag pending so the first poll
    /// returns the full current state.
    fn new(id: &str, principal: &str) -> Self {
        Self {
            id: id.to_string(),
            principal: principal.to_string(),
            pending: SignalSet::seeded(Tag::all_globals()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.idle() > timeout
    }
}

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Not polled within the session timeout.
    Timeout,
    /// Explicitly ended by its client.
    Closed,
    /// Registry cleared at shutdown.
    Shutdown,
}

/// Session presence events, for collaborators tracking who is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { id: String, principal: String },
    Ended { id: String, reason: EndReason },
}

/// Snapshot of one session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub principal: String,
    pub idle_ms: u64,
    pub pending: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// A pending tag has no resolver registered for its kind.
    #[error("no resolver registered for tag {0}")]
    Unresolvable(Tag),

    #[error("resolver for tag {tag} failed: {source}")]
    ResolverFailed {
        tag: Tag,
        #[source]
        source: anyhow::Error,
    },
}

impl From<ResolveError> for PollError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unregistered(tag) => PollError::Unresolvable(tag),
            ResolveError::Failed { tag, source } => PollError::ResolverFailed { tag, source },
        }
    }
}

struct RegistryInner {
    sessions: HashMap<String, Arc<Session>>,
}

/// Owns every live session, keyed by the client-supplied id.
///
/// The registry lock only guards the id→session map. It is held for map
/// manipulation and for inserting a tag into each session's pending set, never
/// across a long-poll wait or a resolver call, so announcing from the
/// simulation thread cannot deadlock against a poll in flight.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    config: SessionConfig,
    resolvers: Arc<ResolverTable>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, resolvers: ResolverTable) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
            })),
            config,
            resolvers: Arc::new(resolvers),
            events_tx,
        }
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    pub fn resolvers(&self) -> &ResolverTable {
        &self.resolvers
    }

    /// Mark `tag` dirty for every live session, evicting timed-out ones.
    ///
    /// Eviction rides along with announcements: a server nobody announces to
    /// never spends cycles reaping. Returns the number of sessions marked.
    pub fn announce(&self, tag: &Tag) -> usize {
        let timeout = self.config.session_timeout;
        let mut evicted = Vec::new();
        let mut marked = 0;
        {
            let mut inner = self.inner.write();
            inner.sessions.retain(|id, session| {
                if session.is_expired(timeout) {
                    evicted.push(id.clone());
                    false
                } else {
                    session.pending.add(tag.clone());
                    marked += 1;
                    true
                }
            });
        }
        for id in evicted {
            tracing::debug!(session = %id, "session timed out");
            let _ = self.events_tx.send(SessionEvent::Ended {
                id,
                reason: EndReason::Timeout,
            });
        }
        tracing::trace!(%tag, marked, "tag announced");
        marked
    }

    /// Return the tags that changed for `session_id`, resolved to payloads.
    ///
    /// Unknown ids start a new session seeded with every global tag. If
    /// nothing is pending the call waits up to the long-poll timeout for one
    /// tag; an empty map means nothing changed in that window.
    ///
    /// Dropping the returned future while it waits leaves the session's
    /// pending set untouched. Tags drained but not yet delivered are lost.
    pub async fn poll(&self, session_id: &str, principal: &str) -> Result<Updates, PollError> {
        let tags = self.pending(session_id, principal).await?;
        self.resolve_all(tags).await
    }

    /// The drain-then-wait half of [`poll`](Self::poll), without resolving.
    pub async fn pending(
        &self,
        session_id: &str,
        principal: &str,
    ) -> Result<HashSet<Tag>, PollError> {
        validate_session_id(session_id).map_err(PollError::InvalidSessionId)?;
        let session = self.get_or_create(session_id, principal);

        // Drain first and wait only on an empty drain, so a tag announced
        // between the two steps is caught by the wait.
        let tags = session.pending.drain_all();
        if !tags.is_empty() {
            tracing::debug!(session = %session_id, count = tags.len(), "drained pending tags");
            return Ok(tags);
        }

        let tags: HashSet<Tag> = session
            .pending
            .await_one(self.config.long_poll_timeout)
            .await
            .into_iter()
            .collect();
        if tags.is_empty() {
            tracing::trace!(session = %session_id, "long poll timed out empty");
        }
        Ok(tags)
    }

    /// Resolve each tag to its payload. The first failure aborts the whole call.
    pub async fn resolve_all(
        &self,
        tags: impl IntoIterator<Item = Tag>,
    ) -> Result<Updates, PollError> {
        let mut tags: Vec<Tag> = tags.into_iter().collect();
        tags.sort();
        let values = futures::future::try_join_all(tags.iter().map(|tag| self.resolvers.resolve(tag)))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to resolve updates");
                PollError::from(e)
            })?;
        Ok(tags.iter().map(Tag::to_string).zip(values).collect())
    }

    /// Look up or start a session, refreshing its liveness while the
    /// registry lock is held so a concurrent sweep cannot evict it in between.
    fn get_or_create(&self, id: &str, principal: &str) -> Arc<Session> {
        let timeout = self.config.session_timeout;
        {
            let inner = self.inner.read();
            if let Some(session) = inner.sessions.get(id) {
                if !session.is_expired(timeout) {
                    session.touch();
                    return session.clone();
                }
            }
        }

        let mut replaced = false;
        let mut created = false;
        let session = {
            let mut inner = self.inner.write();
            match inner.sessions.entry(id.to_string()) {
                Entry::Occupied(mut entry) if entry.get().is_expired(timeout) => {
                    // Expired but not yet swept: treat as evicted and restart.
                    let fresh = Arc::new(Session::new(id, principal));
                    entry.insert(fresh.clone());
                    replaced = true;
                    created = true;
                    fresh
                }
                Entry::Occupied(entry) => {
                    entry.get().touch();
                    entry.get().clone()
                }
                Entry::Vacant(entry) => {
                    let fresh = Arc::new(Session::new(id, principal));
                    entry.insert(fresh.clone());
                    created = true;
                    fresh
                }
            }
        };

        if replaced {
            tracing::debug!(session = %id, "session timed out before sweep");
            let _ = self.events_tx.send(SessionEvent::Ended {
                id: id.to_string(),
                reason: EndReason::Timeout,
            });
        }
        if created {
            tracing::debug!(session = %id, principal = %principal, "starting new session");
            let _ = self.events_tx.send(SessionEvent::Started {
                id: id.to_string(),
                principal: principal.to_string(),
            });
        }
        session
    }

    /// End a session on its client's request. Unknown ids are a no-op.
    pub fn end_session(&self, id: &str) -> bool {
        let removed = self.inner.write().sessions.remove(id);
        match removed {
            Some(_) => {
                tracing::debug!(session = %id, "session closed");
                let _ = self.events_tx.send(SessionEvent::Ended {
                    id: id.to_string(),
                    reason: EndReason::Closed,
                });
                true
            }
            None => false,
        }
    }

    /// Drop every session. Called once at shutdown.
    pub fn clear(&self) {
        let drained: Vec<String> = {
            let mut inner = self.inner.write();
            inner.sessions.drain().map(|(id, _)| id).collect()
        };
        for id in drained {
            let _ = self.events_tx.send(SessionEvent::Ended {
                id,
                reason: EndReason::Shutdown,
            });
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().sessions.contains_key(id)
    }

    /// Describe every live session, sorted by id.
    pub fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read();
        let mut infos: Vec<SessionInfo> = inner
            .sessions
            .values()
            .map(|s| SessionInfo {
                id: s.id.clone(),
                principal: s.principal.clone(),
                idle_ms: s.idle().as_millis() as u64,
                pending: s.pending.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to session start/end events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}
