use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;

use crate::tag::{GlobalKind, KeyedKind, Tag};

type GlobalResolver = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type KeyedResolver = Arc<dyn Fn(Arc<str>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// No resolver was registered for this tag's kind. This is a wiring bug
    /// between producers and the resolver table, never a transient condition.
    #[error("no resolver registered for tag {0}")]
    Unregistered(Tag),

    #[error("resolver for tag {tag} failed: {source}")]
    Failed {
        tag: Tag,
        #[source]
        source: anyhow::Error,
    },
}

/// Maps each tag to the function that produces its current payload.
///
/// Global kinds map to zero-argument resolvers, keyed kinds to resolvers that
/// receive the entity id. Resolvers run on whichever task is polling; any that
/// need simulation state route through the main-thread executor themselves.
#[derive(Clone, Default)]
pub struct ResolverTable {
    globals: HashMap<GlobalKind, GlobalResolver>,
    keyed: HashMap<KeyedKind, KeyedResolver>,
}

impl ResolverTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the resolver for a global kind, replacing any previous one.
    pub fn global<F, Fut>(mut self, kind: GlobalKind, resolver: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.globals
            .insert(kind, Arc::new(move || resolver().boxed()));
        self
    }

    /// Register the resolver for a keyed kind, replacing any previous one.
    pub fn keyed<F, Fut>(mut self, kind: KeyedKind, resolver: F) -> Self
    where
        F: Fn(Arc<str>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.keyed
            .insert(kind, Arc::new(move |id| resolver(id).boxed()));
        self
    }

    /// True if every global kind has a resolver.
    pub fn covers_all_globals(&self) -> bool {
        GlobalKind::ALL.iter().all(|k| self.globals.contains_key(k))
    }

    pub fn covers(&self, tag: &Tag) -> bool {
        match tag {
            Tag::Global(kind) => self.globals.contains_key(kind),
            Tag::Keyed(kind, _) => self.keyed.contains_key(kind),
        }
    }

    /// Produce the current payload for `tag`.
    pub async fn resolve(&self, tag: &Tag) -> Result<Value, ResolveError> {
        let fut = match tag {
            Tag::Global(kind) => self.globals.get(kind).map(|r| r()),
            Tag::Keyed(kind, id) => self.keyed.get(kind).map(|r| r(id.clone())),
        };
        let fut = fut.ok_or_else(|| ResolveError::Unregistered(tag.clone()))?;
        fut.await.map_err(|source| ResolveError::Failed {
            tag: tag.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for ResolverTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut globals: Vec<_> = self.globals.keys().collect();
        globals.sort();
        let mut keyed: Vec<_> = self.keyed.keys().collect();
        keyed.sort();
        f.debug_struct("ResolverTable")
            .field("globals", &globals)
            .field("keyed", &keyed)
            .finish()
    }
}
