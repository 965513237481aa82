use std::sync::Arc;

use crate::session::SessionRegistry;
use crate::tag::{Tag, TagParseError};

/// Callback the simulation invokes whenever a category of its state changes.
///
/// Producers only see this type, never the registry behind it.
pub type ChangeListener = Arc<dyn Fn(Tag) + Send + Sync>;

/// Producer-facing side of the session registry.
///
/// Any thread may announce. Announcing the same tag repeatedly before a
/// session polls coalesces into a single pending entry for that session.
#[derive(Clone)]
pub struct DirtyTagBus {
    registry: SessionRegistry,
}

impl DirtyTagBus {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Mark `tag` dirty for every live session. Returns how many were marked.
    pub fn announce(&self, tag: impl Into<Tag>) -> usize {
        self.registry.announce(&tag.into())
    }

    /// Parse a wire-form tag and announce it.
    pub fn announce_str(&self, tag: &str) -> Result<usize, TagParseError> {
        let tag: Tag = tag.parse()?;
        Ok(self.registry.announce(&tag))
    }

    /// A listener closure bound to this bus, for
    /// [`World::register_change_listener`](crate::sim::World::register_change_listener).
    pub fn listener(&self) -> ChangeListener {
        let registry = self.registry.clone();
        Arc::new(move |tag: Tag| {
            registry.announce(&tag);
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::ResolverTable;
    use crate::session::SessionConfig;
    use crate::tag::GlobalKind;
    use std::time::Duration;

    fn bus() -> DirtyTagBus {
        DirtyTagBus::new(SessionRegistry::new(
            SessionConfig {
                session_timeout: Duration::from_secs(60),
                long_poll_timeout: Duration::from_millis(30),
            },
            ResolverTable::new(),
        ))
    }

    #[tokio::test]
    async fn announce_str_parses_wire_form() {
        let bus = bus();
        bus.registry().pending("s1", "").await.unwrap();

        assert_eq!(bus.announce_str("trainset-4"), Ok(1));
        let tags = bus.registry().pending("s1", "").await.unwrap();
        assert!(tags.contains(&Tag::trainset(4)));
    }

    #[test]
    fn announce_str_rejects_garbage() {
        let bus = bus();
        assert_eq!(
            bus.announce_str("wagon-1"),
            Err(TagParseError::UnknownPrefix("wagon".into()))
        );
    }

    #[tokio::test]
    async fn listener_feeds_the_registry() {
        let bus = bus();
        bus.registry().pending("s1", "").await.unwrap();

        let listener = bus.listener();
        std::thread::spawn(move || listener(Tag::Global(GlobalKind::Junctions)))
            .join()
            .unwrap();

        let tags = bus.registry().pending("s1", "").await.unwrap();
        assert_eq!(tags.len(), 1);
        assert!(tags.contains(&Tag::Global(GlobalKind::Junctions)));
    }
}
