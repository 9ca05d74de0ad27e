//! Route registry and matcher.
//!
//! Routes are held in three views: an insertion-ordered list (`all_routes`),
//! a type-keyed index (`by_type`), and an event-keyed index (`by_event`).
//! Mutation and matcher snapshots share a single `parking_lot::RwLock`; the
//! matcher always releases the lock before awaiting a predicate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::callable::Callable;
use crate::envelope::Envelope;
use crate::error::ConfigurationError;

pub type Predicate = Callable<Envelope, bool>;
pub type Handler = Callable<Envelope, anyhow::Result<Option<Envelope>>>;

/// Stable identity used to dedup a route across the priority and generic
/// candidate lists during matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(u64);

/// Declarative scoping for a route: a display name plus the message-type
/// and event-type sets that make a route explicit rather than generic.
#[derive(Debug, Clone, Default)]
pub struct RouteSpec {
    name: Option<String>,
    message_types: Option<HashSet<String>>,
    event_types: Option<HashSet<String>>,
}

impl RouteSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_types
            .get_or_insert_with(HashSet::new)
            .insert(message_type.into());
        self
    }

    pub fn message_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = self.message_types.get_or_insert_with(HashSet::new);
        set.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types
            .get_or_insert_with(HashSet::new)
            .insert(event_type.into());
        self
    }

    pub fn event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = self.event_types.get_or_insert_with(HashSet::new);
        set.extend(types.into_iter().map(Into::into));
        self
    }

    fn display_name(&self, route_id: RouteId) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("route#{}", route_id.0))
    }
}

pub struct Route {
    pub id: RouteId,
    pub predicate: Predicate,
    pub handler: Handler,
    pub name: Option<String>,
    pub message_types: Option<HashSet<String>>,
    pub event_types: Option<HashSet<String>>,
}

impl Route {
    /// A route is explicit when it carries a non-empty `message_types` or
    /// `event_types` set; generic otherwise.
    fn is_generic(&self) -> bool {
        self.message_types.as_ref().map_or(true, HashSet::is_empty)
            && self.event_types.as_ref().map_or(true, HashSet::is_empty)
    }
}

#[derive(Default)]
struct Indices {
    all_routes: Vec<Arc<Route>>,
    by_type: HashMap<String, Vec<Arc<Route>>>,
    by_event: HashMap<String, Vec<Arc<Route>>>,
    explicit_owners: HashMap<String, String>,
}

/// Holds every registered route and the indices used to match them.
pub struct RouteRegistry {
    indices: RwLock<Indices>,
    next_id: AtomicU64,
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a route. Fails without mutating any index if `spec` claims
    /// an explicit message type already owned by another handler.
    pub fn add_route(
        &self,
        predicate: Predicate,
        handler: Handler,
        spec: RouteSpec,
    ) -> Result<RouteId, ConfigurationError> {
        let id = RouteId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let display_name = spec.display_name(id);

        let mut indices = self.indices.write();

        if let Some(types) = &spec.message_types {
            for message_type in types {
                if let Some(existing) = indices.explicit_owners.get(message_type) {
                    return Err(ConfigurationError::DuplicateMessageType {
                        message_type: message_type.clone(),
                        existing: existing.clone(),
                    });
                }
            }
            for message_type in types {
                indices
                    .explicit_owners
                    .insert(message_type.clone(), display_name.clone());
            }
        }

        let route = Arc::new(Route {
            id,
            predicate,
            handler,
            name: spec.name,
            message_types: spec.message_types,
            event_types: spec.event_types,
        });

        indices.all_routes.push(route.clone());
        if let Some(types) = &route.message_types {
            for message_type in types {
                indices
                    .by_type
                    .entry(message_type.clone())
                    .or_default()
                    .push(route.clone());
            }
        }
        if let Some(events) = &route.event_types {
            for event_type in events {
                indices
                    .by_event
                    .entry(event_type.clone())
                    .or_default()
                    .push(route.clone());
            }
        }

        Ok(id)
    }

    /// Match `envelope` against registered routes: routes keyed to its
    /// event type or segment type are tried first, then generic catch-all
    /// routes, in registration order within each tier. Snapshots the
    /// candidate lists under the read lock, then releases it before
    /// awaiting any predicate.
    pub async fn find_match(&self, envelope: &Envelope) -> Option<Arc<Route>> {
        let segment_type = envelope.segment_type();
        let event_type = envelope.event_type();

        let (priority, generic) = {
            let indices = self.indices.read();
            let mut priority = Vec::new();
            if let Some(event_type) = event_type {
                if let Some(routes) = indices.by_event.get(event_type) {
                    priority.extend(routes.iter().cloned());
                }
            }
            if let Some(segment_type) = segment_type {
                if let Some(routes) = indices.by_type.get(segment_type) {
                    priority.extend(routes.iter().cloned());
                }
            }
            let generic = indices
                .all_routes
                .iter()
                .filter(|route| route.is_generic())
                .cloned()
                .collect::<Vec<_>>();
            (priority, generic)
        };

        let mut seen = HashSet::new();
        for route in priority.into_iter().chain(generic) {
            if !seen.insert(route.id) {
                continue;
            }
            if route.predicate.invoke_inline(envelope.clone()).await {
                return Some(route);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_envelope(platform: &str) -> Envelope {
        Envelope::from_value(json!({
            "message_segment": {"type": "text", "data": "hi"},
            "message_info": {"platform": platform},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn explicit_type_route_matches_text_envelope() {
        let registry = RouteRegistry::new();
        registry
            .add_route(
                Callable::sync(|_| true),
                Callable::sync(|env| Ok(Some(env))),
                RouteSpec::new().message_type("text"),
            )
            .unwrap();

        let matched = registry.find_match(&text_envelope("qq")).await;
        assert!(matched.is_some());
    }

    #[tokio::test]
    async fn duplicate_explicit_message_type_is_rejected() {
        let registry = RouteRegistry::new();
        registry
            .add_route(
                Callable::sync(|_| true),
                Callable::sync(|env| Ok(Some(env))),
                RouteSpec::new().name("first").message_type("text"),
            )
            .unwrap();

        let err = registry
            .add_route(
                Callable::sync(|_| true),
                Callable::sync(|env| Ok(Some(env))),
                RouteSpec::new().name("second").message_type("text"),
            )
            .unwrap_err();

        match err {
            ConfigurationError::DuplicateMessageType { existing, .. } => {
                assert_eq!(existing, "first");
            }
            other => panic!("expected DuplicateMessageType, got {other:?}"),
        }

        // Registry unchanged: a fresh match still goes to the first handler.
        let indices = registry.indices.read();
        assert_eq!(indices.all_routes.len(), 1);
    }

    #[tokio::test]
    async fn explicit_route_shadows_generic_catch_all() {
        let registry = RouteRegistry::new();
        registry
            .add_route(Callable::sync(|_| true), Callable::sync(|_| Ok(None)), RouteSpec::new())
            .unwrap();
        let explicit_id = registry
            .add_route(
                Callable::sync(|_| true),
                Callable::sync(|env| Ok(Some(env))),
                RouteSpec::new().message_type("text"),
            )
            .unwrap();

        let matched = registry.find_match(&text_envelope("qq")).await.unwrap();
        assert_eq!(matched.id, explicit_id);
    }

    #[tokio::test]
    async fn falls_through_to_generic_when_no_priority_candidate_matches() {
        let registry = RouteRegistry::new();
        registry
            .add_route(
                Callable::sync(|_| false),
                Callable::sync(|_| Ok(None)),
                RouteSpec::new().message_type("text"),
            )
            .unwrap();
        let generic_id = registry
            .add_route(Callable::sync(|_| true), Callable::sync(|env| Ok(Some(env))), RouteSpec::new())
            .unwrap();

        let matched = registry.find_match(&text_envelope("qq")).await.unwrap();
        assert_eq!(matched.id, generic_id);
    }

    #[tokio::test]
    async fn no_match_returns_none() {
        let registry = RouteRegistry::new();
        registry
            .add_route(
                Callable::sync(|_| false),
                Callable::sync(|_| Ok(None)),
                RouteSpec::new(),
            )
            .unwrap();
        assert!(registry.find_match(&text_envelope("qq")).await.is_none());
    }
}
