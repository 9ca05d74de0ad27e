//! Deferred registration of instance-method routes.
//!
//! Python can decorate an unbound instance method and defer registration
//! until an object of that class is constructed, binding `self` through a
//! descriptor and tracking which instances have already registered with a
//! `WeakSet`. Rust has neither descriptors nor weak references to arbitrary
//! owned data, so the same effect is built explicitly: a handler closure
//! that captures `Arc<T>` is prepared ahead of time, and `attach` performs
//! the registration once a concrete instance exists, deduping on the
//! instance's pointer identity instead of weak-reference membership.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::error::ConfigurationError;
use crate::route::{Predicate, RouteId, RouteRegistry, RouteSpec};

/// Builds a route whose handler is an instance method, deferring the bind
/// until [`attach`](Self::attach) is called with a concrete `Arc<T>`.
///
/// A single `RouteBinder` can be attached to many instances of `T`; each
/// distinct `Arc` pointer registers its own route exactly once.
pub struct RouteBinder<T: ?Sized> {
    predicate: Predicate,
    spec: RouteSpec,
    method: Arc<dyn Fn(Arc<T>, Envelope) -> anyhow::Result<Option<Envelope>> + Send + Sync>,
    registered: Mutex<Vec<usize>>,
}

impl<T: Send + Sync + 'static> RouteBinder<T> {
    /// `method` is the instance method to bind, e.g. `|this, envelope| this.handle(envelope)`.
    pub fn new<F>(predicate: Predicate, spec: RouteSpec, method: F) -> Self
    where
        F: Fn(Arc<T>, Envelope) -> anyhow::Result<Option<Envelope>> + Send + Sync + 'static,
    {
        Self {
            predicate,
            spec,
            method: Arc::new(method),
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Register this route against `registry`, bound to `instance`.
    ///
    /// A no-op (returns `Ok(None)`) if this exact `Arc` pointer has already
    /// been attached. Otherwise registers a handler closure that clones
    /// `instance` on every invocation, matching the original's per-instance
    /// bound method.
    pub fn attach(
        &self,
        registry: &RouteRegistry,
        instance: Arc<T>,
    ) -> Result<Option<RouteId>, ConfigurationError> {
        let ptr = Arc::as_ptr(&instance) as *const () as usize;
        {
            let mut registered = self.registered.lock();
            if registered.contains(&ptr) {
                return Ok(None);
            }
            registered.push(ptr);
        }

        let method = self.method.clone();
        let handler = crate::route::Handler::sync(move |envelope| method(instance.clone(), envelope));
        registry
            .add_route(self.predicate.clone(), handler, self.spec.clone())
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::Callable;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        calls: AtomicUsize,
    }

    impl Counter {
        fn handle(&self, envelope: Envelope) -> anyhow::Result<Option<Envelope>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(envelope))
        }
    }

    fn envelope() -> Envelope {
        Envelope::from_value(json!({"message_segment": {"type": "text", "data": "hi"}})).unwrap()
    }

    #[test]
    fn attach_registers_bound_instance_method() {
        let registry = RouteRegistry::new();
        let binder = RouteBinder::new(Callable::sync(|_| true), RouteSpec::new(), Counter::handle);
        let instance = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });

        let id = binder.attach(&registry, instance.clone()).unwrap();
        assert!(id.is_some());
    }

    #[test]
    fn attaching_the_same_instance_twice_is_a_no_op() {
        let registry = RouteRegistry::new();
        let binder = RouteBinder::new(Callable::sync(|_| true), RouteSpec::new(), Counter::handle);
        let instance = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });

        let first = binder.attach(&registry, instance.clone()).unwrap();
        let second = binder.attach(&registry, instance.clone()).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn bound_handler_invokes_the_attached_instance() {
        let registry = RouteRegistry::new();
        let binder = RouteBinder::new(Callable::sync(|_| true), RouteSpec::new(), Counter::handle);
        let instance = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });
        binder.attach(&registry, instance.clone()).unwrap();

        let matched = registry.find_match(&envelope()).await.unwrap();
        matched.handler.invoke_offloaded(envelope()).await.unwrap();
        assert_eq!(instance.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_instances_each_register_their_own_route() {
        let registry = RouteRegistry::new();
        let binder = RouteBinder::new(Callable::sync(|_| true), RouteSpec::new(), Counter::handle);
        let a = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });
        let b = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });

        assert!(binder.attach(&registry, a).unwrap().is_some());
        assert!(binder.attach(&registry, b).unwrap().is_some());
    }
}
