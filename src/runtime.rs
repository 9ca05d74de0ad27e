//! Dispatches a single envelope through hooks, route matching, and the
//! onion-model middleware chain.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;

use crate::callable::{BoxFuture, Callable};
use crate::envelope::Envelope;
use crate::error::{ConfigurationError, ProcessingError};
use crate::route::{Handler, Predicate, RouteId, RouteRegistry, RouteSpec};

pub type Hook = Callable<Envelope, ()>;
pub type ErrorHook = Callable<(Envelope, Arc<str>), ()>;
pub type BatchHandler = Callable<Vec<Envelope>, anyhow::Result<Vec<Envelope>>>;

/// A handler wrapped by zero or more middleware layers: given an envelope,
/// produces the (possibly transformed) response.
pub type Next = Arc<dyn Fn(Envelope) -> BoxFuture<'static, anyhow::Result<Option<Envelope>>> + Send + Sync>;

/// A middleware layer. Receives the envelope and the next link in the
/// chain; it decides whether, when, and with what envelope to call `next`.
pub type Middleware =
    Arc<dyn Fn(Envelope, Next) -> BoxFuture<'static, anyhow::Result<Option<Envelope>>> + Send + Sync>;

/// Dispatches envelopes to registered routes, running before/after/error
/// hooks around the matched route's handler and wrapping the handler in
/// the registered middleware chain.
///
/// Route matching and hook/middleware registries are held under
/// `parking_lot::RwLock`s that are never held across an `.await` point:
/// every dispatch snapshots what it needs, releases the lock, then awaits.
pub struct MessageRuntime {
    routes: RouteRegistry,
    before_hooks: RwLock<Vec<Hook>>,
    after_hooks: RwLock<Vec<Hook>>,
    error_hooks: RwLock<Vec<ErrorHook>>,
    middlewares: RwLock<Vec<Middleware>>,
    batch_handler: RwLock<Option<BatchHandler>>,
}

impl Default for MessageRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRuntime {
    pub fn new() -> Self {
        Self {
            routes: RouteRegistry::new(),
            before_hooks: RwLock::new(Vec::new()),
            after_hooks: RwLock::new(Vec::new()),
            error_hooks: RwLock::new(Vec::new()),
            middlewares: RwLock::new(Vec::new()),
            batch_handler: RwLock::new(None),
        }
    }

    pub fn add_route(
        &self,
        predicate: Predicate,
        handler: Handler,
        spec: RouteSpec,
    ) -> Result<RouteId, ConfigurationError> {
        self.routes.add_route(predicate, handler, spec)
    }

    pub fn register_before_hook(&self, hook: Hook) {
        self.before_hooks.write().push(hook);
    }

    pub fn register_after_hook(&self, hook: Hook) {
        self.after_hooks.write().push(hook);
    }

    pub fn register_error_hook(&self, hook: ErrorHook) {
        self.error_hooks.write().push(hook);
    }

    /// Register a middleware layer. Layers wrap the handler in reverse
    /// registration order, so the first layer registered is outermost and
    /// runs first on the way in, last on the way out.
    pub fn register_middleware(&self, middleware: Middleware) {
        self.middlewares.write().push(middleware);
    }

    pub fn set_batch_handler(&self, handler: BatchHandler) {
        *self.batch_handler.write() = Some(handler);
    }

    /// Run a single envelope through before-hooks, route matching and the
    /// middleware-wrapped handler, and after-hooks. On failure, runs error
    /// hooks and returns a [`ProcessingError`] wrapping the underlying
    /// cause.
    pub async fn handle_message(&self, message: Envelope) -> Result<Option<Envelope>, ProcessingError> {
        let before = self.before_hooks.read().clone();
        self.run_hooks(before, message.clone()).await;

        match self.dispatch(message.clone()).await {
            // No route matched: return absent without running after-hooks,
            // distinct from a matched route whose handler legitimately
            // returned `None`.
            Ok(None) => Ok(None),
            Ok(Some(response)) => {
                let after = self.after_hooks.read().clone();
                self.run_hooks(after, message).await;
                Ok(response)
            }
            Err(source) => {
                self.run_error_hooks(message.clone(), &source).await;
                Err(ProcessingError::new(message, source))
            }
        }
    }

    /// Run a batch of envelopes. Delegates to a registered batch handler
    /// if one is set; otherwise falls back to dispatching each envelope
    /// through [`Self::handle_message`] in order, collecting the non-`None`
    /// responses.
    pub async fn handle_batch(&self, messages: Vec<Envelope>) -> anyhow::Result<Vec<Envelope>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let batch_handler = self.batch_handler.read().clone();
        if let Some(handler) = batch_handler {
            return handler.invoke_offloaded_fallible(messages).await;
        }
        let mut responses = Vec::with_capacity(messages.len());
        for message in messages {
            if let Some(response) = self.handle_message(message).await? {
                responses.push(response);
            }
        }
        Ok(responses)
    }

    /// Returns `Ok(None)` when no route matched, `Ok(Some(response))` when a
    /// route matched and its (possibly-`None`) response is `response`, or
    /// `Err` if the middleware/handler chain raised. The outer `Option`
    /// carries "did a route match" separately from the handler's own
    /// `Option<Envelope>` return value so callers can tell the two apart.
    async fn dispatch(&self, message: Envelope) -> anyhow::Result<Option<Option<Envelope>>> {
        let route = self.routes.find_match(&message).await;
        let Some(route) = route else {
            return Ok(None);
        };
        let next = self.wrap_with_middlewares(route.handler.clone());
        (*next)(message).await.map(Some)
    }

    fn wrap_with_middlewares(&self, handler: Handler) -> Next {
        let base: Next = Arc::new(move |message: Envelope| {
            let handler = handler.clone();
            Box::pin(async move { handler.invoke_offloaded_fallible(message).await })
        });

        let middlewares = self.middlewares.read().clone();
        middlewares.into_iter().rev().fold(base, |next, middleware| {
            let next = next.clone();
            Arc::new(move |message: Envelope| {
                let middleware = middleware.clone();
                let next = next.clone();
                Box::pin(async move { (*middleware)(message, next).await })
            })
        })
    }

    async fn run_hooks(&self, hooks: Vec<Hook>, message: Envelope) {
        if hooks.is_empty() {
            return;
        }
        let futures = hooks.into_iter().map(|hook| {
            let message = message.clone();
            async move { hook.invoke_offloaded(message).await }
        });
        join_all(futures).await;
    }

    async fn run_error_hooks(&self, message: Envelope, error: &anyhow::Error) {
        let hooks = self.error_hooks.read().clone();
        if hooks.is_empty() {
            return;
        }
        let detail: Arc<str> = Arc::from(error.to_string());
        let futures = hooks.into_iter().map(|hook| {
            let detail = detail.clone();
            let message = message.clone();
            async move { hook.invoke_offloaded((message, detail)).await }
        });
        join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callable::Callable;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn text_envelope() -> Envelope {
        Envelope::from_value(json!({
            "message_segment": {"type": "text", "data": "hi"},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn handle_message_runs_before_and_after_hooks() {
        let runtime = MessageRuntime::new();
        let before_count = Arc::new(AtomicUsize::new(0));
        let after_count = Arc::new(AtomicUsize::new(0));

        let before_count2 = before_count.clone();
        runtime.register_before_hook(Callable::sync(move |_| {
            before_count2.fetch_add(1, Ordering::SeqCst);
        }));
        let after_count2 = after_count.clone();
        runtime.register_after_hook(Callable::sync(move |_| {
            after_count2.fetch_add(1, Ordering::SeqCst);
        }));

        runtime
            .add_route(
                Callable::sync(|_| true),
                Callable::sync(|env| Ok(Some(env))),
                RouteSpec::new(),
            )
            .unwrap();

        let response = runtime.handle_message(text_envelope()).await.unwrap();
        assert!(response.is_some());
        assert_eq!(before_count.load(Ordering::SeqCst), 1);
        assert_eq!(after_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn middlewares_wrap_in_onion_order() {
        let runtime = MessageRuntime::new();
        let trace = Arc::new(Mutex::new(Vec::new()));

        for label in ["outer", "inner"] {
            let trace = trace.clone();
            let middleware: Middleware = Arc::new(move |message: Envelope, next: Next| {
                let trace = trace.clone();
                Box::pin(async move {
                    trace.lock().unwrap().push(format!("{label}:in"));
                    let result = (*next)(message).await;
                    trace.lock().unwrap().push(format!("{label}:out"));
                    result
                })
            });
            runtime.register_middleware(middleware);
        }

        runtime
            .add_route(
                Callable::sync(|_| true),
                Callable::sync(|env| Ok(Some(env))),
                RouteSpec::new(),
            )
            .unwrap();

        runtime.handle_message(text_envelope()).await.unwrap();

        let trace = trace.lock().unwrap().clone();
        assert_eq!(trace, vec!["outer:in", "inner:in", "inner:out", "outer:out"]);
    }

    #[tokio::test]
    async fn handler_error_runs_error_hooks_and_wraps_cause() {
        let runtime = MessageRuntime::new();
        let seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();

        runtime.register_error_hook(Callable::sync(move |(_, detail): (Envelope, Arc<str>)| {
            *seen2.lock().unwrap() = Some(detail.to_string());
        }));

        runtime
            .add_route(
                Callable::sync(|_| true),
                Callable::sync(|_| Err(anyhow::anyhow!("boom"))),
                RouteSpec::new(),
            )
            .unwrap();

        let err = runtime.handle_message(text_envelope()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(seen.lock().unwrap().as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn no_matching_route_returns_none() {
        let runtime = MessageRuntime::new();
        let response = runtime.handle_message(text_envelope()).await.unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn no_matching_route_skips_after_hooks() {
        let runtime = MessageRuntime::new();
        let after_count = Arc::new(AtomicUsize::new(0));
        let after_count2 = after_count.clone();
        runtime.register_after_hook(Callable::sync(move |_| {
            after_count2.fetch_add(1, Ordering::SeqCst);
        }));

        let response = runtime.handle_message(text_envelope()).await.unwrap();
        assert!(response.is_none());
        assert_eq!(after_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn matched_handler_returning_none_still_runs_after_hooks() {
        let runtime = MessageRuntime::new();
        let after_count = Arc::new(AtomicUsize::new(0));
        let after_count2 = after_count.clone();
        runtime.register_after_hook(Callable::sync(move |_| {
            after_count2.fetch_add(1, Ordering::SeqCst);
        }));

        runtime
            .add_route(Callable::sync(|_| true), Callable::sync(|_| Ok(None)), RouteSpec::new())
            .unwrap();

        let response = runtime.handle_message(text_envelope()).await.unwrap();
        assert!(response.is_none());
        assert_eq!(after_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handle_batch_falls_back_to_per_message_dispatch() {
        let runtime = MessageRuntime::new();
        runtime
            .add_route(
                Callable::sync(|_| true),
                Callable::sync(|env| Ok(Some(env))),
                RouteSpec::new(),
            )
            .unwrap();

        let messages = vec![text_envelope(), text_envelope()];
        let responses = runtime.handle_batch(messages).await.unwrap();
        assert_eq!(responses.len(), 2);
    }

    #[tokio::test]
    async fn handle_batch_uses_registered_batch_handler() {
        let runtime = MessageRuntime::new();
        runtime.set_batch_handler(Callable::sync(|messages: Vec<Envelope>| Ok(messages)));

        let messages = vec![text_envelope()];
        let responses = runtime.handle_batch(messages).await.unwrap();
        assert_eq!(responses.len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_short_circuits() {
        let runtime = MessageRuntime::new();
        let responses = runtime.handle_batch(Vec::new()).await.unwrap();
        assert!(responses.is_empty());
    }
}
