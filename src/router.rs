//! Outgoing-envelope router: one WebSocket client per configured platform,
//! live configuration reload, and auto-reconnect (§4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};
use url::Url;

use crate::envelope::Envelope;
use crate::error::{ConfigurationError, TransportError};
use crate::sink::OutgoingHandler;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// `{url, token?, ssl_verify?}` — one platform's remote target. `Option`
/// fields serialize as explicit JSON `null` when absent (serde's default
/// behavior for `Option`), matching the wire contract's round-trip
/// requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub url: String,
    pub token: Option<String>,
    pub ssl_verify: Option<SslVerify>,
}

/// `ssl_verify` may be a boolean toggle or a CA bundle path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SslVerify {
    Enabled(bool),
    CaBundle(String),
}

/// `{ route_config: { platform: TargetConfig } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub route_config: HashMap<String, TargetConfig>,
}

struct RouterClient {
    platform: String,
    url: String,
    token: Option<String>,
    handlers: Vec<OutgoingHandler>,
    ws: Mutex<Option<WsStream>>,
    closed: AtomicBool,
}

impl RouterClient {
    fn new(platform: String, target: &TargetConfig, handlers: Vec<OutgoingHandler>) -> Self {
        Self {
            platform,
            url: target.url.clone(),
            token: target.token.clone(),
            handlers,
            ws: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn dial(&self) -> anyhow::Result<WsStream> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = format!("Bearer {token}");
            request
                .headers_mut()
                .insert(axum::http::header::AUTHORIZATION, axum::http::HeaderValue::try_from(value)?);
        }
        let (stream, _response) = connect_async(request).await?;
        Ok(stream)
    }

    /// Supervisor loop: connect, hold the stream open, reconnect on
    /// disconnect with a fixed backoff until `stop` is called. Unlike the
    /// adapter's intake supervisor this client never reads frames; it only
    /// needs the stream held open so `send` has somewhere to write.
    async fn run(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            match self.dial().await {
                Ok(stream) => {
                    info!(platform = %self.platform, url = %self.url, "router client connected");
                    *self.ws.lock().await = Some(stream);
                    // Hold the connection until it's torn down by `stop`
                    // or the reconnect loop decides to re-dial (detected
                    // lazily: the next `send` failure clears the handle).
                    while self.ws.lock().await.is_some() && !self.closed.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
                Err(e) => {
                    warn!(platform = %self.platform, error = %e, "router client dial failed");
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let mut guard = self.ws.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(TransportError::NotConnected.into());
        };
        let frame = serde_json::json!({"type": "send", "payload": envelope});
        let text = serde_json::to_string(&frame)?;
        if let Err(e) = stream.send(WsMessage::Text(text.into())).await {
            *guard = None;
            return Err(TransportError::SendFailed(e.into()).into());
        }
        Ok(())
    }

    async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ws.lock().await.take();
    }
}

/// Dispatches outgoing envelopes to the remote adapter client registered
/// for `envelope.message_info.platform`, and reconciles live
/// configuration changes by diffing against the previously installed
/// [`RouteConfig`].
pub struct Router {
    config: ArcSwap<RouteConfig>,
    clients: RwLock<HashMap<String, Arc<RouterClient>>>,
    client_tasks: RwLock<HashMap<String, JoinHandle<()>>>,
    handlers: RwLock<Vec<OutgoingHandler>>,
    running: AtomicBool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            config: ArcSwap::from_pointee(RouteConfig::default()),
            clients: RwLock::new(HashMap::new()),
            client_tasks: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            running: AtomicBool::new(true),
        }
    }

    pub fn with_config(config: RouteConfig) -> Self {
        let router = Self::new();
        router.config.store(Arc::new(config));
        router
    }

    /// Attaches `handler` to the forwarding list every subsequently
    /// `connect`ed client receives a clone of at construction time. Per
    /// §9's open question, this crate infers no routing semantics beyond
    /// "every connected client gets a copy of this list".
    pub async fn register_handler(&self, handler: OutgoingHandler) {
        self.handlers.write().await.push(handler);
    }

    pub fn get_target_url(&self, envelope: &Envelope) -> Option<String> {
        let platform = envelope.platform()?;
        self.config.load().route_config.get(platform).map(|t| t.url.clone())
    }

    /// Dials the configured target for `platform` and stores the client
    /// and its supervisor task. Fails fast on an unknown platform or an
    /// unsupported (`tcp`) URL scheme without starting anything.
    pub async fn connect(&self, platform: &str) -> anyhow::Result<()> {
        let target = self
            .config
            .load()
            .route_config
            .get(platform)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownPlatform(platform.to_string()))?;

        if let Ok(url) = Url::parse(&target.url) {
            if url.scheme() == "tcp" {
                return Err(ConfigurationError::UnsupportedScheme.into());
            }
        }

        let handlers = self.handlers.read().await.clone();
        let client = Arc::new(RouterClient::new(platform.to_string(), &target, handlers));
        let task = tokio::spawn(client.clone().run());

        self.clients.write().await.insert(platform.to_string(), client);
        self.client_tasks.write().await.insert(platform.to_string(), task);
        Ok(())
    }

    /// Requires `envelope.message_info.platform`; fails if no client is
    /// connected for that platform.
    pub async fn send_message(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let platform = envelope
            .platform()
            .ok_or(ConfigurationError::MissingPlatform)?;
        let client = self.clients.read().await.get(platform).cloned();
        let client = client.ok_or_else(|| TransportError::NoClient(platform.to_string()))?;
        client.send(envelope).await
    }

    /// Cancels `platform`'s supervisor task, awaits its cancellation,
    /// stops the client, and removes both entries. A no-op for an
    /// already-absent platform.
    pub async fn remove_platform(&self, platform: &str) {
        if let Some(task) = self.client_tasks.write().await.remove(platform) {
            task.abort();
            let _ = task.await;
        }
        if let Some(client) = self.clients.write().await.remove(platform) {
            client.stop().await;
        }
    }

    /// Diffs `new_config` against the installed configuration: removed
    /// and changed platforms are torn down first, the new configuration
    /// is installed, then added and changed platforms are (re)connected.
    pub async fn update_config(&self, new_config: serde_json::Value) -> anyhow::Result<()> {
        let new_config: RouteConfig = serde_json::from_value(new_config)?;
        let old_config = self.config.load();

        let mut removed = Vec::new();
        let mut changed = Vec::new();
        let mut added = Vec::new();

        for (platform, old_target) in &old_config.route_config {
            match new_config.route_config.get(platform) {
                None => removed.push(platform.clone()),
                Some(new_target) if new_target.url != old_target.url => changed.push(platform.clone()),
                Some(_) => {}
            }
        }
        for platform in new_config.route_config.keys() {
            if !old_config.route_config.contains_key(platform) {
                added.push(platform.clone());
            }
        }

        for platform in removed.iter().chain(changed.iter()) {
            self.remove_platform(platform).await;
        }

        self.config.store(Arc::new(new_config));

        for platform in added.iter().chain(changed.iter()) {
            if let Err(e) = self.connect(platform).await {
                error!(platform = %platform, error = %e, "failed to connect after config reload");
            }
        }

        Ok(())
    }

    /// Removes every connected platform, clears state, marks not running.
    /// Idempotent: calling twice leaves `clients` empty and `running`
    /// false both times.
    pub async fn stop(&self) {
        let platforms: Vec<String> = self.clients.read().await.keys().cloned().collect();
        for platform in platforms {
            self.remove_platform(&platform).await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(url: &str) -> TargetConfig {
        TargetConfig {
            url: url.to_string(),
            token: None,
            ssl_verify: None,
        }
    }

    #[test]
    fn target_config_round_trips_through_json() {
        let t = TargetConfig {
            url: "ws://a:8080".to_string(),
            token: Some("secret".to_string()),
            ssl_verify: Some(SslVerify::Enabled(false)),
        };
        let value = serde_json::to_value(&t).unwrap();
        let back: TargetConfig = serde_json::from_value(value).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn target_config_round_trips_absent_fields_as_null() {
        let t = target("ws://a:8080");
        let value = serde_json::to_value(&t).unwrap();
        assert_eq!(value["token"], json!(null));
        assert_eq!(value["ssl_verify"], json!(null));
        let back: TargetConfig = serde_json::from_value(value).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn route_config_round_trips() {
        let mut route_config = HashMap::new();
        route_config.insert("a".to_string(), target("ws://a:8080"));
        let config = RouteConfig { route_config };
        let value = serde_json::to_value(&config).unwrap();
        let back: RouteConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config, back);
    }

    #[tokio::test]
    async fn connect_fails_for_unknown_platform() {
        let router = Router::new();
        let err = router.connect("ghost").await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn connect_rejects_tcp_scheme() {
        let mut route_config = HashMap::new();
        route_config.insert("a".to_string(), target("tcp://a:8080"));
        let router = Router::with_config(RouteConfig { route_config });
        let err = router.connect("a").await.unwrap_err();
        assert!(err.to_string().contains("tcp"));
    }

    #[tokio::test]
    async fn send_message_requires_platform_field() {
        let router = Router::new();
        let envelope = Envelope::from_value(json!({"id": "1"})).unwrap();
        let err = router.send_message(&envelope).await.unwrap_err();
        assert!(err.to_string().contains("platform"));
    }

    #[tokio::test]
    async fn send_message_fails_without_a_connected_client() {
        let mut route_config = HashMap::new();
        route_config.insert("a".to_string(), target("ws://127.0.0.1:1"));
        let router = Router::with_config(RouteConfig { route_config });
        let envelope = Envelope::from_value(json!({"message_info": {"platform": "b"}})).unwrap();
        let err = router.send_message(&envelope).await.unwrap_err();
        assert!(err.to_string().contains("no client"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let router = Router::new();
        router.stop().await;
        router.stop().await;
        assert_eq!(router.client_count().await, 0);
        assert!(!router.is_running());
    }

    #[tokio::test]
    async fn remove_platform_is_a_no_op_for_absent_platform() {
        let router = Router::new();
        router.remove_platform("ghost").await;
        assert_eq!(router.client_count().await, 0);
    }

    fn route_config(entries: &[(&str, &str)]) -> serde_json::Value {
        let mut route_config = serde_json::Map::new();
        for (platform, url) in entries {
            route_config.insert(
                platform.to_string(),
                json!({"url": url, "token": null, "ssl_verify": null}),
            );
        }
        json!({"route_config": route_config})
    }

    #[tokio::test]
    async fn update_config_connects_only_added_platforms() {
        // Start with "a" configured and already connected (mirrors the
        // scenario's starting state); "a" is unchanged by the reload below,
        // so it must be left alone while "b" is newly connected.
        let router = Router::with_config(RouteConfig {
            route_config: HashMap::from([("a".to_string(), target("ws://a:8080"))]),
        });
        router.connect("a").await.unwrap();

        router
            .update_config(route_config(&[("a", "ws://a:8080"), ("b", "ws://b:8080")]))
            .await
            .unwrap();

        assert_eq!(router.client_count().await, 2);
        assert!(router.clients.read().await.contains_key("a"));
        assert!(router.clients.read().await.contains_key("b"));
    }

    #[tokio::test]
    async fn update_config_reconnects_changed_platforms_and_drops_removed_ones() {
        let router = Router::with_config(RouteConfig {
            route_config: HashMap::from([
                ("a".to_string(), target("ws://a:8080")),
                ("b".to_string(), target("ws://b:8080")),
            ]),
        });
        router.connect("a").await.unwrap();
        router.connect("b").await.unwrap();
        assert_eq!(router.client_count().await, 2);

        router
            .update_config(route_config(&[("a", "ws://new-a:9000")]))
            .await
            .unwrap();

        let clients = router.clients.read().await;
        assert_eq!(clients.len(), 1);
        assert!(clients.contains_key("a"));
        assert!(!clients.contains_key("b"));
        assert_eq!(clients.get("a").unwrap().url, "ws://new-a:9000");
    }
}
