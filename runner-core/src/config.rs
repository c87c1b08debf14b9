use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
	actor::{ActorConfig, ActorHandle, ActorStartOutcome, ActorStopOutcome},
	tunnel::Tunnel,
};

/// An inbound HTTP request the Tunnel is routing to an actor. Opaque at
/// the byte level, the same way KV keys/values are — the Runner Core
/// never interprets a request body or header, it only checks the actor
/// is registered before handing the request to `fetch`.
#[derive(Debug, Clone)]
pub struct FetchRequest {
	pub method: String,
	pub path: String,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

/// An upgraded WebSocket connection the Tunnel is routing to an actor,
/// represented as a plain framed duplex rather than any concrete
/// transport type — the Tunnel owns the real socket and this crate never
/// touches it directly.
pub struct WebSocketConn {
	pub to_actor: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
	pub from_actor: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
}

/// The host-supplied lifecycle and traffic callbacks (spec §6). Every
/// method is invoked outside the core's serialized execution context
/// (spec §5 "suspension points") — their completion is posted back as a
/// message, never observed synchronously by the core.
#[async_trait]
pub trait RunnerCallbacks: Send + Sync + 'static {
	async fn on_connected(&self) {}
	async fn on_disconnected(&self) {}
	async fn on_shutdown(&self) {}

	async fn on_actor_start(
		&self,
		config: ActorConfig,
		handle: ActorHandle,
	) -> anyhow::Result<ActorStartOutcome>;

	async fn on_actor_stop(
		&self,
		actor_id: &str,
		generation: u32,
	) -> anyhow::Result<ActorStopOutcome>;

	async fn fetch(
		&self,
		actor_id: &str,
		generation: u32,
		req: FetchRequest,
	) -> anyhow::Result<FetchResponse>;

	async fn websocket(&self, actor_id: &str, generation: u32, conn: WebSocketConn) -> anyhow::Result<()> {
		let _ = (actor_id, generation, conn);
		Ok(())
	}
}

#[derive(Debug, Clone)]
pub struct PrepopulateActor {
	/// JSON-encoded, opaque to the core.
	pub metadata: String,
}

/// Runner configuration (spec §6 "Runner configuration"). No CLI, no
/// persisted state, no environment variables consumed — every field is a
/// plain value or callback the host passes in.
pub struct RunnerConfig {
	pub endpoint: String,
	pub pegboard_endpoint: Option<String>,
	pub pegboard_relay_endpoint: Option<String>,

	pub version: u32,
	pub namespace: String,
	pub runner_name: String,
	pub runner_key: String,
	pub total_slots: u32,
	pub prepopulate_actor_names: HashMap<String, PrepopulateActor>,
	/// Opaque object advertised on init; JSON-encoded when sent.
	pub metadata: Option<serde_json::Value>,

	/// When false (the default), `Runner::start` installs a SIGTERM/SIGINT
	/// handler that triggers a graceful shutdown and exits the process.
	/// Set true for hosts that manage their own signal handling.
	pub no_auto_shutdown: bool,

	/// Bounds `on_actor_start`/`on_actor_stop` (spec §5's noted TODO,
	/// resolved — see SPEC_FULL.md §5).
	pub callback_timeout: Duration,
	pub kv_expire: Duration,
	pub kv_sweep_interval: Duration,
	pub event_retention: Duration,
	pub event_prune_interval: Duration,
	pub ping_interval: Duration,
	pub ack_interval: Duration,

	pub callbacks: Arc<dyn RunnerCallbacks>,
	pub tunnel: Arc<dyn Tunnel>,
}

impl RunnerConfig {
	pub fn builder(
		endpoint: impl Into<String>,
		callbacks: Arc<dyn RunnerCallbacks>,
		tunnel: Arc<dyn Tunnel>,
	) -> RunnerConfigBuilder {
		RunnerConfigBuilder::new(endpoint, callbacks, tunnel)
	}

	/// The control WebSocket base URL, before query parameters.
	pub fn control_endpoint(&self) -> &str {
		self.pegboard_endpoint
			.as_deref()
			.unwrap_or(&self.endpoint)
	}

	/// The tunnel WebSocket base URL, before query parameters.
	pub fn relay_endpoint(&self) -> &str {
		self.pegboard_relay_endpoint
			.as_deref()
			.unwrap_or_else(|| self.control_endpoint())
	}
}

pub struct RunnerConfigBuilder {
	inner: RunnerConfig,
}

impl RunnerConfigBuilder {
	pub fn new(
		endpoint: impl Into<String>,
		callbacks: Arc<dyn RunnerCallbacks>,
		tunnel: Arc<dyn Tunnel>,
	) -> Self {
		Self {
			inner: RunnerConfig {
				endpoint: endpoint.into(),
				pegboard_endpoint: None,
				pegboard_relay_endpoint: None,
				version: 1,
				namespace: "default".to_string(),
				runner_name: "runner".to_string(),
				runner_key: String::new(),
				total_slots: 1,
				prepopulate_actor_names: HashMap::new(),
				metadata: None,
				no_auto_shutdown: false,
				callback_timeout: Duration::from_secs(15),
				kv_expire: Duration::from_secs(30),
				kv_sweep_interval: Duration::from_secs(15),
				event_retention: Duration::from_secs(5 * 60),
				event_prune_interval: Duration::from_secs(60),
				ping_interval: Duration::from_secs(1),
				ack_interval: Duration::from_secs(5 * 60),
				callbacks,
				tunnel,
			},
		}
	}

	pub fn pegboard_endpoint(mut self, endpoint: impl Into<String>) -> Self {
		self.inner.pegboard_endpoint = Some(endpoint.into());
		self
	}

	pub fn pegboard_relay_endpoint(mut self, endpoint: impl Into<String>) -> Self {
		self.inner.pegboard_relay_endpoint = Some(endpoint.into());
		self
	}

	pub fn version(mut self, version: u32) -> Self {
		self.inner.version = version;
		self
	}

	pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
		self.inner.namespace = namespace.into();
		self
	}

	pub fn runner_name(mut self, name: impl Into<String>) -> Self {
		self.inner.runner_name = name.into();
		self
	}

	pub fn runner_key(mut self, key: impl Into<String>) -> Self {
		self.inner.runner_key = key.into();
		self
	}

	pub fn total_slots(mut self, total_slots: u32) -> Self {
		self.inner.total_slots = total_slots;
		self
	}

	pub fn prepopulate_actor_name(mut self, name: impl Into<String>, metadata: String) -> Self {
		self.inner
			.prepopulate_actor_names
			.insert(name.into(), PrepopulateActor { metadata });
		self
	}

	pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
		self.inner.metadata = Some(metadata);
		self
	}

	pub fn no_auto_shutdown(mut self, no_auto_shutdown: bool) -> Self {
		self.inner.no_auto_shutdown = no_auto_shutdown;
		self
	}

	pub fn callback_timeout(mut self, timeout: Duration) -> Self {
		self.inner.callback_timeout = timeout;
		self
	}

	pub fn build(self) -> RunnerConfig {
		self.inner
	}
}
