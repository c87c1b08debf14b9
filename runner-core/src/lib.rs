//! Client-side connector to a Pegboard-style orchestration service: owns
//! the control WebSocket, the actor registry, the event journal, and the
//! KV request broker, and liaises with an external tunnel for inbound
//! HTTP/WebSocket traffic.
//!
//! The crate is a library only — the host process builds a
//! [`RunnerConfig`] with its own [`RunnerCallbacks`] and [`Tunnel`]
//! implementations and drives the result with [`Runner::start`].

pub mod actor;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod journal;
pub mod kv;
pub mod registry;
pub mod tunnel;

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, oneshot};

pub use actor::{ActorConfig, ActorHandle, ActorStartOutcome, ActorStopOutcome};
pub use config::{FetchRequest, FetchResponse, RunnerCallbacks, RunnerConfig, RunnerConfigBuilder, WebSocketConn};
pub use error::{KvError, RunnerError};
pub use tunnel::{NoopTunnel, Tunnel};

use connection::ConnectionManager;
use core::{Core, CoreMsg};

/// Entry point: brings the tunnel up, then the control socket, and hands
/// back a [`RunnerHandle`] the host keeps around to shut the runner down.
pub struct Runner {
	config: Arc<RunnerConfig>,
}

impl Runner {
	pub fn new(config: RunnerConfig) -> Self {
		Self {
			config: Arc::new(config),
		}
	}

	/// Starts the tunnel and the control socket's background task.
	/// First-attempt tunnel failure is fatal (spec §1), as is a
	/// malformed control endpoint (there is no point backing off forever
	/// on a URL that will never parse). The control socket itself retries
	/// indefinitely with backoff once running for everything else.
	#[tracing::instrument(skip_all)]
	pub async fn start(self) -> Result<RunnerHandle, RunnerError> {
		connection::build_control_url(&self.config).map_err(RunnerError::InvalidEndpoint)?;

		self.config
			.tunnel
			.start()
			.await
			.map_err(RunnerError::TunnelHandshakeFailed)?;

		let (core_tx, core_rx) = mpsc::unbounded_channel();
		let core = Core::new(&self.config, core_tx.clone());
		let manager = ConnectionManager::new(self.config.clone(), core, core_rx);

		let join_handle = tokio::spawn(manager.run());

		let handle = RunnerHandle {
			config: self.config.clone(),
			core_tx,
			join_handle: Arc::new(tokio::sync::Mutex::new(Some(join_handle))),
		};

		if !self.config.no_auto_shutdown {
			let signal_handle = handle.clone();
			tokio::spawn(async move {
				wait_for_shutdown_signal().await;
				tracing::info!("received shutdown signal, stopping runner");
				let _ = signal_handle.shutdown(false).await;
				std::process::exit(0);
			});
		}

		Ok(handle)
	}
}

/// Waits for SIGTERM (unix) or SIGINT/Ctrl-C, the signals a process
/// manager or an interactive terminal actually sends (spec §6's
/// `no_auto_shutdown` carve-out).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	let mut sigterm = match signal(SignalKind::terminate()) {
		Ok(sigterm) => sigterm,
		Err(err) => {
			tracing::warn!(error = %err, "failed to install SIGTERM handler, watching SIGINT only");
			let _ = tokio::signal::ctrl_c().await;
			return;
		}
	};
	tokio::select! {
		_ = sigterm.recv() => {}
		_ = tokio::signal::ctrl_c() => {}
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}

/// Handle to a running [`Runner`]. Every method posts a message onto the
/// same mailbox an [`ActorHandle`] uses — there is no direct access to
/// registry/journal/KV state from here either.
#[derive(Clone)]
pub struct RunnerHandle {
	config: Arc<RunnerConfig>,
	core_tx: mpsc::UnboundedSender<CoreMsg>,
	join_handle: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl RunnerHandle {
	/// Gracefully (or immediately) shuts the runner down. Graceful
	/// shutdown waits for every registered actor's `on_actor_stop` to
	/// finish before sending `ToServerStopping` and closing the socket
	/// (spec §9 resolution 3); immediate shutdown skips the wait.
	pub async fn shutdown(&self, immediate: bool) -> Result<(), RunnerError> {
		let (done, rx) = oneshot::channel();
		self.core_tx
			.send(CoreMsg::Shutdown { immediate, done })
			.map_err(|_| RunnerError::CoreTaskGone)?;
		rx.await.map_err(|_| RunnerError::CoreTaskGone)?;

		let callbacks = self.config.callbacks.clone();
		callbacks.on_shutdown().await;

		if let Some(join_handle) = self.join_handle.lock().await.take() {
			let _ = join_handle.await;
		}
		Ok(())
	}

	/// Routes an inbound HTTP request to the actor's `fetch` handler,
	/// after confirming the actor is still registered (spec §4.6).
	pub async fn dispatch_fetch(
		&self,
		actor_id: &str,
		req: FetchRequest,
	) -> anyhow::Result<FetchResponse> {
		let generation = self.lookup_actor(actor_id).await?;
		self.config.callbacks.fetch(actor_id, generation, req).await
	}

	/// Routes an inbound, already-upgraded WebSocket connection to the
	/// actor's `websocket` handler, after confirming it is still
	/// registered (spec §4.6).
	pub async fn dispatch_websocket(&self, actor_id: &str, conn: WebSocketConn) -> anyhow::Result<()> {
		let generation = self.lookup_actor(actor_id).await?;
		self.config
			.callbacks
			.websocket(actor_id, generation, conn)
			.await
	}

	async fn lookup_actor(&self, actor_id: &str) -> anyhow::Result<u32> {
		let (respond, rx) = oneshot::channel();
		self.core_tx
			.send(CoreMsg::LookupActor {
				actor_id: actor_id.to_string(),
				respond,
			})
			.map_err(|_| anyhow::anyhow!("runner core task is gone"))?;
		rx.await?
			.ok_or_else(|| anyhow::anyhow!("actor {actor_id} is not registered"))
	}
}

/// Default callback timeout (spec §5's resolved TODO). Exposed for hosts
/// that want to reference it rather than a magic number in their own
/// config.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(15);
