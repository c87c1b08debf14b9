use std::{sync::Arc, time::Duration};

use rivet_runner_protocol as rp;
use tokio::sync::{mpsc, oneshot};

use crate::{
	actor::{ActorConfig, ActorHandle, ActorStartOutcome, ActorStopOutcome},
	config::RunnerConfig,
	error::KvError,
	registry::{actor_state_event, ActorInstance, ActorRegistry},
	tunnel::Tunnel,
	RunnerCallbacks,
};

/// Everything either an [`ActorHandle`] or a [`crate::RunnerHandle`] can
/// post onto the core's mailbox. This is the only way either of them
/// touches core state (spec §5) — there is no shared lock anywhere in
/// this crate.
pub enum CoreMsg {
	ActorEmit {
		actor_id: String,
		generation: u32,
		event: rp::Event,
	},
	Kv {
		actor_id: String,
		data: rp::KvRequestData,
		respond: oneshot::Sender<Result<rp::KvResponseData, KvError>>,
	},
	LookupActor {
		actor_id: String,
		respond: oneshot::Sender<Option<u32>>,
	},
	ActorStartFinished {
		actor_id: String,
		generation: u32,
		result: anyhow::Result<ActorStartOutcome>,
	},
	ActorStopFinished {
		actor_id: String,
		generation: u32,
		result: anyhow::Result<ActorStopOutcome>,
	},
	Shutdown {
		immediate: bool,
		done: oneshot::Sender<()>,
	},
}

/// Owns every piece of mutable state the runner has (registry, journal,
/// KV broker) plus the host collaborators (callbacks, tunnel). Lives
/// entirely on the connection manager's task — nothing in this struct is
/// ever wrapped in a `Mutex`; the only way in is `CoreMsg` and the only
/// way out is the events/frames the connection manager sends itself.
pub struct Core {
	pub(crate) registry: ActorRegistry,
	pub(crate) journal: crate::journal::EventJournal,
	pub(crate) kv: crate::kv::KvBroker,
	pub(crate) runner_id: Option<String>,
	pub(crate) shutting_down: bool,

	callbacks: Arc<dyn RunnerCallbacks>,
	tunnel: Arc<dyn Tunnel>,
	callback_timeout: Duration,
	self_tx: mpsc::UnboundedSender<CoreMsg>,
}

impl Core {
	pub fn new(config: &RunnerConfig, self_tx: mpsc::UnboundedSender<CoreMsg>) -> Self {
		Self {
			registry: ActorRegistry::new(),
			journal: crate::journal::EventJournal::new(config.event_retention),
			kv: crate::kv::KvBroker::new(config.kv_expire),
			runner_id: None,
			shutting_down: false,
			callbacks: config.callbacks.clone(),
			tunnel: config.tunnel.clone(),
			callback_timeout: config.callback_timeout,
			self_tx,
		}
	}

	/// Whether an event emitted for `actor_id`/`generation` right now
	/// should actually be journaled/sent. Once shutdown has begun, or if
	/// the actor is no longer registered under that exact generation (it
	/// raced a stop, or a stale handle from a superseded generation is
	/// still emitting), emissions are silently dropped (spec §4.3 "no
	/// emission after ShuttingDown"; Data Model invariant "the generation
	/// in ... event emissions must match the one recorded when the actor
	/// was started").
	pub fn accept_emission(&self, actor_id: &str, generation: u32) -> bool {
		!self.shutting_down && self.lookup_actor_generation(actor_id) == Some(generation)
	}

	pub fn lookup_actor_generation(&self, actor_id: &str) -> Option<u32> {
		self.registry.get(actor_id).map(|inst| inst.config.generation)
	}

	/// `CommandStartActor`: registers the actor immediately (so KV/fetch
	/// calls and a near-simultaneous `CommandStopActor` both see it) and
	/// spawns `on_actor_start` off the core's task so a slow host callback
	/// never blocks the event loop. Completion comes back as
	/// [`CoreMsg::ActorStartFinished`].
	pub fn handle_start_actor(
		&mut self,
		actor_id: String,
		generation: u32,
		wire_config: rp::ActorConfig,
	) {
		let actor_config = ActorConfig::from_wire(actor_id.clone(), generation, wire_config);
		let handle = ActorHandle {
			actor_id: actor_id.clone(),
			generation,
			emit_tx: self.self_tx.clone(),
		};
		self.registry.insert(
			actor_id.clone(),
			ActorInstance {
				config: actor_config.clone(),
				handle: handle.clone(),
			},
		);

		let callbacks = self.callbacks.clone();
		let timeout = self.callback_timeout;
		let self_tx = self.self_tx.clone();
		let id_for_result = actor_id.clone();
		tokio::spawn(async move {
			let result = match tokio::time::timeout(
				timeout,
				callbacks.on_actor_start(actor_config, handle),
			)
			.await
			{
				Ok(result) => result,
				Err(_) => Err(anyhow::anyhow!(
					"on_actor_start timed out after {timeout:?}"
				)),
			};
			let _ = self_tx.send(CoreMsg::ActorStartFinished {
				actor_id: id_for_result,
				generation,
				result,
			});
		});
	}

	/// `CommandStopActor`: spawns `on_actor_stop` the same way. The actor
	/// stays registered until the callback reports back — KV/emit calls
	/// made during teardown still resolve normally.
	pub fn handle_stop_actor(&mut self, actor_id: String, generation: u32) {
		if self.lookup_actor_generation(&actor_id) != Some(generation) {
			tracing::debug!(actor_id, generation, "stop for unknown or superseded actor");
			return;
		}

		let callbacks = self.callbacks.clone();
		let timeout = self.callback_timeout;
		let self_tx = self.self_tx.clone();
		let id_for_cb = actor_id.clone();
		tokio::spawn(async move {
			let result = match tokio::time::timeout(
				timeout,
				callbacks.on_actor_stop(&id_for_cb, generation),
			)
			.await
			{
				Ok(result) => result,
				Err(_) => Err(anyhow::anyhow!(
					"on_actor_stop timed out after {timeout:?}"
				)),
			};
			let _ = self_tx.send(CoreMsg::ActorStopFinished {
				actor_id: id_for_cb,
				generation,
				result,
			});
		});
	}

	/// Resolves `on_actor_start`'s outcome into the `ActorStateUpdate`
	/// event to journal, if any. A crash or callback error tears the actor
	/// down immediately and on its own — `on_actor_stop` is never called
	/// for an actor that never successfully started (spec §9 resolution 1:
	/// `on_actor_stop` has exactly one call site in the crate, and this
	/// isn't it).
	pub fn finish_actor_start(
		&mut self,
		actor_id: String,
		generation: u32,
		result: anyhow::Result<ActorStartOutcome>,
	) -> Option<rp::Event> {
		if self.lookup_actor_generation(&actor_id) != Some(generation) {
			return None;
		}

		match result {
			Ok(ActorStartOutcome::Running) => Some(actor_state_event(
				&actor_id,
				generation,
				rp::ActorState::ActorStateRunning,
			)),
			Ok(ActorStartOutcome::Crashed { code, message }) => {
				self.teardown_actor(&actor_id, generation);
				Some(stopped_event(
					&actor_id,
					generation,
					rp::StopCode::Error,
					format!("exit code {code}: {message}"),
				))
			}
			Err(err) => {
				tracing::warn!(actor_id, generation, error = %err, "on_actor_start failed");
				self.teardown_actor(&actor_id, generation);
				Some(stopped_event(
					&actor_id,
					generation,
					rp::StopCode::Error,
					err.to_string(),
				))
			}
		}
	}

	/// Resolves `on_actor_stop`'s outcome into the `ActorStateStopped`
	/// event and removes the actor from the registry.
	pub fn finish_actor_stop(
		&mut self,
		actor_id: String,
		generation: u32,
		result: anyhow::Result<ActorStopOutcome>,
	) -> Option<rp::Event> {
		if self.lookup_actor_generation(&actor_id) != Some(generation) {
			return None;
		}

		let outcome = result.unwrap_or_else(|err| {
			tracing::warn!(actor_id, generation, error = %err, "on_actor_stop failed");
			ActorStopOutcome::Crashed {
				code: -1,
				message: err.to_string(),
			}
		});
		self.teardown_actor(&actor_id, generation);

		let (code, message) = match outcome {
			ActorStopOutcome::Ok => (rp::StopCode::Ok, String::new()),
			ActorStopOutcome::Crashed { code, message } => {
				(rp::StopCode::Error, format!("exit code {code}: {message}"))
			}
		};
		Some(stopped_event(&actor_id, generation, code, message))
	}

	/// Every actor currently registered, for bulk teardown (runner-lost,
	/// graceful shutdown drain).
	pub fn snapshot_actor_ids(&self) -> Vec<(String, u32)> {
		self.registry.snapshot_ids()
	}

	fn teardown_actor(&mut self, actor_id: &str, generation: u32) {
		self.registry.remove(actor_id);
		let tunnel = self.tunnel.clone();
		let actor_id = actor_id.to_string();
		tokio::spawn(async move {
			tunnel.unregister_actor(&actor_id, generation).await;
		});
	}

	/// Forcibly removes every registered actor without waiting on
	/// `on_actor_stop` — used for immediate shutdown and runner-lost bulk
	/// teardown (spec §4.3, §4.6), where there is no time, or no socket
	/// left, to wait for a host callback. Still unregisters each actor
	/// from the tunnel and returns an `ActorStateStopped` event per actor
	/// for the caller to journal/send if it can.
	pub fn force_teardown_all(&mut self, message: &str) -> Vec<rp::Event> {
		self.snapshot_actor_ids()
			.into_iter()
			.map(|(actor_id, generation)| {
				self.teardown_actor(&actor_id, generation);
				stopped_event(&actor_id, generation, rp::StopCode::Error, message.to_string())
			})
			.collect()
	}
}

fn stopped_event(actor_id: &str, generation: u32, code: rp::StopCode, message: String) -> rp::Event {
	actor_state_event(
		actor_id,
		generation,
		rp::ActorState::ActorStateStopped(rp::ActorStateStopped { code, message }),
	)
}
