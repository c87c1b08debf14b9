use std::{sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use rivet_runner_protocol as rp;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
	tungstenite::{self, client::IntoClientRequest, Message},
	MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{
	config::RunnerConfig,
	core::{Core, CoreMsg},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn reconnect_backoff() -> ExponentialBackoff {
	ExponentialBackoff {
		initial_interval: Duration::from_millis(1000),
		multiplier: 2.0,
		max_interval: Duration::from_millis(30_000),
		max_elapsed_time: None,
		..Default::default()
	}
}

fn now_ms() -> i64 {
	use std::time::{SystemTime, UNIX_EPOCH};
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

/// Builds the control WebSocket URL: scheme swapped to ws/wss, protocol
/// version + namespace + runner key in the query string, matching
/// spec §6's "URL derivation".
pub(crate) fn build_control_url(config: &RunnerConfig) -> anyhow::Result<Url> {
	let mut url = Url::parse(config.control_endpoint())?;
	let scheme = match url.scheme() {
		"http" => "ws",
		"https" => "wss",
		other => other,
	};
	url.set_scheme(scheme)
		.map_err(|_| anyhow::anyhow!("could not set url scheme"))?;

	url.query_pairs_mut()
		.append_pair(
			"protocol_version",
			&rp::PROTOCOL_VERSION.to_string(),
		)
		.append_pair("namespace", &config.namespace)
		.append_pair("runner_key", &config.runner_key);

	Ok(url)
}

enum SessionEnd {
	Shutdown,
	Disconnected,
}

/// Drives the control WebSocket: connects with backoff, performs the
/// init handshake, then runs the single `select!` loop that owns every
/// piece of core state for the lifetime of the process (spec §5).
pub struct ConnectionManager {
	config: Arc<RunnerConfig>,
	core: Core,
	core_rx: mpsc::UnboundedReceiver<CoreMsg>,
	last_command_idx: i64,
	/// From `ToClientInit.metadata` on the most recent successful
	/// handshake; `None` means the runner is never declared lost.
	runner_lost_threshold: Option<Duration>,
	/// Armed the moment the control socket goes down; cleared on the next
	/// successful reconnect. If it fires while still disconnected, every
	/// registered actor is torn down (spec §4.1, §4.3).
	runner_lost_deadline: Option<tokio::time::Instant>,
}

impl ConnectionManager {
	pub fn new(
		config: Arc<RunnerConfig>,
		core: Core,
		core_rx: mpsc::UnboundedReceiver<CoreMsg>,
	) -> Self {
		Self {
			config,
			core,
			core_rx,
			last_command_idx: -1,
			runner_lost_threshold: None,
			runner_lost_deadline: None,
		}
	}

	#[tracing::instrument(skip_all)]
	pub async fn run(mut self) {
		let mut backoff = reconnect_backoff();

		loop {
			if self.core.shutting_down {
				return;
			}

			let ws = match self.connect_and_handshake().await {
				Ok(ws) => ws,
				Err(err) => {
					tracing::warn!(error = %err, "control socket connect failed, backing off");
					self.arm_runner_lost_deadline();
					let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
					if self.sleep_or_drain_shutdown(delay).await {
						return;
					}
					continue;
				}
			};

			backoff.reset();
			tracing::info!("control socket connected");
			let callbacks = self.config.callbacks.clone();
			tokio::spawn(async move { callbacks.on_connected().await });

			match self.drive_session(ws).await {
				SessionEnd::Shutdown => return,
				SessionEnd::Disconnected => {
					let callbacks = self.config.callbacks.clone();
					tokio::spawn(async move { callbacks.on_disconnected().await });
					self.arm_runner_lost_deadline();
					let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
					if self.sleep_or_drain_shutdown(delay).await {
						return;
					}
				}
			}
		}
	}

	/// Starts counting down to "runner lost" the moment we go disconnected,
	/// if a threshold was advertised and nothing is counting down already.
	fn arm_runner_lost_deadline(&mut self) {
		if self.runner_lost_deadline.is_none() {
			if let Some(threshold) = self.runner_lost_threshold {
				self.runner_lost_deadline = Some(tokio::time::Instant::now() + threshold);
			}
		}
	}

	/// The runner-lost timer expired while still disconnected: the server
	/// has already given up on every actor we're holding, so there is
	/// nothing to wait on or tell it — just drop them locally and let the
	/// tunnel close out whatever traffic it was still tracking (spec §4.1,
	/// §4.3, §4.6).
	fn declare_runner_lost(&mut self) {
		let count = self.core.snapshot_actor_ids().len();
		tracing::error!(
			actor_count = count,
			"runner lost threshold exceeded while disconnected from control socket; tearing down all actors"
		);
		self.core
			.force_teardown_all("runner lost: exceeded runner_lost_threshold while disconnected");
		self.runner_lost_deadline = None;
	}

	async fn wait_for_runner_lost_deadline(deadline: Option<tokio::time::Instant>) {
		match deadline {
			Some(deadline) => tokio::time::sleep_until(deadline).await,
			None => std::future::pending().await,
		}
	}

	/// Sleeps out a reconnect delay while still draining the mailbox, so a
	/// shutdown request issued while disconnected isn't stuck behind a
	/// 30s backoff. Also races the runner-lost deadline, if one is armed.
	/// Returns `true` if a shutdown was handled.
	async fn sleep_or_drain_shutdown(&mut self, delay: Duration) -> bool {
		let deadline = self.runner_lost_deadline;
		tokio::select! {
			_ = tokio::time::sleep(delay) => false,
			_ = Self::wait_for_runner_lost_deadline(deadline) => {
				self.declare_runner_lost();
				false
			}
			msg = self.core_rx.recv() => {
				match msg {
					Some(CoreMsg::Shutdown { done, .. }) => {
						self.core.shutting_down = true;
						self.core.force_teardown_all("runner shutting down");
						let _ = done.send(());
						true
					}
					Some(other) => {
						self.handle_offline_msg(other);
						false
					}
					None => true,
				}
			}
		}
	}

	/// Handles a mailbox message while there is no live socket: KV calls
	/// queue for flush-on-reconnect, emissions (generation-checked, same as
	/// the online path) and finished-callback events still enter the
	/// journal so they can be replayed once reconnected — only the frame
	/// *send* is skipped while offline (spec §1/§4.4's reliable event
	/// stream survives a disconnect, it doesn't depend on one never
	/// happening).
	fn handle_offline_msg(&mut self, msg: CoreMsg) {
		match msg {
			CoreMsg::Kv {
				actor_id,
				data,
				respond,
			} => {
				self.core.kv.enqueue(actor_id, data, respond);
			}
			CoreMsg::LookupActor { actor_id, respond } => {
				let _ = respond.send(self.core.lookup_actor_generation(&actor_id));
			}
			CoreMsg::ActorEmit {
				actor_id,
				generation,
				event,
			} => {
				if self.core.accept_emission(&actor_id, generation) {
					self.core.journal.append(event);
				}
			}
			CoreMsg::ActorStartFinished {
				actor_id,
				generation,
				result,
			} => {
				if let Some(event) = self.core.finish_actor_start(actor_id, generation, result) {
					self.core.journal.append(event);
				}
			}
			CoreMsg::ActorStopFinished {
				actor_id,
				generation,
				result,
			} => {
				if let Some(event) = self.core.finish_actor_stop(actor_id, generation, result) {
					self.core.journal.append(event);
				}
			}
			CoreMsg::Shutdown { .. } => {}
		}
	}

	async fn connect_and_handshake(&mut self) -> anyhow::Result<WsStream> {
		let url = build_control_url(&self.config)?;
		let mut request = url.into_client_request()?;
		request.headers_mut().insert(
			tungstenite::http::header::HeaderName::from_static("x-rivet-target"),
			tungstenite::http::HeaderValue::from_static("runner"),
		);

		let (mut ws, _resp) = tokio_tungstenite::connect_async(request).await?;

		let prepopulate = if self.config.prepopulate_actor_names.is_empty() {
			None
		} else {
			Some(
				self.config
					.prepopulate_actor_names
					.iter()
					.map(|(name, actor)| {
						(
							name.clone(),
							rp::ActorNameMetadata {
								metadata: actor.metadata.clone(),
							},
						)
					})
					.collect(),
			)
		};
		let metadata = self
			.config
			.metadata
			.as_ref()
			.map(|value| serde_json::to_string(value))
			.transpose()?;

		let init = rp::ToServer::ToServerInit(rp::ToServerInit {
			name: self.config.runner_name.clone(),
			version: self.config.version,
			total_slots: self.config.total_slots,
			last_command_idx: if self.last_command_idx < 0 {
				None
			} else {
				Some(self.last_command_idx)
			},
			prepopulate_actor_names: prepopulate,
			metadata,
		});
		let frame = rp::codec::encode_to_server(&init)?;
		ws.send(Message::Binary(frame)).await?;

		let reply = ws
			.next()
			.await
			.ok_or_else(|| anyhow::anyhow!("control socket closed before init ack"))??;
		let bytes = match reply {
			Message::Binary(bytes) => bytes,
			other => anyhow::bail!("unexpected frame during handshake: {other:?}"),
		};
		match rp::codec::decode_to_client(&bytes)? {
			rp::ToClient::ToClientInit(init) => {
				self.core.runner_id = Some(init.runner_id);
				self.runner_lost_threshold = init
					.metadata
					.as_ref()
					.and_then(|metadata| metadata.runner_lost_threshold)
					.map(Duration::from_millis);
				self.runner_lost_deadline = None;
				let replay = self.core.journal.entries_after(init.last_event_idx);
				if !replay.is_empty() {
					let frame = rp::codec::encode_to_server(&rp::ToServer::ToServerEvents(replay))?;
					ws.send(Message::Binary(frame)).await?;
				}

				for (request_id, actor_id, data) in self.core.kv.drain_unsent() {
					let frame = rp::ToServer::ToServerKvRequest(rp::ToServerKvRequest {
						actor_id,
						request_id,
						data,
					});
					let frame = rp::codec::encode_to_server(&frame)?;
					ws.send(Message::Binary(frame)).await?;
				}

				Ok(ws)
			}
			other => anyhow::bail!("expected ToClientInit, got {other:?}"),
		}
	}

	#[tracing::instrument(skip_all)]
	async fn drive_session(&mut self, mut ws: WsStream) -> SessionEnd {
		let mut ping_interval = tokio::time::interval(self.config.ping_interval);
		let mut ack_interval = tokio::time::interval(self.config.ack_interval);
		let mut sweep_interval = tokio::time::interval(self.config.kv_sweep_interval);
		let mut prune_interval = tokio::time::interval(self.config.event_prune_interval);
		let mut shutdown_done: Option<tokio::sync::oneshot::Sender<()>> = None;

		loop {
			if self.core.shutting_down && self.core.registry.is_empty() {
				let frame = rp::codec::encode_to_server(&rp::ToServer::ToServerStopping);
				if let Ok(frame) = frame {
					let _ = ws.send(Message::Binary(frame)).await;
				}
				let _ = ws
					.close(Some(tungstenite::protocol::CloseFrame {
						code: tungstenite::protocol::frame::coding::CloseCode::Normal,
						reason: "Stopping".into(),
					}))
					.await;
				if let Some(done) = shutdown_done.take() {
					let _ = done.send(());
				}
				return SessionEnd::Shutdown;
			}

			tokio::select! {
				biased;

				msg = self.core_rx.recv() => {
					let Some(msg) = msg else { return SessionEnd::Disconnected };
					match msg {
						CoreMsg::Shutdown { immediate, done } => {
							self.core.shutting_down = true;
							shutdown_done = Some(done);
							if immediate {
								// Immediate shutdown skips the *wait* for
								// on_actor_stop, not the teardown itself:
								// the tunnel still needs to be told and a
								// stop event is still attempted.
								let events = self.core.force_teardown_all("runner shutting down");
								for event in events {
									let _ = self.send_event(&mut ws, event).await;
								}
							} else {
								for (actor_id, generation) in self.core.snapshot_actor_ids() {
									self.core.handle_stop_actor(actor_id, generation);
								}
							}
						}
						CoreMsg::ActorEmit { actor_id, generation, event } => {
							if self.core.accept_emission(&actor_id, generation) {
								if let Err(err) = self.send_event(&mut ws, event).await {
									tracing::warn!(error = %err, "failed to send actor event");
									return SessionEnd::Disconnected;
								}
							}
						}
						CoreMsg::Kv { actor_id, data, respond } => {
							let request_id = self.core.kv.enqueue(actor_id.clone(), data.clone(), respond);
							let frame = rp::ToServer::ToServerKvRequest(rp::ToServerKvRequest {
								actor_id,
								request_id,
								data,
							});
							match rp::codec::encode_to_server(&frame) {
								Ok(bytes) => {
									if ws.send(Message::Binary(bytes)).await.is_ok() {
										self.core.kv.mark_sent(request_id);
									} else {
										return SessionEnd::Disconnected;
									}
								}
								Err(err) => tracing::error!(error = %err, "failed to encode kv request"),
							}
						}
						CoreMsg::LookupActor { actor_id, respond } => {
							let _ = respond.send(self.core.lookup_actor_generation(&actor_id));
						}
						CoreMsg::ActorStartFinished { actor_id, generation, result } => {
							if let Some(event) = self.core.finish_actor_start(actor_id, generation, result) {
								if self.send_event(&mut ws, event).await.is_err() {
									return SessionEnd::Disconnected;
								}
							}
						}
						CoreMsg::ActorStopFinished { actor_id, generation, result } => {
							if let Some(event) = self.core.finish_actor_stop(actor_id, generation, result) {
								if self.send_event(&mut ws, event).await.is_err() {
									return SessionEnd::Disconnected;
								}
							}
						}
					}
				}

				frame = ws.next() => {
					let Some(frame) = frame else { return SessionEnd::Disconnected };
					let frame = match frame {
						Ok(frame) => frame,
						Err(err) => {
							tracing::warn!(error = %err, "control socket error");
							return SessionEnd::Disconnected;
						}
					};
					match frame {
						Message::Binary(bytes) => {
							if self.handle_inbound(&mut ws, &bytes).await.is_err() {
								return SessionEnd::Disconnected;
							}
						}
						Message::Close(_) => return SessionEnd::Disconnected,
						_ => {}
					}
				}

				_ = ping_interval.tick() => {
					let frame = rp::ToServer::ToServerPing(rp::ToServerPing { ts: now_ms() });
					if self.send_to_server(&mut ws, &frame).await.is_err() {
						return SessionEnd::Disconnected;
					}
				}

				_ = ack_interval.tick(), if self.last_command_idx >= 0 => {
					let frame = rp::ToServer::ToServerAckCommands(rp::ToServerAckCommands {
						last_command_idx: self.last_command_idx,
					});
					if self.send_to_server(&mut ws, &frame).await.is_err() {
						return SessionEnd::Disconnected;
					}
				}

				_ = sweep_interval.tick() => {
					let expired = self.core.kv.expire_stale(tokio::time::Instant::now().into_std());
					if expired > 0 {
						tracing::debug!(expired, "expired stale kv requests");
					}
				}

				_ = prune_interval.tick() => {
					self.core.journal.prune_aged(tokio::time::Instant::now().into_std());
				}
			}
		}
	}

	async fn handle_inbound(&mut self, ws: &mut WsStream, bytes: &[u8]) -> anyhow::Result<()> {
		match rp::codec::decode_to_client(bytes)? {
			rp::ToClient::ToClientInit(_) => {
				tracing::warn!("received unexpected second ToClientInit; ignoring");
			}
			rp::ToClient::ToClientCommands(commands) => {
				// The server may resend a batch after a reconnect; one
				// whose indices are all already applied is a pure
				// redelivery and must be ignored wholesale, or a
				// re-applied CommandStartActor would spuriously restart an
				// actor that's already running (spec §4.2).
				let is_stale = !commands.is_empty()
					&& commands
						.iter()
						.all(|wrapper| wrapper.index <= self.last_command_idx);
				if is_stale {
					tracing::debug!(
						last_command_idx = self.last_command_idx,
						"ignoring stale command batch resend",
					);
				} else {
					for wrapper in commands {
						if wrapper.index > self.last_command_idx {
							self.last_command_idx = wrapper.index;
						}
						match wrapper.inner {
							rp::Command::CommandStartActor(cmd) => {
								self.core
									.handle_start_actor(cmd.actor_id, cmd.generation, cmd.config);
							}
							rp::Command::CommandStopActor(cmd) => {
								self.core.handle_stop_actor(cmd.actor_id, cmd.generation);
							}
						}
					}
				}
			}
			rp::ToClient::ToClientAckEvents(ack) => {
				self.core.journal.truncate_acked(ack.last_event_idx);
			}
			rp::ToClient::ToClientKvResponse(resp) => {
				self.core.kv.handle_response(resp.request_id, resp.data);
			}
		}
		let _ = ws;
		Ok(())
	}

	async fn send_event(&mut self, ws: &mut WsStream, event: rp::Event) -> anyhow::Result<()> {
		let wrapper = self.core.journal.append(event);
		let frame = rp::ToServer::ToServerEvents(vec![wrapper]);
		self.send_to_server(ws, &frame).await
	}

	async fn send_to_server(&self, ws: &mut WsStream, frame: &rp::ToServer) -> anyhow::Result<()> {
		let bytes = rp::codec::encode_to_server(frame)?;
		ws.send(Message::Binary(bytes)).await?;
		Ok(())
	}
}
