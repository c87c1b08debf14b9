//! Integration tests against an in-process mock Pegboard control socket,
//! the same way the engine's own `TestRunner` drives a real server
//! rather than a mocked transport.

use std::{
	net::SocketAddr,
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pegboard_runner_core::{
	ActorConfig, ActorHandle, ActorStartOutcome, ActorStopOutcome, FetchRequest, FetchResponse,
	NoopTunnel, Runner, RunnerCallbacks, RunnerConfig,
};
use rivet_runner_protocol as rp;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

async fn bind_mock_server() -> (SocketAddr, TcpListener) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	(addr, listener)
}

async fn accept_ws(listener: TcpListener) -> WebSocketStream<TcpStream> {
	let (stream, _) = listener.accept().await.unwrap();
	tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn read_to_server(ws: &mut WebSocketStream<TcpStream>) -> rp::ToServer {
	loop {
		match ws.next().await.unwrap().unwrap() {
			Message::Binary(bytes) => return rp::codec::decode_to_server(&bytes).unwrap(),
			_ => continue,
		}
	}
}

async fn send_to_client(ws: &mut WebSocketStream<TcpStream>, msg: &rp::ToClient) {
	let bytes = rp::codec::encode_to_client(msg).unwrap();
	ws.send(Message::Binary(bytes)).await.unwrap();
}

fn init_reply() -> rp::ToClient {
	rp::ToClient::ToClientInit(rp::ToClientInit {
		runner_id: "runner-1".to_string(),
		last_event_idx: -1,
		metadata: None,
	})
}

fn wire_actor_config() -> rp::ActorConfig {
	rp::ActorConfig {
		name: "worker".to_string(),
		key: None,
		create_ts: 0,
		input: None,
	}
}

struct RecordingTunnel {
	unregistered: Arc<Mutex<Vec<(String, u32)>>>,
}

#[async_trait]
impl pegboard_runner_core::Tunnel for RecordingTunnel {
	async fn start(&self) -> anyhow::Result<()> {
		Ok(())
	}

	async fn unregister_actor(&self, actor_id: &str, generation: u32) {
		self.unregistered
			.lock()
			.unwrap()
			.push((actor_id.to_string(), generation));
	}
}

struct RecordingCallbacks {
	started: Arc<Mutex<Vec<String>>>,
	stopped: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RunnerCallbacks for RecordingCallbacks {
	async fn on_actor_start(
		&self,
		config: ActorConfig,
		_handle: ActorHandle,
	) -> anyhow::Result<ActorStartOutcome> {
		self.started.lock().unwrap().push(config.actor_id.clone());
		Ok(ActorStartOutcome::Running)
	}

	async fn on_actor_stop(&self, actor_id: &str, _generation: u32) -> anyhow::Result<ActorStopOutcome> {
		self.stopped.lock().unwrap().push(actor_id.to_string());
		Ok(ActorStopOutcome::Ok)
	}

	async fn fetch(
		&self,
		_actor_id: &str,
		_generation: u32,
		_req: FetchRequest,
	) -> anyhow::Result<FetchResponse> {
		anyhow::bail!("not exercised in this test")
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn start_and_stop_actor_round_trip() {
	let (addr, listener) = bind_mock_server().await;
	let started = Arc::new(Mutex::new(Vec::new()));
	let stopped = Arc::new(Mutex::new(Vec::new()));

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(listener).await;

		match read_to_server(&mut ws).await {
			rp::ToServer::ToServerInit(_) => {}
			other => panic!("expected init, got {other:?}"),
		}
		send_to_client(&mut ws, &init_reply()).await;

		send_to_client(
			&mut ws,
			&rp::ToClient::ToClientCommands(vec![rp::CommandWrapper {
				index: 0,
				inner: rp::Command::CommandStartActor(rp::CommandStartActor {
					actor_id: "a1".to_string(),
					generation: 1,
					config: wire_actor_config(),
				}),
			}]),
		)
		.await;

		match read_to_server(&mut ws).await {
			rp::ToServer::ToServerEvents(events) => {
				assert_eq!(events.len(), 1);
				assert!(matches!(
					events[0].inner,
					rp::Event::EventActorStateUpdate(rp::EventActorStateUpdate {
						state: rp::ActorState::ActorStateRunning,
						..
					})
				));
			}
			other => panic!("expected running event, got {other:?}"),
		}

		send_to_client(
			&mut ws,
			&rp::ToClient::ToClientCommands(vec![rp::CommandWrapper {
				index: 1,
				inner: rp::Command::CommandStopActor(rp::CommandStopActor {
					actor_id: "a1".to_string(),
					generation: 1,
				}),
			}]),
		)
		.await;

		match read_to_server(&mut ws).await {
			rp::ToServer::ToServerEvents(events) => {
				assert!(matches!(
					events[0].inner,
					rp::Event::EventActorStateUpdate(rp::EventActorStateUpdate {
						state: rp::ActorState::ActorStateStopped(rp::ActorStateStopped {
							code: rp::StopCode::Ok,
							..
						}),
						..
					})
				));
			}
			other => panic!("expected stopped event, got {other:?}"),
		}

		loop {
			match ws.next().await {
				Some(Ok(Message::Binary(bytes))) => {
					if let Ok(rp::ToServer::ToServerStopping) = rp::codec::decode_to_server(&bytes) {
						break;
					}
				}
				Some(Ok(Message::Close(_))) | None => break,
				_ => {}
			}
		}
	});

	let callbacks = Arc::new(RecordingCallbacks {
		started: started.clone(),
		stopped: stopped.clone(),
	});
	let config = RunnerConfig::builder(format!("ws://{addr}"), callbacks, Arc::new(NoopTunnel))
		.namespace("test")
		.runner_name("test-runner")
		.build();
	let handle = Runner::new(config).start().await.unwrap();

	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(*started.lock().unwrap(), vec!["a1".to_string()]);
	assert_eq!(*stopped.lock().unwrap(), vec!["a1".to_string()]);

	handle.shutdown(false).await.unwrap();
	server.await.unwrap();
}

/// A server resending an already-applied command batch after a
/// reconnect (its ack may not have arrived before the drop) must not
/// re-trigger the command — otherwise a resent `CommandStartActor`
/// would spuriously restart an actor that's already running.
#[tokio::test(flavor = "multi_thread")]
async fn stale_command_batch_resend_is_ignored() {
	let (addr, listener) = bind_mock_server().await;
	let started = Arc::new(Mutex::new(Vec::new()));
	let stopped = Arc::new(Mutex::new(Vec::new()));

	let started_for_server = started.clone();
	let server = tokio::spawn(async move {
		let mut ws = accept_ws(listener).await;
		read_to_server(&mut ws).await; // init
		send_to_client(&mut ws, &init_reply()).await;

		send_to_client(
			&mut ws,
			&rp::ToClient::ToClientCommands(vec![rp::CommandWrapper {
				index: 0,
				inner: rp::Command::CommandStartActor(rp::CommandStartActor {
					actor_id: "a1".to_string(),
					generation: 1,
					config: wire_actor_config(),
				}),
			}]),
		)
		.await;
		read_to_server(&mut ws).await; // running event

		// Drop the connection before the client's ack ever gets sent;
		// the server doesn't know the command landed.
		drop(ws);

		// Wait until the started actor is visible before reconnecting,
		// so the resend below races against an actor that's already up.
		while started_for_server.lock().unwrap().is_empty() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}

		let mut ws = accept_ws(TcpListener::bind(addr).await.unwrap()).await;
		read_to_server(&mut ws).await; // init, carries last_command_idx back
		send_to_client(&mut ws, &init_reply()).await;

		// Resend the exact same batch: this must be ignored.
		send_to_client(
			&mut ws,
			&rp::ToClient::ToClientCommands(vec![rp::CommandWrapper {
				index: 0,
				inner: rp::Command::CommandStartActor(rp::CommandStartActor {
					actor_id: "a1".to_string(),
					generation: 1,
					config: wire_actor_config(),
				}),
			}]),
		)
		.await;

		// Give the client a beat to (wrongly) reprocess, then stop it.
		tokio::time::sleep(Duration::from_millis(200)).await;
		send_to_client(
			&mut ws,
			&rp::ToClient::ToClientCommands(vec![rp::CommandWrapper {
				index: 1,
				inner: rp::Command::CommandStopActor(rp::CommandStopActor {
					actor_id: "a1".to_string(),
					generation: 1,
				}),
			}]),
		)
		.await;
		read_to_server(&mut ws).await; // stopped event

		loop {
			match ws.next().await {
				Some(Ok(Message::Binary(bytes))) => {
					if let Ok(rp::ToServer::ToServerStopping) = rp::codec::decode_to_server(&bytes) {
						break;
					}
				}
				Some(Ok(Message::Close(_))) | None => break,
				_ => {}
			}
		}
	});

	let callbacks = Arc::new(RecordingCallbacks {
		started: started.clone(),
		stopped: stopped.clone(),
	});
	let config = RunnerConfig::builder(format!("ws://{addr}"), callbacks, Arc::new(NoopTunnel))
		.namespace("test")
		.runner_name("test-runner")
		.build();
	let handle = Runner::new(config).start().await.unwrap();

	server.await.unwrap();

	assert_eq!(*started.lock().unwrap(), vec!["a1".to_string()]);
	assert_eq!(*stopped.lock().unwrap(), vec!["a1".to_string()]);

	handle.shutdown(false).await.unwrap();
}

struct KvCallbacks {
	handle_tx: tokio::sync::mpsc::UnboundedSender<ActorHandle>,
}

#[async_trait]
impl RunnerCallbacks for KvCallbacks {
	async fn on_actor_start(
		&self,
		_config: ActorConfig,
		handle: ActorHandle,
	) -> anyhow::Result<ActorStartOutcome> {
		let _ = self.handle_tx.send(handle);
		Ok(ActorStartOutcome::Running)
	}

	async fn on_actor_stop(&self, _actor_id: &str, _generation: u32) -> anyhow::Result<ActorStopOutcome> {
		Ok(ActorStopOutcome::Ok)
	}

	async fn fetch(
		&self,
		_actor_id: &str,
		_generation: u32,
		_req: FetchRequest,
	) -> anyhow::Result<FetchResponse> {
		anyhow::bail!("not exercised in this test")
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn kv_get_round_trip() {
	let (addr, listener) = bind_mock_server().await;
	let (handle_tx, mut handle_rx) = tokio::sync::mpsc::unbounded_channel();

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(listener).await;
		read_to_server(&mut ws).await;
		send_to_client(&mut ws, &init_reply()).await;

		send_to_client(
			&mut ws,
			&rp::ToClient::ToClientCommands(vec![rp::CommandWrapper {
				index: 0,
				inner: rp::Command::CommandStartActor(rp::CommandStartActor {
					actor_id: "a1".to_string(),
					generation: 1,
					config: wire_actor_config(),
				}),
			}]),
		)
		.await;

		read_to_server(&mut ws).await; // running event

		match read_to_server(&mut ws).await {
			rp::ToServer::ToServerKvRequest(req) => {
				assert_eq!(req.actor_id, "a1");
				match req.data {
					rp::KvRequestData::KvGetRequest(get) => {
						assert_eq!(get.keys, vec![b"k".to_vec()]);
					}
					other => panic!("expected get request, got {other:?}"),
				}
				send_to_client(
					&mut ws,
					&rp::ToClient::ToClientKvResponse(rp::ToClientKvResponse {
						request_id: req.request_id,
						data: rp::KvResponseData::KvGetResponse(rp::KvGetResponse {
							keys: vec![b"k".to_vec()],
							values: vec![b"v".to_vec()],
						}),
					}),
				)
				.await;
			}
			other => panic!("expected kv request, got {other:?}"),
		}

		// keep the socket open until the test explicitly tears it down
		let _ = ws.next().await;
	});

	let callbacks = Arc::new(KvCallbacks { handle_tx });
	let config = RunnerConfig::builder(format!("ws://{addr}"), callbacks, Arc::new(NoopTunnel)).build();
	let runner_handle = Runner::new(config).start().await.unwrap();

	let actor_handle = tokio::time::timeout(Duration::from_secs(2), handle_rx.recv())
		.await
		.unwrap()
		.unwrap();
	let result = actor_handle.kv_get(vec![b"k".to_vec()]).await.unwrap();
	assert_eq!(result, vec![Some(b"v".to_vec())]);

	runner_handle.shutdown(true).await.unwrap();
	server.abort();
}

struct NopCallbacks;

#[async_trait]
impl RunnerCallbacks for NopCallbacks {
	async fn on_actor_start(
		&self,
		_config: ActorConfig,
		_handle: ActorHandle,
	) -> anyhow::Result<ActorStartOutcome> {
		Ok(ActorStartOutcome::Running)
	}

	async fn on_actor_stop(&self, _actor_id: &str, _generation: u32) -> anyhow::Result<ActorStopOutcome> {
		Ok(ActorStopOutcome::Ok)
	}

	async fn fetch(
		&self,
		_actor_id: &str,
		_generation: u32,
		_req: FetchRequest,
	) -> anyhow::Result<FetchResponse> {
		anyhow::bail!("not exercised in this test")
	}
}

/// A control socket that exceeds its advertised `runner_lost_threshold`
/// while disconnected tears down every registered actor locally, through
/// the tunnel, even with nothing left to tell the server.
#[tokio::test(flavor = "multi_thread")]
async fn runner_lost_threshold_tears_down_actors_while_disconnected() {
	let (addr, listener) = bind_mock_server().await;

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(listener).await;
		read_to_server(&mut ws).await; // init

		send_to_client(
			&mut ws,
			&rp::ToClient::ToClientInit(rp::ToClientInit {
				runner_id: "runner-1".to_string(),
				last_event_idx: -1,
				metadata: Some(rp::ProtocolMetadata {
					runner_lost_threshold: Some(100),
				}),
			}),
		)
		.await;

		send_to_client(
			&mut ws,
			&rp::ToClient::ToClientCommands(vec![rp::CommandWrapper {
				index: 0,
				inner: rp::Command::CommandStartActor(rp::CommandStartActor {
					actor_id: "a1".to_string(),
					generation: 1,
					config: wire_actor_config(),
				}),
			}]),
		)
		.await;

		read_to_server(&mut ws).await; // running event

		// Drop the connection and stop listening entirely: every
		// reconnect attempt fails fast with connection-refused, so the
		// runner-lost deadline (100ms) fires well before the 1s initial
		// backoff interval elapses.
		drop(ws);
	});

	let unregistered = Arc::new(Mutex::new(Vec::new()));
	let tunnel = Arc::new(RecordingTunnel {
		unregistered: unregistered.clone(),
	});
	let config = RunnerConfig::builder(format!("ws://{addr}"), Arc::new(NopCallbacks), tunnel).build();
	let handle = Runner::new(config).start().await.unwrap();

	server.await.unwrap();
	tokio::time::sleep(Duration::from_millis(500)).await;

	assert_eq!(*unregistered.lock().unwrap(), vec![("a1".to_string(), 1)]);
	handle.shutdown(true).await.unwrap();
}
