use rivet_runner_protocol as rp;
use tokio::sync::{mpsc, oneshot};

use crate::error::KvError;

/// Snapshot of the config a `CommandStartActor` carried, handed to
/// `on_actor_start` and to the [`ActorHandle`] the actor keeps for the
/// rest of its life.
#[derive(Debug, Clone)]
pub struct ActorConfig {
	pub actor_id: String,
	pub generation: u32,
	pub name: String,
	pub key: Option<String>,
	pub create_ts: i64,
	pub input: Option<Vec<u8>>,
}

impl ActorConfig {
	pub(crate) fn from_wire(actor_id: String, generation: u32, config: rp::ActorConfig) -> Self {
		Self {
			actor_id,
			generation,
			name: config.name,
			key: config.key,
			create_ts: config.create_ts,
			input: config.input,
		}
	}
}

/// What `on_actor_start` decided happened. A `Crashed` outcome is treated
/// identically to the callback returning `Err` — both are logged and the
/// actor is torn down immediately (spec: "failure is caught, logged, and
/// treated as equivalent to an immediate stop").
#[derive(Debug, Clone)]
pub enum ActorStartOutcome {
	Running,
	Crashed { code: i32, message: String },
}

/// What `on_actor_stop` decided happened; feeds `ActorStateStopped`'s
/// `code`/`message` fields.
#[derive(Debug, Clone)]
pub enum ActorStopOutcome {
	Ok,
	Crashed { code: i32, message: String },
}

impl Default for ActorStopOutcome {
	fn default() -> Self {
		ActorStopOutcome::Ok
	}
}

/// Handle given to a running actor so it can emit intents/alarms and make
/// KV calls without ever touching the core's state directly — every call
/// here is a message posted onto the core's mailbox, per the single
/// serialized owner design (spec §5, §9).
#[derive(Clone)]
pub struct ActorHandle {
	pub(crate) actor_id: String,
	pub(crate) generation: u32,
	pub(crate) emit_tx: mpsc::UnboundedSender<crate::core::CoreMsg>,
}

impl ActorHandle {
	pub fn actor_id(&self) -> &str {
		&self.actor_id
	}

	pub fn generation(&self) -> u32 {
		self.generation
	}

	/// Emit an `ActorIntent(sleep)` event. The actor is *not* removed from
	/// the registry — the server may later send `CommandStopActor` to
	/// fully evict it, but until then it remains addressable.
	pub fn send_sleep_intent(&self) {
		self.emit_event(rp::Event::EventActorIntent(rp::EventActorIntent {
			actor_id: self.actor_id.clone(),
			generation: self.generation,
			intent: rp::ActorIntent::ActorIntentSleep,
		}));
	}

	pub fn set_alarm(&self, alarm_ts: i64) {
		self.emit_event(rp::Event::EventActorSetAlarm(rp::EventActorSetAlarm {
			actor_id: self.actor_id.clone(),
			generation: self.generation,
			alarm_ts: Some(alarm_ts),
		}));
	}

	pub fn clear_alarm(&self) {
		self.emit_event(rp::Event::EventActorSetAlarm(rp::EventActorSetAlarm {
			actor_id: self.actor_id.clone(),
			generation: self.generation,
			alarm_ts: None,
		}));
	}

	fn emit_event(&self, event: rp::Event) {
		let _ = self.emit_tx.send(crate::core::CoreMsg::ActorEmit {
			actor_id: self.actor_id.clone(),
			generation: self.generation,
			event,
		});
	}

	pub async fn kv_get(&self, keys: Vec<Vec<u8>>) -> Result<Vec<Option<Vec<u8>>>, KvError> {
		let data = rp::KvRequestData::KvGetRequest(rp::KvGetRequest { keys: keys.clone() });
		match self.kv_call(data).await? {
			rp::KvResponseData::KvGetResponse(resp) => Ok(reorder_get_response(&keys, resp)),
			_ => Err(KvError::UnexpectedResponse),
		}
	}

	pub async fn kv_list_all(
		&self,
		reverse: Option<bool>,
		limit: Option<u64>,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
		self.kv_list(rp::KvListQuery::KvListAll, reverse, limit).await
	}

	pub async fn kv_list_range(
		&self,
		start: Vec<u8>,
		end: Vec<u8>,
		exclusive: Option<bool>,
		reverse: Option<bool>,
		limit: Option<u64>,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
		self.kv_list(
			rp::KvListQuery::KvListRange {
				start,
				end,
				exclusive,
			},
			reverse,
			limit,
		)
		.await
	}

	pub async fn kv_list_prefix(
		&self,
		prefix: Vec<u8>,
		reverse: Option<bool>,
		limit: Option<u64>,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
		self.kv_list(rp::KvListQuery::KvListPrefix { key: prefix }, reverse, limit)
			.await
	}

	async fn kv_list(
		&self,
		query: rp::KvListQuery,
		reverse: Option<bool>,
		limit: Option<u64>,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
		let data = rp::KvRequestData::KvListRequest(rp::KvListRequest {
			query,
			reverse,
			limit,
		});
		match self.kv_call(data).await? {
			rp::KvResponseData::KvListResponse(resp) => {
				Ok(resp.keys.into_iter().zip(resp.values).collect())
			}
			_ => Err(KvError::UnexpectedResponse),
		}
	}

	pub async fn kv_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), KvError> {
		let (keys, values) = entries.into_iter().unzip();
		let data = rp::KvRequestData::KvPutRequest(rp::KvPutRequest { keys, values });
		match self.kv_call(data).await? {
			rp::KvResponseData::KvPutResponse => Ok(()),
			_ => Err(KvError::UnexpectedResponse),
		}
	}

	pub async fn kv_delete(&self, keys: Vec<Vec<u8>>) -> Result<(), KvError> {
		let data = rp::KvRequestData::KvDeleteRequest(rp::KvDeleteRequest { keys });
		match self.kv_call(data).await? {
			rp::KvResponseData::KvDeleteResponse => Ok(()),
			_ => Err(KvError::UnexpectedResponse),
		}
	}

	pub async fn kv_drop(&self) -> Result<(), KvError> {
		match self.kv_call(rp::KvRequestData::KvDropRequest).await? {
			rp::KvResponseData::KvDropResponse => Ok(()),
			_ => Err(KvError::UnexpectedResponse),
		}
	}

	async fn kv_call(&self, data: rp::KvRequestData) -> Result<rp::KvResponseData, KvError> {
		let (respond, rx) = oneshot::channel();
		self.emit_tx
			.send(crate::core::CoreMsg::Kv {
				actor_id: self.actor_id.clone(),
				data,
				respond,
			})
			.map_err(|_| KvError::ShuttingDown)?;
		rx.await.map_err(|_| KvError::ShuttingDown)?
	}
}

/// Reorders a `KvGetResponse`'s parallel `keys`/`values` arrays to match
/// the order of `requested`, independently resolving duplicate requested
/// keys (source bug #4) and filling `None` for any requested key the
/// server omitted.
fn reorder_get_response(
	requested: &[Vec<u8>],
	resp: rp::KvGetResponse,
) -> Vec<Option<Vec<u8>>> {
	requested
		.iter()
		.map(|key| {
			resp.keys
				.iter()
				.position(|k| k == key)
				.map(|idx| resp.values[idx].clone())
		})
		.collect()
}
