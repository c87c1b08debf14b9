//! Wire types for the Pegboard runner protocol.
//!
//! This mirrors the shape of `rivet-runner-protocol` as used by
//! `pegboard-runner` and the engine's own `TestRunner` harness, trimmed
//! to a single protocol version (the Runner Core treats the codec as a
//! provided primitive, not something it versions itself).

pub mod codec;

use serde::{Deserialize, Serialize};

/// Query-string protocol version advertised when opening the control
/// WebSocket (`?protocol_version=1&...`).
pub const PROTOCOL_VERSION: u16 = 1;

// ---- Outbound (runner -> server) ----------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToServer {
	ToServerInit(ToServerInit),
	ToServerPing(ToServerPing),
	ToServerEvents(Vec<EventWrapper>),
	ToServerAckCommands(ToServerAckCommands),
	ToServerStopping,
	ToServerKvRequest(ToServerKvRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorNameMetadata {
	pub metadata: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToServerInit {
	pub name: String,
	pub version: u32,
	pub total_slots: u32,
	/// `None` when the runner has never applied a command.
	pub last_command_idx: Option<i64>,
	pub prepopulate_actor_names: Option<std::collections::HashMap<String, ActorNameMetadata>>,
	/// Opaque, JSON-encoded metadata blob.
	pub metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToServerPing {
	pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToServerAckCommands {
	pub last_command_idx: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToServerKvRequest {
	pub actor_id: String,
	pub request_id: u32,
	pub data: KvRequestData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWrapper {
	pub index: u64,
	pub inner: Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
	EventActorStateUpdate(EventActorStateUpdate),
	EventActorIntent(EventActorIntent),
	EventActorSetAlarm(EventActorSetAlarm),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventActorStateUpdate {
	pub actor_id: String,
	pub generation: u32,
	pub state: ActorState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActorState {
	ActorStateRunning,
	ActorStateStopped(ActorStateStopped),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorStateStopped {
	pub code: StopCode,
	pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCode {
	Ok,
	Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventActorIntent {
	pub actor_id: String,
	pub generation: u32,
	pub intent: ActorIntent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ActorIntent {
	ActorIntentSleep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventActorSetAlarm {
	pub actor_id: String,
	pub generation: u32,
	pub alarm_ts: Option<i64>,
}

// ---- KV request payloads -------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvRequestData {
	KvGetRequest(KvGetRequest),
	KvListRequest(KvListRequest),
	KvPutRequest(KvPutRequest),
	KvDeleteRequest(KvDeleteRequest),
	KvDropRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvGetRequest {
	pub keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvListRequest {
	pub query: KvListQuery,
	pub reverse: Option<bool>,
	pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvListQuery {
	KvListAll,
	KvListRange {
		start: Vec<u8>,
		end: Vec<u8>,
		exclusive: Option<bool>,
	},
	KvListPrefix {
		key: Vec<u8>,
	},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvPutRequest {
	pub keys: Vec<Vec<u8>>,
	pub values: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvDeleteRequest {
	pub keys: Vec<Vec<u8>>,
}

// ---- Inbound (server -> runner) -----------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToClient {
	ToClientInit(ToClientInit),
	ToClientCommands(Vec<CommandWrapper>),
	ToClientAckEvents(ToClientAckEvents),
	ToClientKvResponse(ToClientKvResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToClientInit {
	pub runner_id: String,
	/// `-1` when the server has no durable event history for this runner yet.
	pub last_event_idx: i64,
	pub metadata: Option<ProtocolMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolMetadata {
	/// Milliseconds. `None` means the server never declares this runner lost.
	pub runner_lost_threshold: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandWrapper {
	pub index: i64,
	pub inner: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
	CommandStartActor(CommandStartActor),
	CommandStopActor(CommandStopActor),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStartActor {
	pub actor_id: String,
	pub generation: u32,
	pub config: ActorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
	pub name: String,
	pub key: Option<String>,
	/// Milliseconds since the epoch.
	pub create_ts: i64,
	pub input: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStopActor {
	pub actor_id: String,
	pub generation: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToClientAckEvents {
	pub last_event_idx: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToClientKvResponse {
	pub request_id: u32,
	pub data: KvResponseData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvResponseData {
	KvGetResponse(KvGetResponse),
	KvListResponse(KvListResponse),
	KvPutResponse,
	KvDeleteResponse,
	KvDropResponse,
	KvErrorResponse(KvErrorResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvGetResponse {
	pub keys: Vec<Vec<u8>>,
	pub values: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvListResponse {
	pub keys: Vec<Vec<u8>>,
	pub values: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvErrorResponse {
	pub message: String,
}
