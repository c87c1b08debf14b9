use std::collections::HashMap;

use rivet_runner_protocol as rp;

use crate::actor::{ActorConfig, ActorHandle};

/// A live actor as tracked by the core. Request/WebSocket id tracking
/// (spec §3) lives entirely in the external Tunnel — the registry only
/// needs identity and the handle given to the host callbacks.
pub struct ActorInstance {
	pub config: ActorConfig,
	pub handle: ActorHandle,
}

/// Owns the in-memory `actor_id -> ActorInstance` map. Pure logic: no I/O,
/// no async, so every invariant in spec §8 that's about registry shape can
/// be tested directly against this type.
#[derive(Default)]
pub struct ActorRegistry {
	actors: HashMap<String, ActorInstance>,
}

impl ActorRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts a fresh instance. Per spec §3's invariant, a `StartActor`
	/// for an `actor_id` already present is a protocol violation; we log
	/// and overwrite, preserving server-driven truth.
	pub fn insert(&mut self, actor_id: String, instance: ActorInstance) -> Option<ActorInstance> {
		if self.actors.contains_key(&actor_id) {
			tracing::warn!(
				actor_id,
				"StartActor for an actor_id already in the registry; overwriting"
			);
		}
		self.actors.insert(actor_id, instance)
	}

	pub fn remove(&mut self, actor_id: &str) -> Option<ActorInstance> {
		self.actors.remove(actor_id)
	}

	pub fn get(&self, actor_id: &str) -> Option<&ActorInstance> {
		self.actors.get(actor_id)
	}

	pub fn contains(&self, actor_id: &str) -> bool {
		self.actors.contains_key(actor_id)
	}

	pub fn len(&self) -> usize {
		self.actors.len()
	}

	pub fn is_empty(&self) -> bool {
		self.actors.is_empty()
	}

	pub fn actor_ids(&self) -> impl Iterator<Item = &str> {
		self.actors.keys().map(|s| s.as_str())
	}

	/// Every `(actor_id, generation)` currently registered, for bulk
	/// teardown (runner-lost) and for graceful-shutdown drain.
	pub fn snapshot_ids(&self) -> Vec<(String, u32)> {
		self.actors
			.iter()
			.map(|(id, inst)| (id.clone(), inst.config.generation))
			.collect()
	}
}

pub fn actor_state_event(actor_id: &str, generation: u32, state: rp::ActorState) -> rp::Event {
	rp::Event::EventActorStateUpdate(rp::EventActorStateUpdate {
		actor_id: actor_id.to_string(),
		generation,
		state,
	})
}
