use std::{
	collections::BTreeMap,
	time::{Duration, Instant},
};

use rivet_runner_protocol as rp;
use tokio::sync::oneshot;

use crate::error::KvError;

pub struct KvRequestEntry {
	pub actor_id: String,
	pub data: rp::KvRequestData,
	respond: oneshot::Sender<Result<rp::KvResponseData, KvError>>,
	pub sent: bool,
	pub timestamp: Instant,
}

/// Assigns request ids, tracks pending KV requests, and knows which ones
/// still need to be flushed once the control socket opens. Request ids
/// are allocated monotonically and never reused, so a `BTreeMap` keyed by
/// id iterates in insertion order for free — which is exactly the order
/// spec §4.5 requires requeued entries to flush in.
pub struct KvBroker {
	next_request_id: u32,
	pending: BTreeMap<u32, KvRequestEntry>,
	expire: Duration,
}

impl KvBroker {
	pub fn new(expire: Duration) -> Self {
		Self {
			next_request_id: 0,
			pending: BTreeMap::new(),
			expire,
		}
	}

	/// Allocates a request id and records a pending entry as not-yet-sent.
	/// The caller (the core loop) decides whether the socket is open and,
	/// if so, immediately calls [`Self::mark_sent`] after writing the frame.
	pub fn enqueue(
		&mut self,
		actor_id: String,
		data: rp::KvRequestData,
		respond: oneshot::Sender<Result<rp::KvResponseData, KvError>>,
	) -> u32 {
		let request_id = self.next_request_id;
		self.next_request_id = self.next_request_id.wrapping_add(1);

		self.pending.insert(
			request_id,
			KvRequestEntry {
				actor_id,
				data,
				respond,
				sent: false,
				timestamp: Instant::now(),
			},
		);

		request_id
	}

	pub fn mark_sent(&mut self, request_id: u32) {
		if let Some(entry) = self.pending.get_mut(&request_id) {
			entry.sent = true;
			entry.timestamp = Instant::now();
		}
	}

	/// Every entry that still needs sending, in insertion order. Marks them
	/// all as sent (refreshing their expiry clock) — the caller is
	/// expected to actually write the frames right after calling this.
	pub fn drain_unsent(&mut self) -> Vec<(u32, String, rp::KvRequestData)> {
		let mut out = Vec::new();
		for (id, entry) in self.pending.iter_mut() {
			if !entry.sent {
				entry.sent = true;
				entry.timestamp = Instant::now();
				out.push((*id, entry.actor_id.clone(), entry.data.clone()));
			}
		}
		out
	}

	/// Resolves a caller's pending entry with the server's response.
	/// Logs and drops responses for unknown request ids (spec §7).
	pub fn handle_response(&mut self, request_id: u32, data: rp::KvResponseData) {
		let Some(entry) = self.pending.remove(&request_id) else {
			tracing::warn!(request_id, "received kv response for unknown request id");
			return;
		};

		let result = match data {
			rp::KvResponseData::KvErrorResponse(err) => Err(KvError::Server(err.message)),
			other => Ok(other),
		};
		let _ = entry.respond.send(result);
	}

	/// Sweeps entries whose `timestamp` predates `KV_EXPIRE`, rejecting
	/// each with a timeout error and removing it. Returns the count
	/// expired, for logging.
	pub fn expire_stale(&mut self, now: Instant) -> usize {
		let expired_ids: Vec<u32> = self
			.pending
			.iter()
			.filter(|(_, entry)| now.duration_since(entry.timestamp) >= self.expire)
			.map(|(id, _)| *id)
			.collect();

		for id in &expired_ids {
			if let Some(entry) = self.pending.remove(id) {
				let _ = entry.respond.send(Err(KvError::Timeout(self.expire)));
			}
		}

		expired_ids.len()
	}

	/// Rejects every pending entry (sent or not) with a shutdown error.
	pub fn reject_all_for_shutdown(&mut self) {
		for (_, entry) in std::mem::take(&mut self.pending) {
			let _ = entry.respond.send(Err(KvError::ShuttingDown));
		}
	}

	#[cfg(test)]
	pub fn pending_count(&self) -> usize {
		self.pending.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn get_data() -> rp::KvRequestData {
		rp::KvRequestData::KvGetRequest(rp::KvGetRequest {
			keys: vec![b"k".to_vec()],
		})
	}

	#[test]
	fn queued_requests_flush_in_insertion_order() {
		let mut broker = KvBroker::new(Duration::from_secs(30));
		let (tx1, _rx1) = oneshot::channel();
		let (tx2, _rx2) = oneshot::channel();
		let (tx3, _rx3) = oneshot::channel();
		let id1 = broker.enqueue("a".to_string(), get_data(), tx1);
		let id2 = broker.enqueue("a".to_string(), get_data(), tx2);
		let id3 = broker.enqueue("a".to_string(), get_data(), tx3);

		let flushed = broker.drain_unsent();
		let ids: Vec<u32> = flushed.iter().map(|(id, _, _)| *id).collect();
		assert_eq!(ids, vec![id1, id2, id3]);
		assert_eq!(broker.drain_unsent().len(), 0, "already marked sent");
	}

	#[tokio::test]
	async fn expiration_rejects_with_timeout_and_empties_map() {
		let mut broker = KvBroker::new(Duration::from_millis(10));
		let (tx, rx) = oneshot::channel();
		broker.enqueue("a".to_string(), get_data(), tx);

		tokio::time::sleep(Duration::from_millis(20)).await;
		let expired = broker.expire_stale(Instant::now());
		assert_eq!(expired, 1);
		assert_eq!(broker.pending_count(), 0);

		let result = rx.await.unwrap();
		assert!(matches!(result, Err(KvError::Timeout(_))));
	}

	#[tokio::test]
	async fn shutdown_rejects_everything_outstanding() {
		let mut broker = KvBroker::new(Duration::from_secs(30));
		let (tx, rx) = oneshot::channel();
		broker.enqueue("a".to_string(), get_data(), tx);

		broker.reject_all_for_shutdown();
		assert_eq!(broker.pending_count(), 0);
		assert!(matches!(rx.await.unwrap(), Err(KvError::ShuttingDown)));
	}

	#[tokio::test]
	async fn unknown_request_id_is_ignored() {
		let mut broker = KvBroker::new(Duration::from_secs(30));
		// No panic, no effect.
		broker.handle_response(
			999,
			rp::KvResponseData::KvGetResponse(rp::KvGetResponse {
				keys: vec![],
				values: vec![],
			}),
		);
		assert_eq!(broker.pending_count(), 0);
	}
}
