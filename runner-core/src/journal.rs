use std::time::{Duration, Instant};

use rivet_runner_protocol as rp;

/// One emitted event plus the local timestamp used for time-based
/// pruning only (spec §3 — the timestamp never goes over the wire).
#[derive(Clone)]
pub struct EventRecord {
	pub index: u64,
	pub inner: rp::Event,
	pub timestamp: Instant,
}

/// Assigns monotonic indices, buffers recent history for replay, and
/// prunes aged/acknowledged entries. Pure logic — no I/O — so every
/// journal-shaped invariant in spec §8 can be tested directly.
pub struct EventJournal {
	next_index: u64,
	history: Vec<EventRecord>,
	retention: Duration,
}

impl EventJournal {
	pub fn new(retention: Duration) -> Self {
		Self {
			next_index: 0,
			history: Vec::new(),
			retention,
		}
	}

	/// Assigns the next index, appends to history, and returns the wire
	/// wrapper to send. Indices are dense and strictly increasing for the
	/// lifetime of the process (spec invariant 1, 4).
	pub fn append(&mut self, event: rp::Event) -> rp::EventWrapper {
		let index = self.next_index;
		self.next_index += 1;

		self.history.push(EventRecord {
			index,
			inner: event.clone(),
			timestamp: Instant::now(),
		});

		rp::EventWrapper { index, inner: event }
	}

	pub fn next_index(&self) -> u64 {
		self.next_index
	}

	/// Every history entry with `index > last_event_idx`, in ascending
	/// order, for the reconnect replay batch (spec invariant 3).
	///
	/// `last_event_idx` arrives over the wire as `i64` with `-1` meaning
	/// "nothing acknowledged yet"; entries are keyed by `u64`, so the
	/// comparison is done after clamping the sentinel to "before index 0".
	pub fn entries_after(&self, last_event_idx: i64) -> Vec<rp::EventWrapper> {
		self.history
			.iter()
			.filter(|record| last_event_idx < 0 || record.index > last_event_idx as u64)
			.map(|record| rp::EventWrapper {
				index: record.index,
				inner: record.inner.clone(),
			})
			.collect()
	}

	/// Drops history entries older than `retention`, run every 60s.
	pub fn prune_aged(&mut self, now: Instant) {
		self.history
			.retain(|record| now.duration_since(record.timestamp) < self.retention);
	}

	/// Drops history entries the server has acknowledged
	/// (`ToClientAckEvents`). This is in addition to, not instead of,
	/// time-based pruning — it only ever removes history, never
	/// renumbers it, so it cannot reintroduce an index gap.
	pub fn truncate_acked(&mut self, last_event_idx: u64) {
		let before = self.history.len();
		self.history.retain(|record| record.index > last_event_idx);
		let pruned = before - self.history.len();
		if pruned > 0 {
			tracing::debug!(last_event_idx, pruned, "pruned acknowledged events");
		}
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.history.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn running_event(actor_id: &str) -> rp::Event {
		rp::Event::EventActorStateUpdate(rp::EventActorStateUpdate {
			actor_id: actor_id.to_string(),
			generation: 1,
			state: rp::ActorState::ActorStateRunning,
		})
	}

	#[test]
	fn indices_are_dense_and_increasing() {
		let mut journal = EventJournal::new(Duration::from_secs(300));
		let w0 = journal.append(running_event("a"));
		let w1 = journal.append(running_event("b"));
		let w2 = journal.append(running_event("c"));
		assert_eq!((w0.index, w1.index, w2.index), (0, 1, 2));
		assert_eq!(journal.next_index(), 3);
	}

	#[test]
	fn replay_returns_only_entries_after_last_acked() {
		let mut journal = EventJournal::new(Duration::from_secs(300));
		for c in ["a", "b", "c", "d", "e"] {
			journal.append(running_event(c));
		}

		let replay = journal.entries_after(2);
		let indices: Vec<u64> = replay.iter().map(|w| w.index).collect();
		assert_eq!(indices, vec![3, 4]);
	}

	#[test]
	fn replay_with_negative_sentinel_returns_everything() {
		let mut journal = EventJournal::new(Duration::from_secs(300));
		journal.append(running_event("a"));
		journal.append(running_event("b"));

		let replay = journal.entries_after(-1);
		assert_eq!(replay.len(), 2);
	}

	#[test]
	fn ack_truncation_never_renumbers() {
		let mut journal = EventJournal::new(Duration::from_secs(300));
		for c in ["a", "b", "c"] {
			journal.append(running_event(c));
		}
		journal.truncate_acked(1);
		assert_eq!(journal.len(), 1);
		let remaining = journal.entries_after(-1);
		assert_eq!(remaining[0].index, 2);
	}

	#[test]
	fn prunes_entries_older_than_retention() {
		let mut journal = EventJournal::new(Duration::from_millis(10));
		journal.append(running_event("a"));
		std::thread::sleep(Duration::from_millis(20));
		journal.append(running_event("b"));

		journal.prune_aged(Instant::now());
		assert_eq!(journal.len(), 1);
	}
}
