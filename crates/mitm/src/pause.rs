//! Flow pause registry (C4): per-session map from flow-id to a suspension handle.
//!
//! A pipeline task that needs to intercept a flow registers a handle via [`initiate`], blocks in
//! [`await_decision`], and the read loop (on receiving an edit) or a rule-disable event (draining
//! all pending pauses) wakes it via [`deliver`]/[`drain_all`]. The `Notify`-based wakeup follows
//! the usual "create the `notified()` future before checking shared state" idiom so a `deliver`
//! racing with `await_decision`'s setup can never be missed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::codec::EditDecision;

struct Handle {
	notify: Arc<Notify>,
	decision: Mutex<Option<EditDecision>>,
}

/// Per-session registry. `initiate`/`deliver`/`drain_all` take a short lock on the handle map;
/// `await_decision` only ever touches its own handle's `Notify` + slot after that.
#[derive(Default)]
pub struct PauseRegistry {
	handles: Mutex<HashMap<Uuid, Arc<Handle>>>,
}

impl PauseRegistry {
	pub fn new() -> PauseRegistry {
		PauseRegistry::default()
	}

	/// Returns the handle for `flow_id`, creating one if this is the first suspend.
	fn initiate(&self, flow_id: Uuid) -> Arc<Handle> {
		let mut handles = self.handles.lock();
		handles
			.entry(flow_id)
			.or_insert_with(|| {
				Arc::new(Handle {
					notify: Arc::new(Notify::new()),
					decision: Mutex::new(None),
				})
			})
			.clone()
	}

	/// Delivers `decision` for `flow_id` and wakes whoever is awaiting it. A second delivery for
	/// the same still-pending flow-id is a no-op — at most one decision is ever delivered per
	/// pause cycle.
	pub fn deliver(&self, flow_id: Uuid, decision: EditDecision) {
		let handle = {
			let handles = self.handles.lock();
			match handles.get(&flow_id) {
				Some(h) => h.clone(),
				None => return,
			}
		};
		let mut slot = handle.decision.lock();
		if slot.is_some() {
			return;
		}
		*slot = Some(decision);
		drop(slot);
		handle.notify.notify_waiters();
	}

	/// Suspends the calling task until a decision is delivered for `flow_id`, then removes the
	/// entry and returns the decision. Creating the handle here (rather than requiring the caller
	/// to call `initiate` first) keeps "first suspend creates the entry" in one place.
	pub async fn await_decision(&self, flow_id: Uuid) -> EditDecision {
		let handle = self.initiate(flow_id);
		loop {
			let notified = handle.notify.notified();
			if let Some(decision) = handle.decision.lock().take() {
				self.handles.lock().remove(&flow_id);
				return decision;
			}
			notified.await;
			if let Some(decision) = handle.decision.lock().take() {
				self.handles.lock().remove(&flow_id);
				return decision;
			}
		}
	}

	/// Delivers a synthetic `interceptor-off` decision to every pending handle, without removing
	/// them — owners still `await_decision`-then-remove normally. Used when the breakpoint rule
	/// is disabled or the session is torn down.
	pub fn drain_all(&self) {
		let handles: Vec<Arc<Handle>> = self.handles.lock().values().cloned().collect();
		for handle in handles {
			let mut slot = handle.decision.lock();
			if slot.is_none() {
				*slot = Some(EditDecision::InterceptorOff);
				drop(slot);
				handle.notify.notify_waiters();
			}
		}
	}

	pub fn is_empty(&self) -> bool {
		self.handles.lock().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn deliver_before_await_is_observed() {
		let registry = PauseRegistry::new();
		let id = Uuid::new_v4();
		registry.deliver(id, EditDecision::DropRequest);
		let decision = tokio::time::timeout(Duration::from_secs(1), registry.await_decision(id))
			.await
			.unwrap();
		assert!(matches!(decision, EditDecision::DropRequest));
		assert!(registry.is_empty());
	}

	#[tokio::test]
	async fn deliver_after_await_wakes_waiter() {
		let registry = Arc::new(PauseRegistry::new());
		let id = Uuid::new_v4();
		let r2 = registry.clone();
		let waiter = tokio::spawn(async move { r2.await_decision(id).await });

		tokio::time::sleep(Duration::from_millis(20)).await;
		registry.deliver(id, EditDecision::DropResponse);

		let decision = tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.unwrap()
			.unwrap();
		assert!(matches!(decision, EditDecision::DropResponse));
	}

	#[tokio::test]
	async fn second_delivery_is_a_no_op() {
		let registry = PauseRegistry::new();
		let id = Uuid::new_v4();
		registry.deliver(id, EditDecision::DropRequest);
		registry.deliver(id, EditDecision::DropResponse);
		let decision = registry.await_decision(id).await;
		assert!(matches!(decision, EditDecision::DropRequest));
	}

	#[tokio::test]
	async fn drain_all_releases_pending_without_removing_until_awaited() {
		let registry = Arc::new(PauseRegistry::new());
		let id = Uuid::new_v4();
		let r2 = registry.clone();
		let waiter = tokio::spawn(async move { r2.await_decision(id).await });

		tokio::time::sleep(Duration::from_millis(20)).await;
		registry.drain_all();

		let decision = tokio::time::timeout(Duration::from_secs(1), waiter)
			.await
			.unwrap()
			.unwrap();
		assert!(matches!(decision, EditDecision::InterceptorOff));
	}
}
