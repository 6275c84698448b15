//! Per-session history store (C2): a `sled`-backed, single-writer, mutex-serialized log of flows.
//!
//! One store file per session (`flow.<name>.db`), with two logical collections living as
//! separate `sled` trees: `flow` (the records themselves, keyed by an auto-increment id with a
//! unique secondary index on `flow-id`) and `flow-mgr` (a single serialized [`StatusAggregate`]).
//! Tuning favors operator ergonomics over durability: `sled`'s default (non-fsync'd) mode is used
//! as-is, matching the spec's framing of this store as disposable history, not evidence.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::HistoryError;
use crate::flow::{PersistedFlow, StatusAggregate};

const FLOW_TREE: &str = "flow";
const INDEX_TREE: &str = "flow_index";
const MGR_TREE: &str = "flow-mgr";
const AGGREGATE_KEY: &[u8] = b"aggregate";

pub struct HistoryStore {
	dir: PathBuf,
	name: String,
	inner: Mutex<Inner>,
}

struct Inner {
	db: sled::Db,
	flow_tree: sled::Tree,
	index_tree: sled::Tree,
	mgr_tree: sled::Tree,
}

impl Inner {
	fn open(dir: &Path, name: &str) -> Result<Inner, HistoryError> {
		let path = store_path(dir, name);
		let db = sled::open(&path)?;
		let flow_tree = db.open_tree(FLOW_TREE)?;
		let index_tree = db.open_tree(INDEX_TREE)?;
		let mgr_tree = db.open_tree(MGR_TREE)?;
		Ok(Inner {
			db,
			flow_tree,
			index_tree,
			mgr_tree,
		})
	}

	fn aggregate(&self) -> Result<StatusAggregate, HistoryError> {
		match self.mgr_tree.get(AGGREGATE_KEY)? {
			Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
			None => Ok(StatusAggregate::default()),
		}
	}

	fn store_aggregate(&self, agg: &StatusAggregate) -> Result<(), HistoryError> {
		self
			.mgr_tree
			.insert(AGGREGATE_KEY, serde_json::to_vec(agg)?)?;
		Ok(())
	}
}

fn store_path(dir: &Path, name: &str) -> PathBuf {
	dir.join(format!("flow.{name}.db"))
}

impl HistoryStore {
	pub fn open(dir: impl Into<PathBuf>, name: impl Into<String>) -> Result<HistoryStore, HistoryError> {
		let dir = dir.into();
		let name = name.into();
		let inner = Inner::open(&dir, &name)?;
		Ok(HistoryStore {
			dir,
			name,
			inner: Mutex::new(inner),
		})
	}

	/// Saves `record` by unique `flow-id`, assigning its auto-increment `id`, then bumps the
	/// status aggregate using the bucketed (intentionally off-by-one) rule in
	/// [`crate::flow::StatusBucket`].
	pub fn upsert(&self, mut record: PersistedFlow) -> Result<(), HistoryError> {
		let inner = self.inner.lock();
		let id = inner.db.generate_id()?;
		record.id = id;
		let key = id.to_be_bytes();
		inner.flow_tree.insert(key, serde_json::to_vec(&record)?)?;
		inner
			.index_tree
			.insert(record.flow_id.as_bytes(), &key)?;

		let mut agg = inner.aggregate()?;
		agg.record(record.status_bucket());
		inner.store_aggregate(&agg)?;
		Ok(())
	}

	pub fn find(&self, flow_id: Uuid) -> Result<PersistedFlow, HistoryError> {
		let inner = self.inner.lock();
		let key = inner
			.index_tree
			.get(flow_id.as_bytes())?
			.ok_or(HistoryError::NotFound(flow_id))?;
		let raw = inner
			.flow_tree
			.get(&key)?
			.ok_or(HistoryError::NotFound(flow_id))?;
		Ok(serde_json::from_slice(&raw)?)
	}

	/// Reverse-chronological, paged, with `method == "CONNECT"` filtered out.
	pub fn history(
		&self,
		skip: usize,
		limit: usize,
	) -> Result<(StatusAggregate, Vec<PersistedFlow>), HistoryError> {
		let inner = self.inner.lock();
		let agg = inner.aggregate()?;
		let mut flows = Vec::with_capacity(limit.min(64));
		let iter = inner.flow_tree.iter().values().rev();
		let mut skipped = 0usize;
		for raw in iter {
			let raw = raw?;
			let record: PersistedFlow = serde_json::from_slice(&raw)?;
			if record.method.eq_ignore_ascii_case("CONNECT") {
				continue;
			}
			if skipped < skip {
				skipped += 1;
				continue;
			}
			if flows.len() >= limit {
				break;
			}
			flows.push(record);
		}
		Ok((agg, flows))
	}

	/// Clears every collection and the status aggregate, equivalent in effect to the source's
	/// close-delete-reopen (sled has no on-disk file to unlink mid-process, so this clears the
	/// trees in place rather than juggling file handles — see `DESIGN.md`).
	pub fn reset(&self) -> Result<(), HistoryError> {
		let inner = self.inner.lock();
		inner.flow_tree.clear()?;
		inner.index_tree.clear()?;
		inner.mgr_tree.clear()?;
		inner.db.flush()?;
		Ok(())
	}

	pub fn close(&self) -> Result<(), HistoryError> {
		let inner = self.inner.lock();
		inner.db.flush()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use uuid::Uuid;

	use super::*;

	fn record(method: &str, status: u16) -> PersistedFlow {
		PersistedFlow {
			id: 0,
			flow_id: Uuid::new_v4(),
			scheme: "http".into(),
			host: "a.test".into(),
			path: "/".into(),
			query: String::new(),
			method: method.into(),
			request_header: Default::default(),
			request_body: Default::default(),
			status_code: status,
			response_header: Default::default(),
			response_body: Default::default(),
			response_size: 0,
			captured_at: chrono::DateTime::UNIX_EPOCH,
		}
	}

	#[test]
	fn upsert_and_find_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let store = HistoryStore::open(dir.path(), "test").unwrap();
		let rec = record("GET", 200);
		let flow_id = rec.flow_id;
		store.upsert(rec).unwrap();
		let found = store.find(flow_id).unwrap();
		assert_eq!(found.flow_id, flow_id);
		assert_eq!(found.status_code, 200);
	}

	#[test]
	fn history_filters_connect_and_aggregates_status() {
		let dir = tempfile::tempdir().unwrap();
		let store = HistoryStore::open(dir.path(), "test").unwrap();
		store.upsert(record("GET", 200)).unwrap();
		// CONNECT is filtered from listings only, not from the aggregate: it still lands in
		// http_2xx below. 501 (not 500) is used for the 5xx case since `StatusBucket::classify`
		// faithfully excludes the range endpoints (`>500 && <599`) — see `flow.rs`.
		store.upsert(record("CONNECT", 200)).unwrap();
		store.upsert(record("POST", 501)).unwrap();

		let (agg, flows) = store.history(0, 10).unwrap();
		assert_eq!(flows.len(), 2);
		assert_eq!(agg.total, 3);
		assert_eq!(agg.http_2xx, 2);
		assert_eq!(agg.http_5xx, 1);
	}

	#[test]
	fn history_paging_respects_limit() {
		let dir = tempfile::tempdir().unwrap();
		let store = HistoryStore::open(dir.path(), "test").unwrap();
		for _ in 0..5 {
			store.upsert(record("GET", 200)).unwrap();
		}
		let (_, flows) = store.history(0, 2).unwrap();
		assert_eq!(flows.len(), 2);
	}

	#[test]
	fn reset_clears_flows_and_aggregate() {
		let dir = tempfile::tempdir().unwrap();
		let store = HistoryStore::open(dir.path(), "test").unwrap();
		store.upsert(record("GET", 200)).unwrap();
		store.reset().unwrap();
		let (agg, flows) = store.history(0, 10).unwrap();
		assert_eq!(agg.total, 0);
		assert!(flows.is_empty());
	}
}
