use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

use crate::types::{RunError, RunRecord};

/// Append-only log of run attempts.
///
/// Only the launcher and the monitor loop hold write access; everyone else
/// gets cloned snapshots.
#[derive(Clone, Default)]
pub struct Statistics {
	records: Arc<RwLock<Vec<RunRecord>>>,
}

impl Statistics {
	pub fn new() -> Self {
		Self::default()
	}

	/// Open a record for a new attempt and return its index.
	pub(crate) async fn begin(&self) -> u64 {
		let mut records = self.records.write().await;
		let attempt = records.len() as u64;
		records.push(RunRecord::new(attempt));
		attempt
	}

	pub(crate) async fn set_pid(&self, attempt: u64, pid: u32) {
		let mut records = self.records.write().await;
		if let Some(record) = records.get_mut(attempt as usize) {
			record.pid = Some(pid);
		}
	}

	/// Close a record. A record that is already finished is left untouched.
	pub(crate) async fn finish(&self, attempt: u64, exit_code: Option<i32>, error: Option<RunError>) {
		let mut records = self.records.write().await;
		if let Some(record) = records.get_mut(attempt as usize) {
			if record.finish.is_some() {
				return;
			}
			let now = SystemTime::now();
			record.finish = Some(now.max(record.start));
			record.exit_code = exit_code;
			record.error = error;
		}
	}

	pub async fn snapshot(&self) -> Vec<RunRecord> {
		self.records.read().await.clone()
	}

	pub async fn len(&self) -> usize {
		self.records.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.records.read().await.is_empty()
	}

	pub async fn last(&self) -> Option<RunRecord> {
		self.records.read().await.last().cloned()
	}
}
