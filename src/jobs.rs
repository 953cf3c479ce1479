use std::collections::HashMap;
use std::collections::HashSet;

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::JobStatus;

/// Share of job progress covered by archive extraction; the per-asset
/// pipeline accounts for the rest.
pub const EXTRACT_SHARE: f32 = 0.3;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
	pub job_id: String,
	pub status: JobStatus,
	pub progress: f32,
	pub message: String,
}

#[derive(Debug)]
struct JobState {
	status: JobStatus,
	progress: f32,
	message: String,
	device: String,
	tracked: Vec<String>,
	remaining: usize,
	errors: Vec<String>,
	affected_dates: HashSet<String>,
}

/// In-memory ProcessingJob registry. Jobs are ephemeral; a restart loses
/// them and the reconciler re-drives any half-processed assets.
#[derive(Debug, Default)]
pub struct Jobs {
	inner: Mutex<HashMap<String, JobState>>,
}

impl Jobs {
	pub fn new() -> Jobs {
		Jobs::default()
	}

	pub async fn create(&self, device: &str) -> String {
		let job_id = Uuid::new_v4().to_string();
		let mut inner = self.inner.lock().await;
		inner.insert(
			job_id.clone(),
			JobState {
				status: JobStatus::Pending,
				progress: 0.0,
				message: String::new(),
				device: device.to_string(),
				tracked: Vec::new(),
				remaining: 0,
				errors: Vec::new(),
				affected_dates: HashSet::new(),
			},
		);
		job_id
	}

	pub async fn get(&self, job_id: &str) -> Option<JobSnapshot> {
		let inner = self.inner.lock().await;
		inner.get(job_id).map(|job| JobSnapshot {
			job_id: job_id.to_string(),
			status: job.status,
			progress: job.progress,
			message: job.message.clone(),
		})
	}

	pub async fn set_processing(&self, job_id: &str, message: &str) {
		let mut inner = self.inner.lock().await;
		if let Some(job) = inner.get_mut(job_id) {
			job.status = JobStatus::Processing;
			job.message = message.to_string();
		}
	}

	/// Progress during archive extraction, scaled into `[0, EXTRACT_SHARE]`.
	pub async fn extraction_progress(&self, job_id: &str, done: usize, total: usize) {
		let mut inner = self.inner.lock().await;
		if let Some(job) = inner.get_mut(job_id) {
			if total > 0 {
				job.progress = done as f32 / total as f32 * EXTRACT_SHARE;
			}
			job.message = format!("Saved {done}/{total} files.");
		}
	}

	/// Register the canonical relpaths the pipeline will consume. Progress
	/// jumps to the end of the extraction share.
	pub async fn track_files(&self, job_id: &str, files: Vec<String>, dates: HashSet<String>) {
		let mut inner = self.inner.lock().await;
		if let Some(job) = inner.get_mut(job_id) {
			job.remaining = files.len();
			job.tracked = files;
			job.affected_dates = dates;
			job.progress = EXTRACT_SHARE;
		}
	}

	/// Record one processed pipeline item. Returns the affected device and
	/// dates once the last item is in, so the caller can finalize.
	pub async fn item_done(
		&self,
		job_id: &str,
		error: Option<String>,
	) -> Option<(String, Vec<String>)> {
		let mut inner = self.inner.lock().await;
		let job = inner.get_mut(job_id)?;
		if let Some(err) = error {
			job.errors.push(err);
		}
		if job.remaining > 0 {
			job.remaining -= 1;
		}
		let total = job.tracked.len().max(1);
		let done = job.tracked.len() - job.remaining;
		job.progress = EXTRACT_SHARE + (1.0 - EXTRACT_SHARE) * done as f32 / total as f32;
		if job.remaining == 0 {
			let dates: Vec<String> = job.affected_dates.iter().cloned().collect();
			Some((job.device.clone(), dates))
		} else {
			None
		}
	}

	/// Terminal success, possibly partial. Per-asset errors never fail the
	/// job; they end up in the message.
	pub async fn finish(&self, job_id: &str) {
		let mut inner = self.inner.lock().await;
		if let Some(job) = inner.get_mut(job_id) {
			job.status = JobStatus::Done;
			job.progress = 1.0;
			job.message = if job.errors.is_empty() {
				format!("Processed {} files.", job.tracked.len())
			} else {
				format!(
					"Processed {} files, {} failed: {}",
					job.tracked.len(),
					job.errors.len(),
					job.errors.join("; ")
				)
			};
		}
	}

	/// Total failure (archive unreadable and the like).
	pub async fn fail(&self, job_id: &str, message: &str) {
		let mut inner = self.inner.lock().await;
		if let Some(job) = inner.get_mut(job_id) {
			job.status = JobStatus::Error;
			job.progress = 0.0;
			job.message = message.to_string();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn progress_is_monotonic_over_items() {
		let jobs = Jobs::new();
		let id = jobs.create("dev1").await;
		jobs.set_processing(&id, "extracting").await;
		jobs.extraction_progress(&id, 1, 2).await;
		let p0 = jobs.get(&id).await.unwrap().progress;
		assert!(p0 > 0.0 && p0 <= EXTRACT_SHARE);

		jobs.track_files(
			&id,
			vec!["a".into(), "b".into()],
			HashSet::from(["2025-01-01".to_string()]),
		)
		.await;
		assert_eq!(jobs.get(&id).await.unwrap().progress, EXTRACT_SHARE);

		assert!(jobs.item_done(&id, None).await.is_none());
		let p1 = jobs.get(&id).await.unwrap().progress;
		assert!(p1 > EXTRACT_SHARE && p1 < 1.0);

		let finalize = jobs.item_done(&id, None).await;
		assert_eq!(
			finalize,
			Some(("dev1".to_string(), vec!["2025-01-01".to_string()]))
		);
		jobs.finish(&id).await;
		let snap = jobs.get(&id).await.unwrap();
		assert_eq!(snap.status, JobStatus::Done);
		assert_eq!(snap.progress, 1.0);
	}

	#[tokio::test]
	async fn item_errors_keep_job_done() {
		let jobs = Jobs::new();
		let id = jobs.create("dev1").await;
		jobs.track_files(&id, vec!["a".into()], HashSet::new()).await;
		let finalize = jobs.item_done(&id, Some("a: decode failed".into())).await;
		assert!(finalize.is_some());
		jobs.finish(&id).await;
		let snap = jobs.get(&id).await.unwrap();
		assert_eq!(snap.status, JobStatus::Done);
		assert!(snap.message.contains("decode failed"));
	}

	#[tokio::test]
	async fn unknown_job_is_none() {
		let jobs = Jobs::new();
		assert!(jobs.get("nope").await.is_none());
	}
}
