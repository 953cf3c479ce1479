use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::asset_store::AssetStore;
use crate::config::Config;
use crate::db::open_db;
use crate::db::DB;
use crate::jobs::Jobs;
use crate::pipeline::PipelineJob;
use crate::upload::Uploads;
use crate::vector_index::VectorIndex;
use crate::vision::Models;

pub struct Context {
	pub config: Config,
	pub db: DB,
	pub assets: AssetStore,
	pub vectors: VectorIndex,
	pub jobs: Jobs,
	pub uploads: Uploads,
	pub models: Models,
	pipeline_tx: mpsc::Sender<PipelineJob>,
	segment_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
	pub cancel: CancellationToken,
}

impl Context {
	/// Build the shared state. The returned receiver feeds the pipeline
	/// worker pool (`pipeline::spawn_workers`).
	pub fn new(
		config: Config,
		models: Models,
	) -> anyhow::Result<(Arc<Context>, mpsc::Receiver<PipelineJob>)> {
		let db = DB::new(open_db(&config.db_path)?)?;
		let assets = AssetStore::new(config.assets_root.clone(), config.thumb_root.clone());
		let vectors = VectorIndex::new(config.vec_root.clone());
		let (pipeline_tx, pipeline_rx) = mpsc::channel(config.pipeline_queue_cap);
		let ctx = Arc::new(Context {
			config,
			db,
			assets,
			vectors,
			jobs: Jobs::new(),
			uploads: Uploads::new(),
			models,
			pipeline_tx,
			segment_locks: Mutex::new(HashMap::new()),
			cancel: CancellationToken::new(),
		});
		Ok((ctx, pipeline_rx))
	}

	#[cfg(test)]
	pub fn in_memory(
		config: Config,
		models: Models,
	) -> (Arc<Context>, mpsc::Receiver<PipelineJob>) {
		let db = DB::in_memory();
		let assets = AssetStore::new(config.assets_root.clone(), config.thumb_root.clone());
		let vectors = VectorIndex::new(config.vec_root.clone());
		let (pipeline_tx, pipeline_rx) = mpsc::channel(config.pipeline_queue_cap);
		let ctx = Arc::new(Context {
			config,
			db,
			assets,
			vectors,
			jobs: Jobs::new(),
			uploads: Uploads::new(),
			models,
			pipeline_tx,
			segment_locks: Mutex::new(HashMap::new()),
			cancel: CancellationToken::new(),
		});
		(ctx, pipeline_rx)
	}

	/// Queue one asset for the pipeline. Overflow drops the job with a
	/// warning; the reconciler picks the asset up on its next sweep.
	pub fn enqueue_pipeline(&self, job: PipelineJob) -> bool {
		match self.pipeline_tx.try_send(job) {
			Ok(_) => true,
			Err(mpsc::error::TrySendError::Full(job)) => {
				log::warn!(
					"pipeline queue full, dropping {}/{} (reconciler will retry)",
					job.device,
					job.relpath
				);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				log::error!("pipeline queue closed");
				false
			}
		}
	}

	pub fn queue_depth(&self) -> usize {
		self.pipeline_tx.max_capacity() - self.pipeline_tx.capacity()
	}

	pub fn over_capacity(&self) -> bool {
		self.queue_depth() > self.config.queue_high_water
	}

	/// Per-(device, date) advisory lock serializing segmentation.
	pub async fn segment_lock(&self, device: &str, date: &str) -> Arc<Mutex<()>> {
		let key = format!("{device}|{date}");
		let mut locks = self.segment_locks.lock().await;
		locks.entry(key).or_default().clone()
	}

	pub fn now_ms(&self) -> i64 {
		chrono::Utc::now().timestamp_millis()
	}
}
