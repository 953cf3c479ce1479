use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::context::Context;
use crate::reconcile;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(3600);
const FACE_AGING_INTERVAL: Duration = Duration::from_secs(300);
const UPLOAD_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub fn spawn_background(ctx: Arc<Context>) {
	tokio::spawn(run_reconciler(ctx.clone()));
	tokio::spawn(run_face_aging(ctx.clone()));
	tokio::spawn(run_upload_sweeper(ctx));
}

/// Hourly reconciler: three-way sync, retention, segmentation refresh.
pub async fn run_reconciler(ctx: Arc<Context>) {
	loop {
		reconcile::run_once(&ctx).await;
		tokio::select! {
			_ = ctx.cancel.cancelled() => break,
			_ = sleep(RECONCILE_INTERVAL) => {}
		}
	}
	log::info!("reconciler exiting");
}

/// Faster cadence for aging out non-whitelisted face embeddings.
pub async fn run_face_aging(ctx: Arc<Context>) {
	loop {
		reconcile::age_faces(&ctx).await;
		tokio::select! {
			_ = ctx.cancel.cancelled() => break,
			_ = sleep(FACE_AGING_INTERVAL) => {}
		}
	}
}

/// Expire abandoned upload sessions and their partial files.
pub async fn run_upload_sweeper(ctx: Arc<Context>) {
	loop {
		let expired = ctx.uploads.expire_stale().await;
		if expired > 0 {
			log::info!("expired {} stale upload sessions", expired);
		}
		tokio::select! {
			_ = ctx.cancel.cancelled() => break,
			_ = sleep(UPLOAD_SWEEP_INTERVAL) => {}
		}
	}
}
