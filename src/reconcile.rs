use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::context::Context;
use crate::db::AssetQuery;
use crate::pipeline::PipelineJob;
use crate::segmenter;
use crate::types::split_relpath;
use crate::vector_index::vector_id;
use crate::vector_index::DEFAULT_MODEL;
use crate::vector_index::FACE_DIM;
use crate::vector_index::FACE_MODEL;

/// Full physical cleanup of one asset across all three stores: bytes,
/// thumbnail, record row, embeddings. Idempotent and safe to re-run after
/// a partial failure.
pub async fn cleanup_asset(ctx: &Arc<Context>, device: &str, relpath: &str) -> anyhow::Result<()> {
	ctx.assets.delete(device, relpath).await?;
	ctx.assets.delete_thumbnail(device, relpath).await?;
	if let Some((date, stem, _)) = split_relpath(relpath) {
		// Video keyframes live next to the thumbnails.
		let frame = ctx
			.config
			.thumb_root
			.join(device)
			.join(&date)
			.join(format!("{stem}.frame.jpg"));
		let _ = tokio::fs::remove_file(frame).await;
	}

	let collection = ctx
		.vectors
		.collection(device, DEFAULT_MODEL, ctx.models.encoder.dim())
		.await?;
	collection.delete(&vector_id(relpath)).await?;
	let faces = ctx.vectors.collection(device, FACE_MODEL, FACE_DIM).await?;
	let relpath_owned = relpath.to_string();
	faces.delete_where(|r| r.path == relpath_owned).await?;

	ctx.db.purge_asset(device, relpath).await?;
	log::info!("cleaned up {}/{} across all stores", device, relpath);
	Ok(())
}

/// One reconciler sweep: three-way sync per device, then retention, then
/// segmentation refresh and lazy segment-id compaction. Errors are logged
/// and the sweep moves on; the next cycle retries.
pub async fn run_once(ctx: &Arc<Context>) {
	let mut devices: HashSet<String> = HashSet::new();
	match ctx.assets.list_devices().await {
		Ok(found) => devices.extend(found),
		Err(err) => log::error!("cannot list asset devices: {}", err),
	}
	match ctx.db.all_devices().await {
		Ok(found) => devices.extend(found),
		Err(err) => log::error!("cannot list record devices: {}", err),
	}

	for device in &devices {
		if ctx.cancel.is_cancelled() {
			return;
		}
		if let Err(err) = sync_device(ctx, device).await {
			log::error!("three-way sync failed for {}: {}", device, err);
		}
	}

	if let Err(err) = apply_retention(ctx).await {
		log::error!("retention sweep failed: {}", err);
	}

	refresh_segmentation(ctx, &devices).await;
}

/// Resolve the set differences between filesystem, record store and vector
/// index for one device.
async fn sync_device(ctx: &Arc<Context>, device: &str) -> anyhow::Result<()> {
	let fs_paths: HashSet<String> = ctx.assets.list_assets(device).await?.into_iter().collect();
	let records = ctx
		.db
		.find_assets(&AssetQuery {
			device: Some(device.to_string()),
			..Default::default()
		})
		.await?;
	let by_path: HashMap<String, &crate::types::AssetRecord> =
		records.iter().map(|r| (r.path.clone(), r)).collect();

	// On disk but unknown to the record store: run the pipeline from the
	// top. Also re-drive known records with missing derived artifacts; the
	// stage logic resumes from whatever survives.
	for path in &fs_paths {
		let is_asset = split_relpath(path)
			.and_then(|(_, _, ext)| crate::types::AssetKind::from_ext(&ext))
			.is_some();
		if !is_asset {
			// Interrupted temp files and other strays are not ours to process.
			continue;
		}
		match by_path.get(path) {
			None => {
				ctx.enqueue_pipeline(PipelineJob {
					device: device.to_string(),
					relpath: path.clone(),
					job_id: None,
				});
			}
			Some(record) if !record.deleted => {
				let thumb_missing = !ctx.assets.thumbnail_exists(device, path).await;
				let needs_stages = !record.stage.detected
					|| !record.stage.redacted
					|| !record.stage.embedded
					|| thumb_missing;
				if needs_stages {
					ctx.enqueue_pipeline(PipelineJob {
						device: device.to_string(),
						relpath: path.clone(),
						job_id: None,
					});
				}
			}
			Some(_) => {}
		}
	}

	// Known to the record store but gone from disk: tombstone, or purge
	// everything once the tombstone already exists.
	let now = ctx.now_ms();
	for record in &records {
		if fs_paths.contains(&record.path) {
			continue;
		}
		if record.deleted {
			cleanup_asset(ctx, device, &record.path).await?;
		} else {
			log::warn!(
				"{}/{} lost its file, marking deleted",
				device,
				record.path
			);
			ctx.db.mark_deleted(device, &record.path, now).await?;
		}
	}

	// Vectors without a backing file: drop them.
	let collection = ctx
		.vectors
		.collection(device, DEFAULT_MODEL, ctx.models.encoder.dim())
		.await?;
	for (id, path) in collection.paths().await {
		if !fs_paths.contains(&path) {
			log::warn!("dropping orphan embedding {} of {}", id, device);
			collection.delete(&id).await?;
		}
	}
	let faces = ctx.vectors.collection(device, FACE_MODEL, FACE_DIM).await?;
	faces
		.delete_where(|r| !fs_paths.contains(&r.path))
		.await?;
	Ok(())
}

/// Physically remove soft-deleted assets whose retention window elapsed.
async fn apply_retention(ctx: &Arc<Context>) -> anyhow::Result<()> {
	let cutoff = ctx.now_ms() - ctx.config.retention_days * 24 * 3600 * 1000;
	let expired = ctx.db.expired_deleted(cutoff).await?;
	for (device, path) in expired {
		if let Err(err) = cleanup_asset(ctx, &device, &path).await {
			log::error!("retention cleanup failed for {}/{}: {}", device, path, err);
		}
	}
	Ok(())
}

async fn refresh_segmentation(ctx: &Arc<Context>, devices: &HashSet<String>) {
	match ctx.db.unsegmented_dates().await {
		Ok(pending) => {
			for (device, date) in pending {
				if let Err(err) = segmenter::resegment(ctx, &device, &date).await {
					log::error!("segmentation refresh failed for {}/{}: {}", device, date, err);
				}
			}
		}
		Err(err) => log::error!("cannot list unsegmented dates: {}", err),
	}

	// Deletions and suffix-only reassignment leave id gaps behind; compact
	// them back onto a dense prefix.
	for device in devices {
		let dates = match ctx.db.all_dates(device).await {
			Ok(dates) => dates,
			Err(err) => {
				log::error!("cannot list dates of {}: {}", device, err);
				continue;
			}
		};
		for date in dates {
			if let Err(err) = segmenter::compact_ids(ctx, device, &date).await {
				log::error!("compaction failed for {}/{}: {}", device, date, err);
			}
		}
	}
}

/// Age out face embeddings older than the TTL unless whitelisted. Runs on
/// a faster cadence than the full sweep.
pub async fn age_faces(ctx: &Arc<Context>) {
	let cutoff = ctx.now_ms() - ctx.config.face_ttl_secs * 1000;
	let mut devices: HashSet<String> = HashSet::new();
	if let Ok(found) = ctx.db.all_devices().await {
		devices.extend(found);
	}
	for device in devices {
		let faces = match ctx.vectors.collection(&device, FACE_MODEL, FACE_DIM).await {
			Ok(c) => c,
			Err(err) => {
				log::error!("cannot open face collection of {}: {}", device, err);
				continue;
			}
		};
		match faces
			.delete_where(|r| {
				r.timestamp.map(|ts| ts < cutoff).unwrap_or(false) && r.whitelist != Some(true)
			})
			.await
		{
			Ok(0) => {}
			Ok(n) => log::info!("aged out {} face embeddings of {}", n, device),
			Err(err) => log::error!("face aging failed for {}: {}", device, err),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::testing::test_ctx;
	use crate::context::testing::TEST_DIM;
	use crate::db::NewAsset;
	use crate::types::parse_capture_time;
	use crate::types::AssetKind;
	use crate::vector_index::VectorRecord;

	async fn land_full(
		ctx: &Arc<Context>,
		device: &str,
		stem: &str,
	) -> String {
		let ms = parse_capture_time(stem).unwrap();
		let (path, date) = crate::types::canonical_relpath(ms, "jpg").unwrap();
		ctx.assets.put(device, &path, b"bytes").await.unwrap();
		ctx.assets
			.write_thumbnail(device, &path, b"thumb")
			.await
			.unwrap();
		ctx.db
			.insert_asset(&NewAsset {
				device: device.into(),
				path: path.clone(),
				date,
				capture_time: ms,
				kind: AssetKind::Image,
				content_hash: None,
			})
			.await
			.unwrap();
		ctx.db.set_detections(device, &path, &[], &[]).await.unwrap();
		ctx.db
			.set_thumbnail(device, &path, "thumb.webp")
			.await
			.unwrap();
		ctx.db.set_embedded(device, &path).await.unwrap();
		let collection = ctx
			.vectors
			.collection(device, DEFAULT_MODEL, TEST_DIM)
			.await
			.unwrap();
		collection
			.insert(VectorRecord {
				id: vector_id(&path),
				path: path.clone(),
				vector: vec![1.0; TEST_DIM],
				timestamp: None,
				whitelist: None,
			})
			.await
			.unwrap();
		path
	}

	#[tokio::test]
	async fn cleanup_asset_clears_all_stores() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		let path = land_full(&ctx, "dev1", "20250101_093000").await;
		let faces = ctx
			.vectors
			.collection("dev1", FACE_MODEL, FACE_DIM)
			.await
			.unwrap();
		faces
			.insert(VectorRecord {
				id: format!("{}_0", vector_id(&path)),
				path: path.clone(),
				vector: vec![1.0; FACE_DIM],
				timestamp: Some(0),
				whitelist: Some(false),
			})
			.await
			.unwrap();

		cleanup_asset(&ctx, "dev1", &path).await.unwrap();
		assert!(!ctx.assets.exists("dev1", &path).await);
		assert!(!ctx.assets.thumbnail_exists("dev1", &path).await);
		assert!(ctx.db.get_asset("dev1", &path).await.unwrap().is_none());
		let collection = ctx
			.vectors
			.collection("dev1", DEFAULT_MODEL, TEST_DIM)
			.await
			.unwrap();
		assert_eq!(collection.len().await, 0);
		assert_eq!(faces.len().await, 0);
		// Idempotent.
		cleanup_asset(&ctx, "dev1", &path).await.unwrap();
	}

	#[tokio::test]
	async fn orphan_file_is_requeued() {
		let (ctx, mut rx, _enc, _dir) = test_ctx();
		ctx.assets
			.put("dev1", "2025-01-01/20250101_093000.jpg", b"bytes")
			.await
			.unwrap();
		run_once(&ctx).await;
		let job = rx.try_recv().unwrap();
		assert_eq!(job.relpath, "2025-01-01/20250101_093000.jpg");
		assert!(job.job_id.is_none());
	}

	#[tokio::test]
	async fn lost_file_tombstones_then_purges() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		let path = land_full(&ctx, "dev1", "20250101_093000").await;
		ctx.assets.delete("dev1", &path).await.unwrap();

		run_once(&ctx).await;
		let record = ctx.db.get_asset("dev1", &path).await.unwrap().unwrap();
		assert!(record.deleted);
		assert!(record.delete_time.is_some());

		// Second sweep: tombstone already set, everything goes.
		run_once(&ctx).await;
		assert!(ctx.db.get_asset("dev1", &path).await.unwrap().is_none());
		let collection = ctx
			.vectors
			.collection("dev1", DEFAULT_MODEL, TEST_DIM)
			.await
			.unwrap();
		assert_eq!(collection.len().await, 0);
	}

	#[tokio::test]
	async fn orphan_embedding_is_dropped() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		let collection = ctx
			.vectors
			.collection("dev1", DEFAULT_MODEL, TEST_DIM)
			.await
			.unwrap();
		collection
			.insert(VectorRecord {
				id: vector_id("2025-01-01/20250101_093000.jpg"),
				path: "2025-01-01/20250101_093000.jpg".into(),
				vector: vec![1.0; TEST_DIM],
				timestamp: None,
				whitelist: None,
			})
			.await
			.unwrap();
		// Device is only visible through the vector store; seed one record
		// so the device shows up in the sweep.
		land_full(&ctx, "dev1", "20250101_100000").await;

		run_once(&ctx).await;
		assert!(collection
			.get(&vector_id("2025-01-01/20250101_093000.jpg"))
			.await
			.is_none());
	}

	#[tokio::test]
	async fn retention_removes_expired_assets() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		let path = land_full(&ctx, "dev1", "20250101_093000").await;
		let late = ctx.now_ms() - 31 * 24 * 3600 * 1000;
		ctx.db.mark_deleted("dev1", &path, late).await.unwrap();

		run_once(&ctx).await;
		assert!(ctx.db.get_asset("dev1", &path).await.unwrap().is_none());
		assert!(!ctx.assets.exists("dev1", &path).await);
		assert!(!ctx.assets.thumbnail_exists("dev1", &path).await);
		let collection = ctx
			.vectors
			.collection("dev1", DEFAULT_MODEL, TEST_DIM)
			.await
			.unwrap();
		assert_eq!(collection.len().await, 0);
	}

	#[tokio::test]
	async fn recent_tombstone_survives_retention() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		let path = land_full(&ctx, "dev1", "20250101_093000").await;
		ctx.db
			.mark_deleted("dev1", &path, ctx.now_ms())
			.await
			.unwrap();
		run_once(&ctx).await;
		let record = ctx.db.get_asset("dev1", &path).await.unwrap();
		assert!(record.is_some(), "tombstone inside retention window kept");
	}

	#[tokio::test]
	async fn face_aging_spares_whitelist() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		land_full(&ctx, "dev1", "20250101_093000").await;
		let faces = ctx
			.vectors
			.collection("dev1", FACE_MODEL, FACE_DIM)
			.await
			.unwrap();
		let old = ctx.now_ms() - 2 * 3600 * 1000;
		for (suffix, ts, whitelist) in
			[("a", old, false), ("b", old, true), ("c", ctx.now_ms(), false)]
		{
			faces
				.insert(VectorRecord {
					id: format!("face_{suffix}"),
					path: "2025-01-01/20250101_093000.jpg".into(),
					vector: vec![1.0; FACE_DIM],
					timestamp: Some(ts),
					whitelist: Some(whitelist),
				})
				.await
				.unwrap();
		}
		age_faces(&ctx).await;
		assert!(faces.get("face_a").await.is_none());
		assert!(faces.get("face_b").await.is_some());
		assert!(faces.get("face_c").await.is_some());
	}
}
