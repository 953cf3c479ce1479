use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context as _;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::context::Context;
use crate::ortho::dot;
use crate::ortho::l2_normalize;
use crate::redact;
use crate::segmenter;
use crate::types::parse_capture_time;
use crate::types::split_relpath;
use crate::types::AssetKind;
use crate::types::Detection;
use crate::types::FaceDetection;
use crate::types::REDACTED_FACE_LABEL;
use crate::vector_index::vector_id;
use crate::vector_index::VectorRecord;
use crate::vector_index::DEFAULT_MODEL;
use crate::vector_index::FACE_DIM;
use crate::vector_index::FACE_MODEL;

/// Cosine similarity above which a detected face takes a whitelist name.
const WHITELIST_THRESHOLD: f32 = 0.9;

#[derive(Debug)]
pub struct PipelineJob {
	pub device: String,
	pub relpath: String,
	pub job_id: Option<String>,
}

/// Spawn the bounded worker pool over the pipeline queue.
pub fn spawn_workers(ctx: Arc<Context>, rx: mpsc::Receiver<PipelineJob>) {
	let rx = Arc::new(Mutex::new(rx));
	for worker in 0..ctx.config.pipeline_workers.max(1) {
		let ctx = ctx.clone();
		let rx = rx.clone();
		tokio::spawn(async move {
			loop {
				let job = {
					let mut rx = rx.lock().await;
					tokio::select! {
						job = rx.recv() => job,
						_ = ctx.cancel.cancelled() => None,
					}
				};
				let job = match job {
					Some(job) => job,
					None => break,
				};
				handle_job(&ctx, job).await;
			}
			log::info!("pipeline worker {} exiting", worker);
		});
	}
}

async fn handle_job(ctx: &Arc<Context>, job: PipelineJob) {
	let result = process_asset(ctx, &job.device, &job.relpath).await;
	let error = match result {
		Ok(_) => None,
		Err(err) => {
			log::error!("pipeline failed for {}/{}: {}", job.device, job.relpath, err);
			Some(format!("{}: {}", job.relpath, err))
		}
	};
	if let Some(job_id) = &job.job_id {
		finish_job_item(ctx, job_id, error).await;
	}
}

/// Record one finished pipeline item on its job; the worker completing the
/// last item runs segmentation for the affected dates and closes the job.
pub async fn finish_job_item(ctx: &Arc<Context>, job_id: &str, error: Option<String>) {
	if let Some((device, dates)) = ctx.jobs.item_done(job_id, error).await {
		for date in dates {
			if let Err(err) = segmenter::resegment(ctx, &device, &date).await {
				log::error!("segmentation failed for {}/{}: {}", device, date, err);
			}
		}
		ctx.jobs.finish(job_id).await;
	}
}

/// Run the four pipeline stages for one asset, resuming from the stage
/// flags. A failed stage leaves its flag false so the reconciler retries;
/// an unreadable source triggers full cleanup.
pub async fn process_asset(ctx: &Arc<Context>, device: &str, relpath: &str) -> anyhow::Result<()> {
	let (date, stem, ext) =
		split_relpath(relpath).ok_or_else(|| anyhow!("non-canonical path {relpath}"))?;
	let kind = AssetKind::from_ext(&ext).ok_or_else(|| anyhow!("unsupported extension {ext}"))?;
	let capture_ms =
		parse_capture_time(&stem).ok_or_else(|| anyhow!("unparseable stem {stem}"))?;

	let source = match ctx.assets.open(device, relpath).await {
		Ok(bytes) => bytes,
		Err(err) => {
			log::warn!("{}/{} missing on disk, cleaning up: {}", device, relpath, err);
			crate::reconcile::cleanup_asset(ctx, device, relpath).await?;
			return Err(anyhow!("source file missing, asset removed"));
		}
	};

	// Stage 1: index.
	ctx.db
		.insert_asset(&crate::db::NewAsset {
			device: device.to_string(),
			path: relpath.to_string(),
			date: date.clone(),
			capture_time: capture_ms,
			kind,
			content_hash: Some(crate::upload::content_hash(&source)),
		})
		.await?;
	drop(source);
	segmenter::assign_provisional(ctx, device, &date, relpath, capture_ms).await?;

	// Videos are represented by their first frame from here on.
	let work_path = match kind {
		AssetKind::Image => ctx.assets.full_path(device, relpath),
		AssetKind::Video => {
			let frame = keyframe_path(ctx, device, &date, &stem);
			if !frame.exists() {
				crate::media::extract_keyframe(&ctx.assets.full_path(device, relpath), &frame)
					.await?;
			}
			frame
		}
	};

	if ctx.cancel.is_cancelled() {
		return Ok(());
	}

	// Stage 2: detect objects, then faces inside person boxes.
	let record = ctx
		.db
		.get_asset(device, relpath)
		.await?
		.ok_or_else(|| anyhow!("record vanished"))?;
	if !record.stage.detected {
		detect_stage(ctx, device, relpath, capture_ms, &work_path).await?;
	}

	if ctx.cancel.is_cancelled() {
		return Ok(());
	}

	// Stage 3: redacted thumbnail. The flag is monotonic; a thumbnail that
	// disappeared from disk is re-rendered anyway.
	let record = ctx
		.db
		.get_asset(device, relpath)
		.await?
		.ok_or_else(|| anyhow!("record vanished"))?;
	if !record.stage.redacted || !ctx.assets.thumbnail_exists(device, relpath).await {
		redact_stage(ctx, device, relpath, &record.people, &work_path).await?;
	}

	if ctx.cancel.is_cancelled() {
		return Ok(());
	}

	// Stage 4: embed. Same story for a vector missing from the index.
	let record = ctx
		.db
		.get_asset(device, relpath)
		.await?
		.ok_or_else(|| anyhow!("record vanished"))?;
	let collection = ctx
		.vectors
		.collection(device, DEFAULT_MODEL, ctx.models.encoder.dim())
		.await?;
	if !record.stage.embedded || collection.get(&vector_id(relpath)).await.is_none() {
		embed_stage(ctx, device, relpath, &work_path).await?;
	}
	Ok(())
}

fn keyframe_path(ctx: &Context, device: &str, date: &str, stem: &str) -> PathBuf {
	ctx.config
		.thumb_root
		.join(device)
		.join(date)
		.join(format!("{stem}.frame.jpg"))
}

async fn detect_stage(
	ctx: &Arc<Context>,
	device: &str,
	relpath: &str,
	capture_ms: i64,
	work_path: &std::path::Path,
) -> anyhow::Result<()> {
	let source = match tokio::fs::read(work_path).await {
		Ok(bytes) => bytes,
		Err(err) => {
			log::warn!("cannot read {}: {}", work_path.display(), err);
			crate::reconcile::cleanup_asset(ctx, device, relpath).await?;
			return Err(anyhow!("unreadable source, asset removed"));
		}
	};
	let img = match image::load_from_memory(&source) {
		Ok(img) => img,
		Err(err) => {
			log::warn!("corrupt image {}: {}", work_path.display(), err);
			crate::reconcile::cleanup_asset(ctx, device, relpath).await?;
			return Err(anyhow!("corrupt source, asset removed"));
		}
	};

	let objects: Vec<Detection> = ctx
		.models
		.detector
		.detect(work_path)
		.await
		.context("object detection failed")?;

	let whitelist = ctx
		.db
		.get_device(device)
		.await?
		.map(|d| d.whitelist)
		.unwrap_or_default();

	let mut people: Vec<FaceDetection> = Vec::new();
	for object in objects.iter().filter(|o| o.label == "person") {
		let [x1, y1, x2, y2] = object.bbox;
		let (w, h) = (img.width() as i32, img.height() as i32);
		let cx1 = x1.clamp(0, w);
		let cy1 = y1.clamp(0, h);
		let cx2 = x2.clamp(0, w);
		let cy2 = y2.clamp(0, h);
		if cx2 <= cx1 || cy2 <= cy1 {
			continue;
		}
		let crop = img.crop_imm(
			cx1 as u32,
			cy1 as u32,
			(cx2 - cx1) as u32,
			(cy2 - cy1) as u32,
		);
		let mut crop_bytes = Vec::new();
		crop.write_to(
			&mut std::io::Cursor::new(&mut crop_bytes),
			image::ImageFormat::Jpeg,
		)?;
		let faces = ctx
			.models
			.faces
			.detect_faces(&crop_bytes)
			.await
			.context("face detection failed")?;
		for face in faces {
			// Back into full-image coordinates.
			let bbox = [
				face.bbox[0] + cx1,
				face.bbox[1] + cy1,
				face.bbox[2] + cx1,
				face.bbox[3] + cy1,
			];
			let label = whitelist_label(&whitelist, &face.embedding);
			people.push(FaceDetection {
				label,
				confidence: face.confidence,
				bbox,
				embedding: face.embedding,
			});
		}
	}

	ctx.db
		.set_detections(device, relpath, &objects, &people)
		.await?;

	// Face embeddings go to the device face collection so face queries and
	// the aging sweep can see them.
	if !people.is_empty() {
		let collection = ctx.vectors.collection(device, FACE_MODEL, FACE_DIM).await?;
		let records: Vec<VectorRecord> = people
			.iter()
			.enumerate()
			.filter(|(_, face)| {
				let ok = face.embedding.len() == FACE_DIM;
				if !ok {
					log::warn!(
						"face embedding of {}/{} has dim {}, skipping",
						device,
						relpath,
						face.embedding.len()
					);
				}
				ok
			})
			.map(|(i, face)| VectorRecord {
				id: format!("{}_{}", vector_id(relpath), i),
				path: relpath.to_string(),
				vector: face.embedding.clone(),
				timestamp: Some(capture_ms),
				whitelist: Some(face.is_whitelisted()),
			})
			.collect();
		collection.insert_batch(records).await?;
	}
	Ok(())
}

fn whitelist_label(whitelist: &[crate::types::WhitelistFace], embedding: &[f32]) -> String {
	let mut face = embedding.to_vec();
	l2_normalize(&mut face);
	for person in whitelist {
		for known in &person.embeddings {
			if known.len() != face.len() {
				continue;
			}
			let mut known = known.clone();
			l2_normalize(&mut known);
			if dot(&known, &face) >= WHITELIST_THRESHOLD {
				return person.name.clone();
			}
		}
	}
	REDACTED_FACE_LABEL.to_string()
}

async fn redact_stage(
	ctx: &Arc<Context>,
	device: &str,
	relpath: &str,
	people: &[FaceDetection],
	work_path: &std::path::Path,
) -> anyhow::Result<()> {
	let source = match tokio::fs::read(work_path).await {
		Ok(bytes) => bytes,
		Err(err) => {
			log::warn!("cannot read {}: {}", work_path.display(), err);
			crate::reconcile::cleanup_asset(ctx, device, relpath).await?;
			return Err(anyhow!("unreadable source, asset removed"));
		}
	};

	let face_boxes: Vec<[i32; 4]> = people
		.iter()
		.filter(|p| !p.is_whitelisted())
		.map(|p| p.bbox)
		.collect();
	let whitelist_boxes: Vec<[i32; 4]> = people
		.iter()
		.filter(|p| p.is_whitelisted())
		.map(|p| p.bbox)
		.collect();

	let segmenter_mask = ctx
		.models
		.masks
		.mask(work_path, redact::PRIVATE_LABELS)
		.await
		.context("mask segmentation failed")?;

	let thumb = redact::redacted_thumbnail(
		&source,
		&face_boxes,
		&whitelist_boxes,
		Some(&segmenter_mask),
	)?;
	let thumb_path = ctx.assets.write_thumbnail(device, relpath, &thumb).await?;
	ctx.db
		.set_thumbnail(device, relpath, &thumb_path.to_string_lossy())
		.await?;
	Ok(())
}

async fn embed_stage(
	ctx: &Arc<Context>,
	device: &str,
	relpath: &str,
	work_path: &std::path::Path,
) -> anyhow::Result<()> {
	let mut vector = ctx
		.models
		.encoder
		.encode_image(work_path)
		.await
		.context("image encoding failed")?;
	l2_normalize(&mut vector);

	let registered = ctx
		.db
		.get_or_create_device(device, ctx.models.encoder.dim())
		.await?;
	if registered.embedding_dim != vector.len() {
		return Err(anyhow!(
			"device {} registered with dim {}, encoder produced {}",
			device,
			registered.embedding_dim,
			vector.len()
		));
	}
	let vector = registered.transform.apply(&vector);

	let collection = ctx
		.vectors
		.collection(device, DEFAULT_MODEL, ctx.models.encoder.dim())
		.await?;
	collection
		.insert(VectorRecord {
			id: vector_id(relpath),
			path: relpath.to_string(),
			vector,
			timestamp: None,
			whitelist: None,
		})
		.await?;
	ctx.db.set_embedded(device, relpath).await?;
	Ok(())
}
