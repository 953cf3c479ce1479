use std::collections::HashMap;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context as _;
use futures::executor::block_on;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::context::Context;
use crate::error::ApiError;
use crate::pipeline::PipelineJob;
use crate::types::canonical_relpath;
use crate::types::parse_stem_with;
use crate::types::split_relpath;
use crate::types::AssetKind;
use crate::types::CANONICAL_STEM_FORMAT;

/// Sessions whose partial file has seen no chunk for this long are expired.
pub const SESSION_TTL: Duration = Duration::from_secs(900);

pub fn content_hash(bytes: &[u8]) -> String {
	use sha2::Digest;
	format!("{:x}", sha2::Sha256::digest(bytes))
}

#[derive(Debug)]
pub struct UploadSession {
	pub upload_id: String,
	pub device: String,
	pub date_format: String,
	pub partial_path: PathBuf,
	pub received_bytes: u64,
	pub completed: bool,
	updated_at: Instant,
}

/// Chunked upload sessions. Chunk append is serialized per upload by the
/// client; the server applies chunks in arrival order and does not
/// deduplicate repeats.
#[derive(Debug, Default)]
pub struct Uploads {
	sessions: Mutex<HashMap<String, UploadSession>>,
}

impl Uploads {
	pub fn new() -> Uploads {
		Uploads::default()
	}

	pub async fn init(
		&self,
		assets_root: &Path,
		device: &str,
		date_format: &str,
	) -> anyhow::Result<String> {
		let upload_id = Uuid::new_v4().to_string();
		let partial_path = assets_root.join(device).join(format!("{upload_id}.zip.part"));
		if let Some(parent) = partial_path.parent() {
			fs::create_dir_all(parent).await?;
		}
		fs::write(&partial_path, b"").await?;
		let mut sessions = self.sessions.lock().await;
		sessions.insert(
			upload_id.clone(),
			UploadSession {
				upload_id: upload_id.clone(),
				device: device.to_string(),
				date_format: date_format.to_string(),
				partial_path,
				received_bytes: 0,
				completed: false,
				updated_at: Instant::now(),
			},
		);
		log::info!("initialized upload {} for device {}", upload_id, device);
		Ok(upload_id)
	}

	pub async fn append_chunk(&self, upload_id: &str, bytes: &[u8]) -> Result<u64, ApiError> {
		let mut sessions = self.sessions.lock().await;
		let session = sessions
			.get_mut(upload_id)
			.ok_or_else(|| ApiError::NotFound(format!("unknown uploadId {upload_id}")))?;
		if session.completed {
			return Err(ApiError::InvalidInput(format!(
				"upload {upload_id} already completed"
			)));
		}
		let mut file = fs::OpenOptions::new()
			.append(true)
			.open(&session.partial_path)
			.await
			.map_err(|e| ApiError::Transient(e.to_string()))?;
		tokio::io::AsyncWriteExt::write_all(&mut file, bytes)
			.await
			.map_err(|e| ApiError::Transient(e.to_string()))?;
		session.received_bytes += bytes.len() as u64;
		session.updated_at = Instant::now();
		Ok(session.received_bytes)
	}

	/// Rename the partial to the final archive and return what the
	/// processing job needs.
	pub async fn complete(&self, upload_id: &str) -> Result<(String, String, PathBuf), ApiError> {
		let mut sessions = self.sessions.lock().await;
		let session = sessions
			.get_mut(upload_id)
			.ok_or_else(|| ApiError::NotFound(format!("unknown uploadId {upload_id}")))?;
		if session.completed {
			return Err(ApiError::InvalidInput(format!(
				"upload {upload_id} already completed"
			)));
		}
		let archive_path = session.partial_path.with_extension("");
		fs::rename(&session.partial_path, &archive_path)
			.await
			.map_err(|e| ApiError::Transient(e.to_string()))?;
		session.completed = true;
		session.updated_at = Instant::now();
		Ok((
			session.device.clone(),
			session.date_format.clone(),
			archive_path,
		))
	}

	/// Drop completed and abandoned sessions, removing stale partials.
	pub async fn expire_stale(&self) -> usize {
		let mut sessions = self.sessions.lock().await;
		let stale: Vec<String> = sessions
			.values()
			.filter(|s| s.updated_at.elapsed() > SESSION_TTL)
			.map(|s| s.upload_id.clone())
			.collect();
		for id in &stale {
			if let Some(session) = sessions.remove(id) {
				if !session.completed {
					log::warn!("expiring stale upload {}", id);
					let _ = fs::remove_file(&session.partial_path).await;
				}
			}
		}
		stale.len()
	}
}

/// Run the archive processing job to completion: extract, land assets,
/// schedule the pipeline, let the last pipeline item trigger segmentation.
pub async fn process_archive_job(
	ctx: Arc<Context>,
	job_id: String,
	device: String,
	date_format: String,
	archive_path: PathBuf,
) {
	ctx.jobs.set_processing(&job_id, "Extracting archive.").await;
	if let Err(err) = ctx
		.db
		.get_or_create_device(&device, ctx.models.encoder.dim())
		.await
	{
		log::error!("cannot register device {}: {}", device, err);
		ctx.jobs.fail(&job_id, &err.to_string()).await;
		return;
	}

	let extract_ctx = ctx.clone();
	let extract_job = job_id.clone();
	let extract_device = device.clone();
	let extract_archive = archive_path.clone();
	let extracted = tokio::task::spawn_blocking(move || {
		extract_archive_blocking(
			extract_ctx,
			&extract_job,
			&extract_device,
			&date_format,
			&extract_archive,
		)
	})
	.await;

	let tracked = match extracted {
		Ok(Ok(files)) => files,
		Ok(Err(err)) => {
			log::error!("archive extraction failed for job {}: {}", job_id, err);
			ctx.jobs.fail(&job_id, &err.to_string()).await;
			return;
		}
		Err(err) => {
			log::error!("extraction task panicked for job {}: {}", job_id, err);
			ctx.jobs.fail(&job_id, "extraction task failed").await;
			return;
		}
	};

	if let Err(err) = fs::remove_file(&archive_path).await {
		log::warn!("cannot delete {}: {}", archive_path.display(), err);
	}

	if tracked.is_empty() {
		ctx.jobs.track_files(&job_id, Vec::new(), HashSet::new()).await;
		ctx.jobs.finish(&job_id).await;
		return;
	}

	let dates: HashSet<String> = tracked
		.iter()
		.filter_map(|p| split_relpath(p).map(|(date, _, _)| date))
		.collect();
	ctx.jobs
		.track_files(&job_id, tracked.clone(), dates)
		.await;

	for relpath in tracked {
		let queued = ctx.enqueue_pipeline(PipelineJob {
			device: device.clone(),
			relpath: relpath.clone(),
			job_id: Some(job_id.clone()),
		});
		if !queued {
			crate::pipeline::finish_job_item(
				&ctx,
				&job_id,
				Some(format!("{relpath}: queue full, deferred")),
			)
			.await;
		}
	}
}

/// Extract every archive member whose stem parses against `date_format`,
/// landing it under the canonical layout. Unparseable members are skipped
/// with a logged reason and do not fail the job.
fn extract_archive_blocking(
	ctx: Arc<Context>,
	job_id: &str,
	device: &str,
	date_format: &str,
	archive_path: &Path,
) -> anyhow::Result<Vec<String>> {
	let file = std::fs::File::open(archive_path)
		.with_context(|| format!("cannot open {}", archive_path.display()))?;
	let mut archive = zip::ZipArchive::new(file).context("cannot read archive")?;
	let total = archive.len();
	let mut tracked = Vec::new();

	for i in 0..total {
		let mut member = archive.by_index(i)?;
		if member.is_dir() {
			continue;
		}
		let name = member.name().to_string();
		let file_name = name.rsplit('/').next().unwrap_or(&name).to_string();
		let (stem, ext) = match file_name.rsplit_once('.') {
			Some((stem, ext)) => (stem.to_string(), ext.to_ascii_lowercase()),
			None => {
				log::warn!("skipping {}: no extension", name);
				continue;
			}
		};
		if AssetKind::from_ext(&ext).is_none() {
			log::warn!("skipping {}: unsupported extension", name);
			continue;
		}
		let capture_ms = match parse_stem_with(&stem, date_format) {
			Some(ms) => ms,
			None => {
				log::warn!(
					"skipping {}: stem does not match date format {}",
					name,
					date_format
				);
				continue;
			}
		};
		// Raw H264 is containerized at landing; everything else keeps its
		// extension.
		let landed_ext = if ext == "h264" { "mp4" } else { ext.as_str() };
		let (relpath, _date) = match canonical_relpath(capture_ms, landed_ext) {
			Some(v) => v,
			None => {
				log::warn!("skipping {}: timestamp out of range", name);
				continue;
			}
		};

		let target = ctx.assets.full_path(device, &relpath);
		if !target.exists() {
			let mut bytes = Vec::with_capacity(member.size() as usize);
			member.read_to_end(&mut bytes)?;
			if ext == "h264" {
				bytes = match crate::media::transcode_h264_bytes(&bytes) {
					Ok(mp4) => mp4,
					Err(err) => {
						log::warn!("skipping {}: transcode failed: {}", name, err);
						continue;
					}
				};
			}
			write_atomic_sync(&target, &bytes)?;
		}
		tracked.push(relpath);

		if (i + 1) % 100 == 0 || i + 1 == total {
			block_on(ctx.jobs.extraction_progress(job_id, i + 1, total));
		}
	}
	Ok(tracked)
}

fn write_atomic_sync(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
	let parent = path
		.parent()
		.with_context(|| format!("no parent dir for {}", path.display()))?;
	std::fs::create_dir_all(parent)?;
	let tmp = path.with_extension("part");
	std::fs::write(&tmp, bytes)?;
	std::fs::rename(&tmp, path)?;
	Ok(())
}

/// The single-file upload path. The filename encodes the capture time in
/// the canonical stem format; images arrive rotated to portrait.
pub async fn ingest_single_image(
	ctx: &Arc<Context>,
	device: &str,
	filename: &str,
	bytes: Vec<u8>,
) -> Result<String, ApiError> {
	if ctx.over_capacity() {
		return Err(ApiError::Capacity("processing queue is full".into()));
	}
	let (stem, ext) = filename
		.rsplit_once('.')
		.ok_or_else(|| ApiError::InvalidInput(format!("bad filename {filename}")))?;
	let mut ext = ext.to_ascii_lowercase();
	let kind = AssetKind::from_ext(&ext)
		.ok_or_else(|| ApiError::InvalidInput(format!("unsupported extension {ext}")))?;
	let capture_ms = parse_stem_with(stem, CANONICAL_STEM_FORMAT)
		.ok_or_else(|| ApiError::InvalidInput(format!("unparseable filename {filename}")))?;

	let bytes = if ext == "h264" {
		let transcoded = tokio::task::spawn_blocking(move || {
			crate::media::transcode_h264_bytes(&bytes)
		})
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?
		.map_err(|e| ApiError::CorruptAsset(e.to_string()))?;
		ext = "mp4".to_string();
		transcoded
	} else {
		bytes
	};
	let (relpath, date) = canonical_relpath(capture_ms, &ext)
		.ok_or_else(|| ApiError::InvalidInput("timestamp out of range".into()))?;

	ctx.db
		.get_or_create_device(device, ctx.models.encoder.dim())
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;

	// Idempotent re-upload: nothing to do, not even a thumbnail write.
	let existing = ctx
		.db
		.get_asset(device, &relpath)
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;
	if ctx.assets.exists(device, &relpath).await {
		if let Some(record) = existing {
			if record.stage.embedded {
				log::info!("{}/{} already ingested", device, relpath);
				let job_id = ctx.jobs.create(device).await;
				ctx.jobs
					.track_files(&job_id, Vec::new(), HashSet::new())
					.await;
				ctx.jobs.finish(&job_id).await;
				return Ok(job_id);
			}
		}
	}

	let bytes = match kind {
		AssetKind::Image => {
			let img = image::load_from_memory(&bytes)
				.map_err(|e| ApiError::InvalidInput(format!("invalid image file: {e}")))?;
			if img.width() > img.height() {
				// POV cameras mount sideways; store portrait.
				let rotated = img.rotate90();
				let mut out = Vec::new();
				rotated
					.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg)
					.map_err(|e| ApiError::Transient(e.to_string()))?;
				out
			} else {
				bytes
			}
		}
		AssetKind::Video => bytes,
	};

	ctx.assets
		.put(device, &relpath, &bytes)
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;

	let job_id = ctx.jobs.create(device).await;
	ctx.jobs.set_processing(&job_id, "Processing image.").await;
	ctx.jobs
		.track_files(
			&job_id,
			vec![relpath.clone()],
			HashSet::from([date.clone()]),
		)
		.await;
	let queued = ctx.enqueue_pipeline(PipelineJob {
		device: device.to_string(),
		relpath: relpath.clone(),
		job_id: Some(job_id.clone()),
	});
	if !queued {
		crate::pipeline::finish_job_item(
			ctx,
			&job_id,
			Some(format!("{relpath}: queue full, deferred")),
		)
		.await;
	}
	Ok(job_id)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::testing::test_ctx;
	use std::io::Write;
	use zip::write::SimpleFileOptions;

	fn jpeg_bytes(w: u32, h: u32) -> Vec<u8> {
		let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(w, h, |x, y| {
			image::Rgb([(x % 256) as u8, (y % 256) as u8, 0])
		}));
		let mut out = Vec::new();
		img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg)
			.unwrap();
		out
	}

	#[tokio::test]
	async fn session_lifecycle() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		let upload_id = ctx
			.uploads
			.init(ctx.assets.assets_root(), "dev1", "%Y%m%d_%H%M%S")
			.await
			.unwrap();
		ctx.uploads.append_chunk(&upload_id, b"abc").await.unwrap();
		let total = ctx.uploads.append_chunk(&upload_id, b"def").await.unwrap();
		assert_eq!(total, 6);

		let (device, fmt, archive) = ctx.uploads.complete(&upload_id).await.unwrap();
		assert_eq!(device, "dev1");
		assert_eq!(fmt, "%Y%m%d_%H%M%S");
		assert_eq!(std::fs::read(&archive).unwrap(), b"abcdef");

		// Completing twice is an input error; unknown ids are NotFound.
		assert!(matches!(
			ctx.uploads.complete(&upload_id).await,
			Err(ApiError::InvalidInput(_))
		));
		assert!(matches!(
			ctx.uploads.append_chunk("nope", b"x").await,
			Err(ApiError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn archive_extraction_lands_canonical_layout() {
		let (ctx, mut rx, _enc, _dir) = test_ctx();
		let upload_id = ctx
			.uploads
			.init(ctx.assets.assets_root(), "dev1", "%Y%m%d_%H%M%S")
			.await
			.unwrap();

		let mut zip_bytes = Vec::new();
		{
			let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
			let opts = SimpleFileOptions::default();
			for stem in ["20250101_093000", "20250101_093100", "20250101_200000"] {
				writer.start_file(format!("{stem}.jpg"), opts).unwrap();
				writer.write_all(&jpeg_bytes(4, 6)).unwrap();
			}
			// Unparseable member: skipped, job still succeeds.
			writer.start_file("notes.jpg", opts).unwrap();
			writer.write_all(b"not a timestamp").unwrap();
			writer.finish().unwrap();
		}
		ctx.uploads.append_chunk(&upload_id, &zip_bytes).await.unwrap();
		let (device, fmt, archive) = ctx.uploads.complete(&upload_id).await.unwrap();

		let job_id = ctx.jobs.create(&device).await;
		process_archive_job(ctx.clone(), job_id.clone(), device, fmt, archive.clone()).await;

		assert!(ctx.assets.exists("dev1", "2025-01-01/20250101_093000.jpg").await);
		assert!(ctx.assets.exists("dev1", "2025-01-01/20250101_200000.jpg").await);
		assert!(!archive.exists(), "archive should be deleted");

		// Three pipeline jobs queued, in archive order.
		let mut queued = Vec::new();
		while let Ok(job) = rx.try_recv() {
			queued.push(job.relpath);
		}
		assert_eq!(queued.len(), 3);

		let snap = ctx.jobs.get(&job_id).await.unwrap();
		assert_eq!(snap.progress, crate::jobs::EXTRACT_SHARE);
	}

	#[tokio::test]
	async fn archive_import_end_to_end() {
		let (ctx, mut rx, encoder, _dir) = test_ctx();
		// All three frames look alike, so only the evening time gap splits
		// the day.
		for stem in ["20250101_093000", "20250101_093100", "20250101_200000"] {
			let mut v = vec![1.0f32; crate::context::testing::TEST_DIM];
			v[0] = 1.01;
			encoder.set(stem, v);
		}

		let upload_id = ctx
			.uploads
			.init(ctx.assets.assets_root(), "dev1", "%Y%m%d_%H%M%S")
			.await
			.unwrap();
		let mut zip_bytes = Vec::new();
		{
			let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
			let opts = SimpleFileOptions::default();
			for stem in ["20250101_093000", "20250101_093100", "20250101_200000"] {
				writer.start_file(format!("{stem}.jpg"), opts).unwrap();
				writer.write_all(&jpeg_bytes(32, 48)).unwrap();
			}
			writer.finish().unwrap();
		}
		ctx.uploads.append_chunk(&upload_id, &zip_bytes).await.unwrap();
		let (device, fmt, archive) = ctx.uploads.complete(&upload_id).await.unwrap();
		let job_id = ctx.jobs.create(&device).await;
		process_archive_job(ctx.clone(), job_id.clone(), device, fmt, archive).await;

		// Drain the queue the way a worker would.
		while let Ok(job) = rx.try_recv() {
			let result =
				crate::pipeline::process_asset(&ctx, &job.device, &job.relpath).await;
			let error = result.err().map(|e| format!("{}: {e}", job.relpath));
			crate::pipeline::finish_job_item(&ctx, job.job_id.as_deref().unwrap(), error)
				.await;
		}

		let snap = ctx.jobs.get(&job_id).await.unwrap();
		assert_eq!(snap.status, crate::types::JobStatus::Done);
		assert_eq!(snap.progress, 1.0);

		let groups = ctx.db.segment_groups("dev1", "2025-01-01").await.unwrap();
		assert_eq!(groups.len(), 2);
		assert_eq!(groups[&0].len(), 2);
		assert_eq!(groups[&1].len(), 1);
		assert_eq!(groups[&1][0].path, "2025-01-01/20250101_200000.jpg");
	}

	#[tokio::test]
	async fn garbage_h264_upload_is_rejected() {
		let (ctx, mut rx, _enc, _dir) = test_ctx();
		// Unplayable bytes fail the landing transcode; nothing lands and
		// nothing is scheduled. Holds whether ffmpeg rejects the stream or
		// is not installed at all.
		let err = ingest_single_image(
			&ctx,
			"dev1",
			"20250101_093000.h264",
			b"not an elementary stream".to_vec(),
		)
		.await
		.unwrap_err();
		assert!(matches!(err, ApiError::CorruptAsset(_)));
		assert!(!ctx.assets.exists("dev1", "2025-01-01/20250101_093000.mp4").await);
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn h264_single_upload_lands_as_mp4() {
		let (ctx, mut rx, _enc, dir) = test_ctx();
		let raw = dir.path().join("clip.h264");
		if !crate::media::testing::write_test_h264(&raw) {
			eprintln!("ffmpeg with h264 support unavailable, skipping");
			return;
		}
		let bytes = std::fs::read(&raw).unwrap();
		ingest_single_image(&ctx, "dev1", "20250101_093000.h264", bytes)
			.await
			.unwrap();
		// The raw stream lands containerized under the canonical mp4 name.
		assert!(ctx.assets.exists("dev1", "2025-01-01/20250101_093000.mp4").await);
		assert!(!ctx.assets.exists("dev1", "2025-01-01/20250101_093000.h264").await);
		assert_eq!(
			rx.try_recv().unwrap().relpath,
			"2025-01-01/20250101_093000.mp4"
		);
	}

	#[tokio::test]
	async fn archive_skips_untranscodable_h264() {
		let (ctx, mut rx, _enc, _dir) = test_ctx();
		let upload_id = ctx
			.uploads
			.init(ctx.assets.assets_root(), "dev1", "%Y%m%d_%H%M%S")
			.await
			.unwrap();

		let mut zip_bytes = Vec::new();
		{
			let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
			let opts = SimpleFileOptions::default();
			writer.start_file("20250101_093000.jpg", opts).unwrap();
			writer.write_all(&jpeg_bytes(4, 6)).unwrap();
			writer.start_file("20250101_093100.h264", opts).unwrap();
			writer.write_all(b"not an elementary stream").unwrap();
			writer.finish().unwrap();
		}
		ctx.uploads.append_chunk(&upload_id, &zip_bytes).await.unwrap();
		let (device, fmt, archive) = ctx.uploads.complete(&upload_id).await.unwrap();
		let job_id = ctx.jobs.create(&device).await;
		process_archive_job(ctx.clone(), job_id.clone(), device, fmt, archive).await;

		// The jpg lands; the broken clip is skipped with a logged reason and
		// does not fail the job.
		assert!(ctx.assets.exists("dev1", "2025-01-01/20250101_093000.jpg").await);
		assert!(!ctx.assets.exists("dev1", "2025-01-01/20250101_093100.mp4").await);
		let mut queued = Vec::new();
		while let Ok(job) = rx.try_recv() {
			queued.push(job.relpath);
		}
		assert_eq!(queued, vec!["2025-01-01/20250101_093000.jpg".to_string()]);
		let snap = ctx.jobs.get(&job_id).await.unwrap();
		assert_ne!(snap.status, crate::types::JobStatus::Error);
	}

	#[tokio::test]
	async fn single_image_rejects_bad_input() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		let err = ingest_single_image(&ctx, "dev1", "nodate.jpg", jpeg_bytes(4, 6))
			.await
			.unwrap_err();
		assert!(matches!(err, ApiError::InvalidInput(_)));

		let err = ingest_single_image(
			&ctx,
			"dev1",
			"20250101_093000.jpg",
			b"definitely not a jpeg".to_vec(),
		)
		.await
		.unwrap_err();
		assert!(matches!(err, ApiError::InvalidInput(_)));
	}

	#[tokio::test]
	async fn repeat_upload_is_a_noop() {
		let (ctx, mut rx, _enc, _dir) = test_ctx();
		let bytes = jpeg_bytes(4, 6);
		ingest_single_image(&ctx, "dev1", "20250101_093000.jpg", bytes.clone())
			.await
			.unwrap();
		let job = rx.try_recv().unwrap();
		crate::pipeline::process_asset(&ctx, &job.device, &job.relpath)
			.await
			.unwrap();
		crate::pipeline::finish_job_item(&ctx, job.job_id.as_deref().unwrap(), None).await;

		let thumb = ctx.assets.thumbnail_path("dev1", &job.relpath);
		let before = std::fs::metadata(&thumb).unwrap().modified().unwrap();

		// Second upload of the identical file: nothing is scheduled, nothing
		// is rewritten, and the returned job is already done.
		let job_id = ingest_single_image(&ctx, "dev1", "20250101_093000.jpg", bytes)
			.await
			.unwrap();
		assert!(rx.try_recv().is_err(), "no pipeline job for a re-upload");
		let snap = ctx.jobs.get(&job_id).await.unwrap();
		assert_eq!(snap.status, crate::types::JobStatus::Done);
		let after = std::fs::metadata(&thumb).unwrap().modified().unwrap();
		assert_eq!(before, after);

		let collection = ctx
			.vectors
			.collection("dev1", crate::vector_index::DEFAULT_MODEL, 8)
			.await
			.unwrap();
		assert_eq!(collection.len().await, 1);
		let records = ctx
			.db
			.find_assets(&crate::db::AssetQuery {
				device: Some("dev1".into()),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(records.len(), 1);
	}

	#[tokio::test]
	async fn single_image_lands_portrait() {
		let (ctx, mut rx, _enc, _dir) = test_ctx();
		// Landscape input gets rotated to portrait on landing.
		ingest_single_image(&ctx, "dev1", "20250101_093000.jpg", jpeg_bytes(8, 4))
			.await
			.unwrap();
		let stored = ctx
			.assets
			.open("dev1", "2025-01-01/20250101_093000.jpg")
			.await
			.unwrap();
		let img = image::load_from_memory(&stored).unwrap();
		assert!(img.height() > img.width());
		assert_eq!(rx.try_recv().unwrap().relpath, "2025-01-01/20250101_093000.jpg");
	}
}
