use std::sync::Arc;

use axum::extract::Multipart;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use axum::routing::put;
use axum::Json;
use axum::Router;
use base64::Engine;
use log::LevelFilter;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;
use simple_logger::SimpleLogger;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;

use crate::context::Context;
use crate::error::ApiError;
use crate::retrieval::ImageQuery;
use crate::retrieval::QueryOpts;
use crate::types::SortBy;
use crate::types::WhitelistFace;
use crate::vision::Models;

mod asset_store;
mod background;
mod config;
mod context;
mod db;
mod error;
mod jobs;
mod media;
mod ortho;
mod pipeline;
mod reconcile;
mod redact;
mod retrieval;
mod segmenter;
mod types;
mod upload;
mod vector_index;
mod vision;

#[tokio::main]
async fn main() {
	SimpleLogger::new()
		.with_level(LevelFilter::Info)
		.init()
		.unwrap();

	let config = config::Config::from_env();
	for dir in [&config.assets_root, &config.thumb_root, &config.vec_root] {
		if !dir.exists() {
			log::info!("creating {}", dir.display());
			std::fs::create_dir_all(dir).unwrap();
		}
	}

	let inference_url =
		std::env::var("INFERENCE_URL").unwrap_or_else(|_| "http://localhost:8090".to_string());
	let embedding_dim = std::env::var("EMBEDDING_DIM")
		.ok()
		.and_then(|v| v.parse().ok())
		.unwrap_or(768);
	let models = Models::remote(&inference_url, embedding_dim);

	let port = config.port;
	let (ctx, pipeline_rx) = Context::new(config, models).unwrap();
	pipeline::spawn_workers(ctx.clone(), pipeline_rx);
	background::spawn_background(ctx.clone());

	let app = router(ctx);
	let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await.unwrap();
	log::info!("listening on port {}", port);
	axum::serve(listener, app).await.unwrap();
}

fn router(ctx: Arc<Context>) -> Router {
	let cors = CorsLayer::new()
		.allow_origin(Any)
		.allow_methods(Any)
		.allow_headers(Any);

	Router::new()
		.route("/", get(root))
		.route("/init", post(init_upload))
		.route("/chunk", post(upload_chunk))
		.route("/complete", post(complete_upload))
		.route("/processing-status/{job_id}", get(processing_status))
		.route("/upload-image", put(upload_image))
		.route("/check-image", get(check_image))
		.route("/check-all-images-uploaded", post(check_all_images))
		.route("/get-all-dates", get(get_all_dates))
		.route("/get-images", get(get_images))
		.route("/search", get(search))
		.route("/search-image", post(search_image))
		.route("/search-faces", post(search_faces))
		.route("/whitelist", post(add_whitelist))
		.route("/timeline", get(timeline))
		.route("/image", delete(delete_image))
		.layer(cors)
		.layer(axum::extract::DefaultBodyLimit::max(1024 * 1024 * 1000))
		.with_state(ctx)
}

async fn root() -> Json<Value> {
	Json(json!({ "message": "lifelog server" }))
}

/// The device token travels in the attestation header on device-driven
/// endpoints; signature verification happens upstream and leaves the
/// resolved device id here.
fn device_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
	let device = headers
		.get("X-Device-ID")
		.and_then(|v| v.to_str().ok())
		.map(str::trim)
		.unwrap_or_default();
	if device.is_empty() {
		return Err(ApiError::AuthDenied("missing X-Device-ID header".into()));
	}
	Ok(device.to_string())
}

// --- chunked upload ---------------------------------------------------------

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InitUploadRequest {
	device: String,
	date_format: String,
}

async fn init_upload(
	State(ctx): State<Arc<Context>>,
	Json(body): Json<InitUploadRequest>,
) -> Result<Json<Value>, ApiError> {
	if body.device.trim().is_empty() {
		return Err(ApiError::InvalidInput("device is required".into()));
	}
	if body.date_format.trim().is_empty() {
		return Err(ApiError::InvalidInput("dateFormat is required".into()));
	}
	let upload_id = ctx
		.uploads
		.init(ctx.assets.assets_root(), &body.device, &body.date_format)
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;
	Ok(Json(json!({ "uploadId": upload_id })))
}

async fn upload_chunk(
	State(ctx): State<Arc<Context>>,
	mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
	if ctx.over_capacity() {
		return Err(ApiError::Capacity("processing queue is full".into()));
	}
	let mut upload_id: Option<String> = None;
	let mut chunk_index: Option<u64> = None;
	let mut total_chunks: Option<u64> = None;
	let mut chunk: Option<Vec<u8>> = None;
	while let Some(field) = multipart
		.next_field()
		.await
		.map_err(|e| ApiError::InvalidInput(e.to_string()))?
	{
		match field.name() {
			Some("uploadId") => {
				upload_id = Some(
					field
						.text()
						.await
						.map_err(|e| ApiError::InvalidInput(e.to_string()))?,
				)
			}
			Some("chunkIndex") => {
				let text = field
					.text()
					.await
					.map_err(|e| ApiError::InvalidInput(e.to_string()))?;
				chunk_index =
					Some(text.parse().map_err(|_| {
						ApiError::InvalidInput(format!("bad chunkIndex {text}"))
					})?);
			}
			Some("totalChunks") => {
				let text = field
					.text()
					.await
					.map_err(|e| ApiError::InvalidInput(e.to_string()))?;
				total_chunks =
					Some(text.parse().map_err(|_| {
						ApiError::InvalidInput(format!("bad totalChunks {text}"))
					})?);
			}
			Some("chunk") => {
				chunk = Some(
					field
						.bytes()
						.await
						.map_err(|e| ApiError::InvalidInput(e.to_string()))?
						.to_vec(),
				)
			}
			_ => {}
		}
	}
	let upload_id =
		upload_id.ok_or_else(|| ApiError::InvalidInput("uploadId is required".into()))?;
	let chunk_index =
		chunk_index.ok_or_else(|| ApiError::InvalidInput("chunkIndex is required".into()))?;
	let total_chunks =
		total_chunks.ok_or_else(|| ApiError::InvalidInput("totalChunks is required".into()))?;
	let chunk = chunk.ok_or_else(|| ApiError::InvalidInput("chunk is required".into()))?;

	ctx.uploads.append_chunk(&upload_id, &chunk).await?;
	Ok(Json(json!({
		"ok": true,
		"chunkIndex": chunk_index,
		"totalChunks": total_chunks
	})))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CompleteUploadRequest {
	upload_id: String,
}

async fn complete_upload(
	State(ctx): State<Arc<Context>>,
	Json(body): Json<CompleteUploadRequest>,
) -> Result<Json<Value>, ApiError> {
	let (device, date_format, archive_path) = ctx.uploads.complete(&body.upload_id).await?;
	let job_id = ctx.jobs.create(&device).await;
	tokio::spawn(upload::process_archive_job(
		ctx.clone(),
		job_id.clone(),
		device,
		date_format,
		archive_path,
	));
	Ok(Json(json!({ "jobId": job_id })))
}

async fn processing_status(
	State(ctx): State<Arc<Context>>,
	Path(job_id): Path<String>,
) -> Result<Json<crate::jobs::JobSnapshot>, ApiError> {
	match ctx.jobs.get(&job_id).await {
		Some(snapshot) => Ok(Json(snapshot)),
		None => Err(ApiError::NotFound(format!("unknown jobId {job_id}"))),
	}
}

// --- single-file upload -----------------------------------------------------

async fn upload_image(
	State(ctx): State<Arc<Context>>,
	headers: HeaderMap,
	mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
	let device = device_from_headers(&headers)?;
	let mut filename: Option<String> = None;
	let mut bytes: Option<Vec<u8>> = None;
	while let Some(field) = multipart
		.next_field()
		.await
		.map_err(|e| ApiError::InvalidInput(e.to_string()))?
	{
		if field.name() == Some("file") {
			filename = field.file_name().map(|s| s.to_string());
			bytes = Some(
				field
					.bytes()
					.await
					.map_err(|e| ApiError::InvalidInput(e.to_string()))?
					.to_vec(),
			);
		}
	}
	let filename = filename.ok_or_else(|| ApiError::InvalidInput("file is required".into()))?;
	let bytes = bytes.ok_or_else(|| ApiError::InvalidInput("file is required".into()))?;
	let job_id = upload::ingest_single_image(&ctx, &device, &filename, bytes).await?;
	Ok(Json(json!({ "jobId": job_id })))
}

// --- existence checks and day browsing --------------------------------------

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CheckImageQuery {
	device: String,
	/// Capture time, UTC epoch milliseconds.
	timestamp: i64,
}

async fn check_image(
	State(ctx): State<Arc<Context>>,
	Query(params): Query<CheckImageQuery>,
) -> Result<Json<Value>, ApiError> {
	let (relpath, date) = types::canonical_relpath(params.timestamp, "jpg")
		.ok_or_else(|| ApiError::InvalidInput("invalid timestamp".into()))?;
	let exists = ctx.assets.exists(&params.device, &relpath).await;
	let message = if exists {
		format!("Image exists for date {date}.")
	} else {
		format!("Image does not exist for date {date}.")
	};
	Ok(Json(json!({ "exists": exists, "message": message })))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CheckFilesRequest {
	device: String,
	date: String,
	all_files: Vec<String>,
}

async fn check_all_images(
	State(ctx): State<Arc<Context>>,
	Json(body): Json<CheckFilesRequest>,
) -> Result<Json<Vec<String>>, ApiError> {
	if body.date.is_empty() {
		return Err(ApiError::InvalidInput("date is required".into()));
	}
	let mut missing = Vec::new();
	for file in body.all_files {
		let relpath = format!("{}/{}", body.date, file);
		if !ctx.assets.exists(&body.device, &relpath).await {
			missing.push(file);
		}
	}
	Ok(Json(missing))
}

#[derive(Deserialize, Debug)]
struct DeviceQuery {
	device: String,
}

async fn get_all_dates(
	State(ctx): State<Arc<Context>>,
	Query(params): Query<DeviceQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
	let dates = ctx
		.db
		.all_dates(&params.device)
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;
	Ok(Json(dates))
}

const IMAGES_PER_PAGE: usize = 30;

#[derive(Deserialize, Debug)]
struct GetImagesQuery {
	device: String,
	date: String,
	page: Option<usize>,
}

async fn get_images(
	State(ctx): State<Arc<Context>>,
	Query(params): Query<GetImagesQuery>,
) -> Result<Json<Value>, ApiError> {
	let page = params.page.unwrap_or(1).max(1);
	let all = ctx
		.db
		.find_assets(&db::AssetQuery {
			device: Some(params.device.clone()),
			date: Some(params.date.clone()),
			deleted: Some(false),
			order: Some(db::OrderBy::CaptureTimeDesc),
			..Default::default()
		})
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;
	let total_pages = all.len().div_ceil(IMAGES_PER_PAGE);
	let images: Vec<Value> = all
		.iter()
		.skip((page - 1) * IMAGES_PER_PAGE)
		.take(IMAGES_PER_PAGE)
		.map(|r| {
			json!({
				"imagePath": r.path,
				"timestamp": r.capture_time,
				"thumbnailPath": r.thumbnail_path,
			})
		})
		.collect();
	Ok(Json(json!({
		"date": params.date,
		"images": images,
		"totalPages": total_pages
	})))
}

// --- retrieval --------------------------------------------------------------

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SearchQuery {
	device: String,
	query: String,
	top_k: Option<usize>,
	sort_by: Option<SortBy>,
}

fn query_opts(top_k: Option<usize>, sort_by: Option<SortBy>) -> QueryOpts {
	QueryOpts::new(
		top_k.unwrap_or(100).min(1000),
		sort_by.unwrap_or(SortBy::Relevance),
	)
}

async fn search(
	State(ctx): State<Arc<Context>>,
	Query(params): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
	if params.query.trim().is_empty() {
		return Err(ApiError::InvalidInput("query is required".into()));
	}
	let groups = retrieval::search_text(
		&ctx,
		&params.device,
		&params.query,
		&query_opts(params.top_k, params.sort_by),
	)
	.await
	.map_err(|e| ApiError::ModelFailure(e.to_string()))?;
	Ok(Json(serde_json::to_value(&groups).unwrap()))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SearchImageParams {
	device: String,
	top_k: Option<usize>,
	sort_by: Option<SortBy>,
}

async fn search_image(
	State(ctx): State<Arc<Context>>,
	Query(params): Query<SearchImageParams>,
	mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
	let mut query: Option<ImageQuery> = None;
	while let Some(field) = multipart
		.next_field()
		.await
		.map_err(|e| ApiError::InvalidInput(e.to_string()))?
	{
		match field.name() {
			Some("path") => {
				query = Some(ImageQuery::Known(
					field
						.text()
						.await
						.map_err(|e| ApiError::InvalidInput(e.to_string()))?,
				))
			}
			Some("file") => {
				query = Some(ImageQuery::Bytes(
					field
						.bytes()
						.await
						.map_err(|e| ApiError::InvalidInput(e.to_string()))?
						.to_vec(),
				))
			}
			_ => {}
		}
	}
	let query = query.ok_or_else(|| ApiError::InvalidInput("path or file is required".into()))?;
	let groups = retrieval::search_image(
		&ctx,
		&params.device,
		query,
		&query_opts(params.top_k, params.sort_by),
	)
	.await
	.map_err(|e| ApiError::ModelFailure(e.to_string()))?;
	Ok(Json(serde_json::to_value(&groups).unwrap()))
}

async fn search_faces(
	State(ctx): State<Arc<Context>>,
	Query(params): Query<DeviceQuery>,
	mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
	let mut crops: Vec<Vec<u8>> = Vec::new();
	while let Some(field) = multipart
		.next_field()
		.await
		.map_err(|e| ApiError::InvalidInput(e.to_string()))?
	{
		if field.name() == Some("files") {
			crops.push(
				field
					.bytes()
					.await
					.map_err(|e| ApiError::InvalidInput(e.to_string()))?
					.to_vec(),
			);
		}
	}
	if crops.is_empty() {
		return Err(ApiError::InvalidInput("files are required".into()));
	}
	let records = retrieval::search_faces(&ctx, &params.device, &crops, &retrieval::allow_all())
		.await
		.map_err(|e| ApiError::ModelFailure(e.to_string()))?;
	Ok(Json(serde_json::to_value(&records).unwrap()))
}

async fn timeline(
	State(ctx): State<Arc<Context>>,
	Query(params): Query<GetImagesQuery>,
) -> Result<Json<Value>, ApiError> {
	let entries = retrieval::day_timeline(&ctx, &params.device, &params.date)
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;
	Ok(Json(serde_json::to_value(&entries).unwrap()))
}

// --- whitelist and deletion -------------------------------------------------

/// Whitelist crops are stored expanded by this fraction per side.
const WHITELIST_CROP_EXPAND: f32 = 0.2;

async fn add_whitelist(
	State(ctx): State<Arc<Context>>,
	headers: HeaderMap,
	mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
	let device = device_from_headers(&headers)?;
	let mut name: Option<String> = None;
	let mut files: Vec<Vec<u8>> = Vec::new();
	while let Some(field) = multipart
		.next_field()
		.await
		.map_err(|e| ApiError::InvalidInput(e.to_string()))?
	{
		match field.name() {
			Some("name") => {
				name = Some(
					field
						.text()
						.await
						.map_err(|e| ApiError::InvalidInput(e.to_string()))?,
				)
			}
			Some("files") => files.push(
				field
					.bytes()
					.await
					.map_err(|e| ApiError::InvalidInput(e.to_string()))?
					.to_vec(),
			),
			_ => {}
		}
	}
	let name = name.ok_or_else(|| ApiError::InvalidInput("name is required".into()))?;
	if files.is_empty() {
		return Err(ApiError::InvalidInput("files are required".into()));
	}

	ctx.db
		.get_or_create_device(&device, ctx.models.encoder.dim())
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;

	let mut embeddings = Vec::new();
	let mut cropped = Vec::new();
	for file in &files {
		let img = match image::load_from_memory(file) {
			Ok(img) => img,
			Err(err) => {
				log::warn!("unreadable whitelist image: {}", err);
				continue;
			}
		};
		let faces = ctx
			.models
			.faces
			.detect_faces(file)
			.await
			.map_err(|e| ApiError::ModelFailure(e.to_string()))?;
		let face = match faces.first() {
			Some(face) => face,
			None => continue,
		};
		let [x1, y1, x2, y2] = face.bbox;
		let w = (x2 - x1) as f32;
		let h = (y2 - y1) as f32;
		let cx1 = ((x1 as f32 - w * WHITELIST_CROP_EXPAND).max(0.0)) as u32;
		let cy1 = ((y1 as f32 - h * WHITELIST_CROP_EXPAND).max(0.0)) as u32;
		let cx2 = ((x2 as f32 + w * WHITELIST_CROP_EXPAND) as u32).min(img.width());
		let cy2 = ((y2 as f32 + h * WHITELIST_CROP_EXPAND) as u32).min(img.height());
		if cx2 <= cx1 || cy2 <= cy1 {
			continue;
		}
		let crop = img.crop_imm(cx1, cy1, cx2 - cx1, cy2 - cy1);
		let mut jpeg = Vec::new();
		if crop
			.write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
			.is_err()
		{
			continue;
		}
		embeddings.push(face.embedding.clone());
		cropped.push(base64::engine::general_purpose::STANDARD.encode(&jpeg));
	}
	if embeddings.is_empty() {
		return Err(ApiError::InvalidInput("no face found in the uploads".into()));
	}
	let count = embeddings.len();
	ctx.db
		.add_whitelist_face(
			&device,
			WhitelistFace {
				name: name.clone(),
				embeddings,
				cropped,
			},
		)
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;
	Ok(Json(json!({ "name": name, "faces": count })))
}

#[derive(Deserialize, Debug)]
struct DeleteImageQuery {
	device: String,
	path: String,
}

async fn delete_image(
	State(ctx): State<Arc<Context>>,
	Query(params): Query<DeleteImageQuery>,
) -> Result<Json<Value>, ApiError> {
	let record = ctx
		.db
		.get_asset(&params.device, &params.path)
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;
	if record.is_none() {
		return Err(ApiError::NotFound(format!("unknown asset {}", params.path)));
	}
	ctx.db
		.mark_deleted(&params.device, &params.path, ctx.now_ms())
		.await
		.map_err(|e| ApiError::Transient(e.to_string()))?;
	Ok(Json(json!({ "ok": true })))
}
