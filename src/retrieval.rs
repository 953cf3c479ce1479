use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::context::Context;
use crate::db::AssetQuery;
use crate::ortho::dot;
use crate::ortho::l2_normalize;
use crate::types::AssetRecord;
use crate::types::SortBy;
use crate::vector_index::vector_id;
use crate::vector_index::DEFAULT_MODEL;
use crate::vector_index::FACE_DIM;
use crate::vector_index::FACE_MODEL;

/// Hits per reference crop in face search.
const FACE_TOP_K: usize = 5;

/// Caller-supplied access check, evaluated per record after the vector
/// query. Typically derived from the (user, device) access level.
pub type AccessPredicate = Arc<dyn Fn(&AssetRecord) -> bool + Send + Sync>;

pub fn allow_all() -> AccessPredicate {
	Arc::new(|_| true)
}

pub struct QueryOpts {
	pub top_k: usize,
	pub sort_by: SortBy,
	/// Extra paths the caller wants dropped (besides the tombstone set).
	pub remove: HashSet<String>,
	pub access: AccessPredicate,
}

impl QueryOpts {
	pub fn new(top_k: usize, sort_by: SortBy) -> QueryOpts {
		QueryOpts {
			top_k,
			sort_by,
			remove: HashSet::new(),
			access: allow_all(),
		}
	}
}

pub enum ImageQuery {
	/// An already-indexed asset, by canonical relpath.
	Known(String),
	/// A fresh query image.
	Bytes(Vec<u8>),
}

/// Text search: encode, rotate into the device's embedding space, query,
/// filter, group by segment.
pub async fn search_text(
	ctx: &Arc<Context>,
	device: &str,
	text: &str,
	opts: &QueryOpts,
) -> anyhow::Result<Vec<Vec<AssetRecord>>> {
	let mut query = ctx.models.encoder.encode_text(text).await?;
	l2_normalize(&mut query);
	let registered = ctx
		.db
		.get_or_create_device(device, ctx.models.encoder.dim())
		.await?;
	let query = registered.transform.apply(&query);
	let ranked = ranked_paths(ctx, device, &query, opts.top_k).await?;
	group_hits(ctx, device, ranked, opts).await
}

/// Image search: by id when the query is already indexed, otherwise encode
/// the supplied bytes.
pub async fn search_image(
	ctx: &Arc<Context>,
	device: &str,
	query: ImageQuery,
	opts: &QueryOpts,
) -> anyhow::Result<Vec<Vec<AssetRecord>>> {
	let collection = ctx
		.vectors
		.collection(device, DEFAULT_MODEL, ctx.models.encoder.dim())
		.await?;
	let ranked = match query {
		ImageQuery::Known(path) => {
			let hits = collection.query_by_id(&vector_id(&path), opts.top_k).await;
			resolve_paths(&collection, hits).await
		}
		ImageQuery::Bytes(bytes) => {
			// The encoder is path-based; park the query image next to the
			// other temp state.
			let tmp = std::env::temp_dir().join(format!("query-{}.jpg", uuid::Uuid::new_v4()));
			let img = image::load_from_memory(&bytes)?;
			img.save_with_format(&tmp, image::ImageFormat::Jpeg)?;
			let encoded = ctx.models.encoder.encode_image(&tmp).await;
			let _ = std::fs::remove_file(&tmp);
			let mut vector = encoded?;
			l2_normalize(&mut vector);
			let registered = ctx
				.db
				.get_or_create_device(device, ctx.models.encoder.dim())
				.await?;
			let vector = registered.transform.apply(&vector);
			let hits = collection.query_by_vector(&vector, opts.top_k).await;
			resolve_paths(&collection, hits).await
		}
	};
	group_hits(ctx, device, ranked, opts).await
}

/// Face search over the device face collection. Results are flat records
/// ordered by capture time, newest first.
pub async fn search_faces(
	ctx: &Arc<Context>,
	device: &str,
	crops: &[Vec<u8>],
	access: &AccessPredicate,
) -> anyhow::Result<Vec<AssetRecord>> {
	let collection = ctx.vectors.collection(device, FACE_MODEL, FACE_DIM).await?;
	let mut paths: Vec<String> = Vec::new();
	let mut seen = HashSet::new();
	for crop in crops {
		let faces = ctx.models.faces.detect_faces(crop).await?;
		let face = match faces.first() {
			Some(face) => face,
			None => continue,
		};
		let hits = collection.query_by_vector(&face.embedding, FACE_TOP_K).await;
		for path in resolve_paths(&collection, hits).await {
			if seen.insert(path.clone()) {
				paths.push(path);
			}
		}
	}
	if paths.is_empty() {
		return Ok(Vec::new());
	}

	let tombstone = ctx.db.deleted_paths(device).await?;
	let paths: Vec<String> = paths
		.into_iter()
		.filter(|p| !tombstone.contains(p))
		.collect();
	let mut records = ctx
		.db
		.find_assets(&AssetQuery {
			device: Some(device.to_string()),
			paths: Some(paths),
			deleted: Some(false),
			..Default::default()
		})
		.await?;
	records.retain(|r| access(r));
	records.sort_by(|a, b| b.capture_time.cmp(&a.capture_time));
	Ok(records)
}

async fn ranked_paths(
	ctx: &Arc<Context>,
	device: &str,
	query: &[f32],
	top_k: usize,
) -> anyhow::Result<Vec<String>> {
	let collection = ctx
		.vectors
		.collection(device, DEFAULT_MODEL, ctx.models.encoder.dim())
		.await?;
	let hits = collection.query_by_vector(query, top_k).await;
	Ok(resolve_paths(&collection, hits).await)
}

async fn resolve_paths(
	collection: &crate::vector_index::Collection,
	hits: Vec<(String, f32)>,
) -> Vec<String> {
	let mut paths = Vec::with_capacity(hits.len());
	for (id, _) in hits {
		if let Some(record) = collection.get(&id).await {
			paths.push(record.path);
		}
	}
	paths
}

/// Shared post-query path: drop tombstoned and caller-removed paths, apply
/// the access predicate, group by segment id (unsegmented records form
/// their own group), order the groups.
async fn group_hits(
	ctx: &Arc<Context>,
	device: &str,
	ranked: Vec<String>,
	opts: &QueryOpts,
) -> anyhow::Result<Vec<Vec<AssetRecord>>> {
	let tombstone = ctx.db.deleted_paths(device).await?;
	let ranked: Vec<String> = ranked
		.into_iter()
		.filter(|p| !tombstone.contains(p) && !opts.remove.contains(p))
		.collect();
	if ranked.is_empty() {
		return Ok(Vec::new());
	}

	let records = ctx
		.db
		.find_assets(&AssetQuery {
			device: Some(device.to_string()),
			paths: Some(ranked.clone()),
			deleted: Some(false),
			..Default::default()
		})
		.await?;
	let mut by_path: HashMap<String, AssetRecord> = records
		.into_iter()
		.filter(|r| (opts.access)(r))
		.map(|r| (r.path.clone(), r))
		.collect();

	// Group in rank order so relevance ordering falls out naturally.
	let mut group_index: HashMap<Option<i64>, usize> = HashMap::new();
	let mut groups: Vec<Vec<AssetRecord>> = Vec::new();
	for path in &ranked {
		let record = match by_path.remove(path) {
			Some(record) => record,
			None => continue,
		};
		match group_index.get(&record.segment_id) {
			Some(&i) => groups[i].push(record),
			None => {
				group_index.insert(record.segment_id, groups.len());
				groups.push(vec![record]);
			}
		}
	}

	for group in groups.iter_mut() {
		group.sort_by(|a, b| b.capture_time.cmp(&a.capture_time));
	}
	if opts.sort_by == SortBy::Time {
		groups.sort_by_key(|g| std::cmp::Reverse(g.iter().map(|r| r.capture_time).max()));
	}
	Ok(groups)
}

/// Pick `clamp(ceil(n / 100), 3, 8)` representatives (all of them when the
/// set is smaller than 3): score against the normalised centroid, blended
/// 50/50 with the query embedding when one is present.
pub fn pick_representatives(
	candidates: &[(String, Vec<f32>)],
	query: Option<&[f32]>,
) -> Vec<String> {
	let n = candidates.len();
	if n == 0 {
		return Vec::new();
	}
	let count = if n < 3 {
		n
	} else {
		(n.div_ceil(100)).clamp(3, 8).min(n)
	};

	let dim = candidates[0].1.len();
	let mut c = vec![0.0f32; dim];
	for (_, v) in candidates {
		for (acc, x) in c.iter_mut().zip(v) {
			*acc += x;
		}
	}
	l2_normalize(&mut c);

	let alpha = if query.is_some() { 0.5 } else { 1.0 };
	let mut scored: Vec<(f32, &String)> = candidates
		.iter()
		.map(|(path, v)| {
			let mut score = alpha * dot(v, &c);
			if let Some(q) = query {
				score += (1.0 - alpha) * dot(v, q);
			}
			(score, path)
		})
		.collect();
	scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
	scored
		.into_iter()
		.take(count)
		.map(|(_, path)| path.clone())
		.collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
	pub segment_id: i64,
	pub activity: String,
	pub activity_description: String,
	pub start_time: i64,
	pub end_time: i64,
	pub asset_count: usize,
	pub representatives: Vec<String>,
}

/// Day timeline for the UI: one entry per segment, with representative
/// thumbnails picked by the centroid scorer.
pub async fn day_timeline(
	ctx: &Arc<Context>,
	device: &str,
	date: &str,
) -> anyhow::Result<Vec<TimelineEntry>> {
	let groups = ctx.db.segment_groups(device, date).await?;
	let collection = ctx
		.vectors
		.collection(device, DEFAULT_MODEL, ctx.models.encoder.dim())
		.await?;

	let mut entries = Vec::with_capacity(groups.len());
	for (segment_id, records) in groups {
		let ids: Vec<String> = records.iter().map(|r| vector_id(&r.path)).collect();
		let vectors = collection.fetch(&ids).await;
		let candidates: Vec<(String, Vec<f32>)> = records
			.iter()
			.filter_map(|r| {
				vectors
					.get(&vector_id(&r.path))
					.map(|v| (r.path.clone(), v.vector.clone()))
			})
			.collect();
		let representatives = pick_representatives(&candidates, None);
		let first = records.first().expect("non-empty group");
		let last = records.last().expect("non-empty group");
		entries.push(TimelineEntry {
			segment_id,
			activity: first.activity.clone(),
			activity_description: first.activity_description.clone(),
			start_time: first.capture_time,
			end_time: last.capture_time,
			asset_count: records.len(),
			representatives,
		});
	}
	entries.sort_by_key(|e| e.start_time);
	Ok(entries)
}
