use std::sync::Arc;

use crate::context::Context;
use crate::db::AssetQuery;
use crate::db::OrderBy;
use crate::ortho::euclidean;
use crate::types::SegmentEvent;
use crate::vector_index::vector_id;
use crate::vector_index::DEFAULT_MODEL;
use crate::vision::canonical_activity;

/// Floor for the adaptive embedding-distance threshold.
const THETA_FLOOR: f32 = 0.9;
/// Segments shorter than this are absorbed into the previous one when the
/// time gap allows it.
const MIN_SEGMENT_LEN: usize = 3;
/// At most this many thumbnails go to the description worker per segment.
const DESCRIBE_SAMPLE: usize = 20;

#[derive(Debug, Clone)]
pub struct SegmentInput {
	pub path: String,
	pub ts_ms: i64,
	pub vector: Vec<f32>,
}

/// `mean(d) + 1.5 * std(d)`, clamped to the floor; degenerate statistics
/// fall back to the floor.
fn adaptive_theta(dists: &[f32]) -> f32 {
	if dists.is_empty() {
		return THETA_FLOOR;
	}
	let n = dists.len() as f32;
	let mean = dists.iter().sum::<f32>() / n;
	let var = dists.iter().map(|d| (d - mean) * (d - mean)).sum::<f32>() / n;
	let theta = mean + 1.5 * var.sqrt();
	if !theta.is_finite() {
		return THETA_FLOOR;
	}
	theta.max(THETA_FLOOR)
}

fn centroid(inputs: &[SegmentInput], indices: &[usize]) -> Vec<f32> {
	let dim = inputs[indices[0]].vector.len();
	let mut c = vec![0.0f32; dim];
	for &i in indices {
		for (acc, v) in c.iter_mut().zip(&inputs[i].vector) {
			*acc += v;
		}
	}
	for v in c.iter_mut() {
		*v /= indices.len() as f32;
	}
	c
}

/// Partition a chronological sequence into segments: a boundary opens where
/// the time gap exceeds `gap_ms` or the embedding distance jumps past the
/// adaptive threshold, then close segments get merged back and tiny ones
/// absorbed.
pub fn partition(inputs: &[SegmentInput], gap_secs: i64) -> Vec<Vec<usize>> {
	if inputs.is_empty() {
		return Vec::new();
	}
	let gap_ms = gap_secs * 1000;
	let dists: Vec<f32> = (1..inputs.len())
		.map(|i| euclidean(&inputs[i].vector, &inputs[i - 1].vector))
		.collect();
	let theta = adaptive_theta(&dists);

	let mut segments: Vec<Vec<usize>> = vec![vec![0]];
	for i in 1..inputs.len() {
		let time_gap = inputs[i].ts_ms - inputs[i - 1].ts_ms > gap_ms;
		let jump = dists[i - 1] > theta;
		if time_gap || jump {
			segments.push(vec![i]);
		} else {
			segments.last_mut().unwrap().push(i);
		}
	}

	// Merge-back: neighbours whose centroids sit within theta/2. A time
	// boundary is hard; only embedding-split segments merge back.
	let mut merged: Vec<Vec<usize>> = Vec::new();
	for segment in segments {
		if let Some(prev) = merged.last_mut() {
			let gap = inputs[segment[0]].ts_ms - inputs[*prev.last().unwrap()].ts_ms;
			let d = euclidean(&centroid(inputs, prev), &centroid(inputs, &segment));
			if gap <= gap_ms && d < theta / 2.0 {
				prev.extend(segment);
				continue;
			}
		}
		merged.push(segment);
	}

	// Absorb short segments that start right after the previous one ends.
	let mut out: Vec<Vec<usize>> = Vec::new();
	for segment in merged {
		if let Some(prev) = out.last_mut() {
			let gap = inputs[segment[0]].ts_ms - inputs[*prev.last().unwrap()].ts_ms;
			if segment.len() < MIN_SEGMENT_LEN && gap < gap_ms {
				prev.extend(segment);
				continue;
			}
		}
		out.push(segment);
	}
	out
}

/// Incremental resegmentation of one device-date, serialized by the
/// per-key advisory lock. Only the suffix from the earliest unsegmented
/// record is recomputed; ids on the untouched prefix stay as they are and
/// every new id is strictly greater than anything previously assigned on
/// the date.
pub async fn resegment(ctx: &Arc<Context>, device: &str, date: &str) -> anyhow::Result<()> {
	let lock = ctx.segment_lock(device, date).await;
	let _guard = lock.lock().await;

	let records = ctx
		.db
		.find_assets(&AssetQuery {
			device: Some(device.to_string()),
			date: Some(date.to_string()),
			deleted: Some(false),
			embedded: Some(true),
			order: Some(OrderBy::CaptureTimeAsc),
			..Default::default()
		})
		.await?;
	if records.is_empty() {
		return Ok(());
	}
	let t_star = match records
		.iter()
		.filter(|r| r.segment_id.is_none())
		.map(|r| r.capture_time)
		.min()
	{
		Some(t) => t,
		None => return Ok(()),
	};
	let max_id = records.iter().filter_map(|r| r.segment_id).max().unwrap_or(-1);

	ctx.db.clear_segments_from(device, date, t_star).await?;

	let suffix: Vec<_> = records
		.iter()
		.filter(|r| r.capture_time >= t_star)
		.collect();
	let collection = ctx
		.vectors
		.collection(device, DEFAULT_MODEL, ctx.models.encoder.dim())
		.await?;
	let ids: Vec<String> = suffix.iter().map(|r| vector_id(&r.path)).collect();
	let vectors = collection.fetch(&ids).await;

	let mut inputs = Vec::with_capacity(suffix.len());
	for record in &suffix {
		match vectors.get(&vector_id(&record.path)) {
			Some(stored) => inputs.push(SegmentInput {
				path: record.path.clone(),
				ts_ms: record.capture_time,
				vector: stored.vector.clone(),
			}),
			None => {
				log::warn!(
					"no embedding for {}/{} despite embedded flag, skipping",
					device,
					record.path
				);
			}
		}
	}
	if inputs.is_empty() {
		return Ok(());
	}

	let parts = partition(&inputs, ctx.config.segment_gap_secs);
	let mut events = Vec::with_capacity(parts.len());
	for (offset, part) in parts.iter().enumerate() {
		let segment_id = max_id + 1 + offset as i64;
		let paths: Vec<String> = part.iter().map(|&i| inputs[i].path.clone()).collect();
		ctx.db.assign_segment(device, &paths, segment_id).await?;
		events.push(SegmentEvent {
			device: device.to_string(),
			date: date.to_string(),
			segment_id,
			paths,
		});
	}
	log::info!(
		"segmented {}/{}: {} new segments from t*={}",
		device,
		date,
		events.len(),
		t_star
	);

	// Fire-and-forget: descriptions arrive whenever the worker gets to them.
	for event in events {
		let ctx = ctx.clone();
		tokio::spawn(async move {
			describe_segment(ctx, event).await;
		});
	}
	Ok(())
}

/// Provisional id at index time: a record that is already embedded (a
/// resumed pipeline run) and extends the chronological tail of the day
/// within the gap threshold slots into the last segment. Everything else
/// waits for the segmenter.
pub async fn assign_provisional(
	ctx: &Arc<Context>,
	device: &str,
	date: &str,
	relpath: &str,
	capture_ms: i64,
) -> anyhow::Result<Option<i64>> {
	let record = match ctx.db.get_asset(device, relpath).await? {
		Some(record) => record,
		None => return Ok(None),
	};
	if !record.stage.embedded {
		return Ok(None);
	}
	if record.segment_id.is_some() {
		return Ok(record.segment_id);
	}
	let segmented = ctx
		.db
		.find_assets(&AssetQuery {
			device: Some(device.to_string()),
			date: Some(date.to_string()),
			deleted: Some(false),
			segmented: Some(true),
			order: Some(OrderBy::CaptureTimeAsc),
			..Default::default()
		})
		.await?;
	let last = match segmented.last() {
		Some(last) => last,
		None => return Ok(None),
	};
	if capture_ms > last.capture_time
		&& capture_ms - last.capture_time <= ctx.config.segment_gap_secs * 1000
	{
		let id = last.segment_id.expect("segmented record has an id");
		ctx.db
			.assign_segment(device, &[relpath.to_string()], id)
			.await?;
		return Ok(Some(id));
	}
	Ok(None)
}

/// Renumber a device-date back onto a dense 0..k prefix in chronological
/// order. Returns true when something changed. The reconciler calls this
/// lazily; suffix-only resegmentation may leave gaps behind.
pub async fn compact_ids(ctx: &Arc<Context>, device: &str, date: &str) -> anyhow::Result<bool> {
	let lock = ctx.segment_lock(device, date).await;
	let _guard = lock.lock().await;

	let groups = ctx.db.segment_groups(device, date).await?;
	if groups.is_empty() {
		return Ok(false);
	}
	let mut ordered: Vec<(i64, i64)> = groups
		.iter()
		.map(|(id, records)| (records[0].capture_time, *id))
		.collect();
	ordered.sort();
	let mapping: Vec<(i64, i64)> = ordered
		.iter()
		.enumerate()
		.filter(|(new, (_, old))| *old != *new as i64)
		.map(|(new, (_, old))| (*old, new as i64))
		.collect();
	if mapping.is_empty() {
		return Ok(false);
	}
	log::info!(
		"compacting segment ids on {}/{}: {} remapped",
		device,
		date,
		mapping.len()
	);
	ctx.db.renumber_segments(device, date, &mapping).await?;
	Ok(true)
}

async fn describe_segment(ctx: Arc<Context>, event: SegmentEvent) {
	let mut thumbnails: Vec<std::path::PathBuf> = event
		.paths
		.iter()
		.map(|p| ctx.assets.thumbnail_path(&event.device, p))
		.collect();
	if thumbnails.len() > DESCRIBE_SAMPLE {
		let step = thumbnails.len().div_ceil(DESCRIBE_SAMPLE);
		thumbnails = thumbnails.into_iter().step_by(step).collect();
	}
	match ctx
		.models
		.describer
		.describe(&event.device, &event.date, &thumbnails)
		.await
	{
		Ok(description) => {
			let activity = canonical_activity(&description.category);
			if let Err(err) = ctx
				.db
				.set_activity(
					&event.device,
					event.segment_id,
					activity,
					&description.description,
				)
				.await
			{
				log::error!(
					"cannot store activity for {} segment {}: {}",
					event.device,
					event.segment_id,
					err
				);
			}
		}
		Err(err) => {
			log::warn!(
				"segment description failed for {} segment {}: {}",
				event.device,
				event.segment_id,
				err
			);
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

	fn input(path: &str, ts_secs: i64, vector: Vec<f32>) -> SegmentInput {
		SegmentInput {
			path: path.to_string(),
			ts_ms: ts_secs * 1000,
			vector,
		}
	}

	fn unit(axis: usize) -> Vec<f32> {
		let mut v = vec![0.0f32; 4];
		v[axis] = 1.0;
		v
	}

	#[test]
	fn adaptive_theta_floors() {
		assert_eq!(adaptive_theta(&[]), THETA_FLOOR);
		assert_eq!(adaptive_theta(&[0.1, 0.1, 0.1]), THETA_FLOOR);
		// Large spread lifts the threshold above the floor.
		let theta = adaptive_theta(&[0.2, 1.9, 0.2, 1.9]);
		assert!(theta > THETA_FLOOR);
	}

	#[test]
	fn time_gap_opens_boundary() {
		let inputs = vec![
			input("a", 0, unit(0)),
			input("b", 60, unit(0)),
			input("c", 400, unit(0)),
		];
		let parts = partition(&inputs, 120);
		assert_eq!(parts, vec![vec![0, 1], vec![2]]);
	}

	#[test]
	fn close_frames_stay_together() {
		let inputs: Vec<SegmentInput> = (0..5)
			.map(|i| input(&format!("p{i}"), i * 30, unit(0)))
			.collect();
		let parts = partition(&inputs, 120);
		assert_eq!(parts.len(), 1);
		assert_eq!(parts[0], vec![0, 1, 2, 3, 4]);
	}

	#[test]
	fn embedding_jump_opens_boundary() {
		// Orthogonal unit vectors are sqrt(2) apart; keep several repeats so
		// the distance spread pushes theta above the floor only for the big
		// jumps.
		let mut inputs = Vec::new();
		for i in 0..4 {
			inputs.push(input(&format!("a{i}"), i * 30, unit(0)));
		}
		for i in 0..4 {
			let mut v = unit(1);
			v[0] = -1.0;
			let mut v = v;
			crate::ortho::l2_normalize(&mut v);
			inputs.push(input(&format!("b{i}"), 120 + i * 30, v));
		}
		let parts = partition(&inputs, 3600);
		assert_eq!(parts.len(), 2);
		assert_eq!(parts[0].len(), 4);
		assert_eq!(parts[1].len(), 4);
	}

	#[test]
	fn tiny_trailing_segment_is_absorbed() {
		// The lone trailing frame differs, but follows within the minimum
		// gap, so it folds into the previous segment.
		let mut inputs: Vec<SegmentInput> = (0..4)
			.map(|i| input(&format!("a{i}"), i * 20, unit(0)))
			.collect();
		let mut odd = unit(2);
		odd[0] = -1.0;
		crate::ortho::l2_normalize(&mut odd);
		inputs.push(input("tail", 100, odd));
		let parts = partition(&inputs, 120);
		assert_eq!(parts.len(), 1, "{parts:?}");
	}

	async fn seed_asset(
		ctx: &std::sync::Arc<crate::context::Context>,
		device: &str,
		stem: &str,
		vector: Vec<f32>,
	) -> String {
		let ms = parse_capture_time(stem).unwrap();
		let (path, date) = crate::types::canonical_relpath(ms, "jpg").unwrap();
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
				vector,
				timestamp: None,
				whitelist: None,
			})
			.await
			.unwrap();
		path
	}

	fn similar(offset: f32) -> Vec<f32> {
		let mut v = vec![1.0f32; TEST_DIM];
		v[0] += offset;
		crate::ortho::l2_normalize(&mut v);
		v
	}

	#[tokio::test]
	async fn archive_day_splits_on_time_gap() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		for stem in ["20250101_093000", "20250101_093100", "20250101_200000"] {
			seed_asset(&ctx, "dev1", stem, similar(0.01)).await;
		}
		resegment(&ctx, "dev1", "2025-01-01").await.unwrap();

		let groups = ctx.db.segment_groups("dev1", "2025-01-01").await.unwrap();
		assert_eq!(groups.len(), 2);
		assert_eq!(groups[&0].len(), 2);
		assert_eq!(groups[&0][0].path, "2025-01-01/20250101_093000.jpg");
		assert_eq!(groups[&1].len(), 1);
		assert_eq!(groups[&1][0].path, "2025-01-01/20250101_200000.jpg");
	}

	#[tokio::test]
	async fn incremental_resegmentation_touches_only_suffix() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		for stem in ["20250101_093000", "20250101_093100", "20250101_200000"] {
			seed_asset(&ctx, "dev1", stem, similar(0.01)).await;
		}
		resegment(&ctx, "dev1", "2025-01-01").await.unwrap();

		// A new photo lands inside the morning run.
		seed_asset(&ctx, "dev1", "20250101_093030", similar(0.02)).await;
		resegment(&ctx, "dev1", "2025-01-01").await.unwrap();

		let groups = ctx.db.segment_groups("dev1", "2025-01-01").await.unwrap();
		// The prefix record (09:30:00, id 0) is untouched.
		let first = ctx
			.db
			.get_asset("dev1", "2025-01-01/20250101_093000.jpg")
			.await
			.unwrap()
			.unwrap();
		assert_eq!(first.segment_id, Some(0));
		// Every reassigned id is strictly greater than the old maximum (1).
		for (id, records) in &groups {
			for record in records {
				if record.path != "2025-01-01/20250101_093000.jpg" {
					assert!(*id > 1, "id {id} not above pre-existing max");
				}
			}
		}
		// Chronological order still follows id order.
		let mut last_time = 0;
		for (_, records) in &groups {
			for record in records {
				assert!(record.capture_time >= last_time);
				last_time = record.capture_time;
			}
		}
	}

	#[tokio::test]
	async fn compact_restores_dense_prefix() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		for stem in ["20250101_093000", "20250101_093100", "20250101_200000"] {
			seed_asset(&ctx, "dev1", stem, similar(0.01)).await;
		}
		resegment(&ctx, "dev1", "2025-01-01").await.unwrap();
		seed_asset(&ctx, "dev1", "20250101_093030", similar(0.02)).await;
		resegment(&ctx, "dev1", "2025-01-01").await.unwrap();

		assert!(compact_ids(&ctx, "dev1", "2025-01-01").await.unwrap());
		let groups = ctx.db.segment_groups("dev1", "2025-01-01").await.unwrap();
		let ids: Vec<i64> = groups.keys().copied().collect();
		assert_eq!(ids, (0..ids.len() as i64).collect::<Vec<_>>());
		// Ids follow the day chronologically after compaction.
		let mut last_time = 0;
		for (_, records) in &groups {
			for record in records {
				assert!(record.capture_time >= last_time);
				last_time = record.capture_time;
			}
		}
		// Idempotent once dense.
		assert!(!compact_ids(&ctx, "dev1", "2025-01-01").await.unwrap());
	}

	#[tokio::test]
	async fn resegment_without_new_records_is_noop() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		for stem in ["20250101_093000", "20250101_093100"] {
			seed_asset(&ctx, "dev1", stem, similar(0.01)).await;
		}
		resegment(&ctx, "dev1", "2025-01-01").await.unwrap();
		let before = ctx.db.segment_groups("dev1", "2025-01-01").await.unwrap();
		resegment(&ctx, "dev1", "2025-01-01").await.unwrap();
		let after = ctx.db.segment_groups("dev1", "2025-01-01").await.unwrap();
		assert_eq!(
			before.keys().collect::<Vec<_>>(),
			after.keys().collect::<Vec<_>>()
		);
	}

	#[tokio::test]
	async fn provisional_extends_tail_for_embedded_record() {
		let (ctx, _rx, _enc, _dir) = test_ctx();
		for stem in ["20250101_093000", "20250101_093100"] {
			seed_asset(&ctx, "dev1", stem, similar(0.01)).await;
		}
		resegment(&ctx, "dev1", "2025-01-01").await.unwrap();

		// An embedded record within the gap of the tail slots into the last
		// segment.
		let path = seed_asset(&ctx, "dev1", "20250101_093200", similar(0.01)).await;
		let ms = parse_capture_time("20250101_093200").unwrap();
		let id = assign_provisional(&ctx, "dev1", "2025-01-01", &path, ms)
			.await
			.unwrap();
		assert_eq!(id, Some(0));

		// A not-yet-embedded record gets nothing.
		let ms2 = parse_capture_time("20250101_093300").unwrap();
		let (path2, date2) = crate::types::canonical_relpath(ms2, "jpg").unwrap();
		ctx.db
			.insert_asset(&NewAsset {
				device: "dev1".into(),
				path: path2.clone(),
				date: date2,
				capture_time: ms2,
				kind: AssetKind::Image,
				content_hash: None,
			})
			.await
			.unwrap();
		let id2 = assign_provisional(&ctx, "dev1", "2025-01-01", &path2, ms2)
			.await
			.unwrap();
		assert_eq!(id2, None);
	}
}
