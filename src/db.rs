use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs::create_dir_all;
use std::path::Path;

use anyhow::anyhow;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::ToSql;
use tokio::sync::Mutex;

use crate::ortho::Transform;
use crate::types::AssetKind;
use crate::types::AssetRecord;
use crate::types::Detection;
use crate::types::FaceDetection;
use crate::types::StageFlags;
use crate::types::WhitelistFace;

struct Migration {
	id: u32,
	name: &'static str,
	sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
	id: 20250610,
	name: "init_database",
	sql: r#"
		CREATE TABLE assets (
			device TEXT NOT NULL,
			path TEXT NOT NULL,
			date TEXT NOT NULL,
			capture_time INTEGER NOT NULL,
			kind INTEGER NOT NULL DEFAULT 0,
			content_hash TEXT,
			thumbnail_path TEXT,
			objects TEXT NOT NULL DEFAULT '[]',
			people TEXT NOT NULL DEFAULT '[]',
			segment_id INTEGER,
			activity TEXT NOT NULL DEFAULT '',
			activity_description TEXT NOT NULL DEFAULT '',
			deleted BOOLEAN NOT NULL DEFAULT false,
			delete_time INTEGER,
			detected BOOLEAN NOT NULL DEFAULT false,
			redacted BOOLEAN NOT NULL DEFAULT false,
			embedded BOOLEAN NOT NULL DEFAULT false,
			created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
			PRIMARY KEY (device, path)
		);
		CREATE INDEX assets_capture_time_idx ON assets(device, capture_time);
		CREATE INDEX assets_deleted_idx ON assets(deleted);
		CREATE INDEX assets_segment_idx ON assets(device, date, segment_id);
		CREATE TABLE devices (
			id TEXT PRIMARY KEY,
			embedding_dim INTEGER NOT NULL,
			transform BLOB NOT NULL,
			whitelist TEXT NOT NULL DEFAULT '[]',
			created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
		);
	"#,
}];

pub fn open_db(path: &Path) -> anyhow::Result<Connection> {
	if let Some(parent) = path.parent() {
		if !parent.exists() {
			create_dir_all(parent)?;
		}
	}
	Ok(Connection::open(path)?)
}

#[derive(Debug, Clone)]
pub struct Device {
	pub id: String,
	pub embedding_dim: usize,
	pub transform: Transform,
	pub whitelist: Vec<WhitelistFace>,
}

/// Row to insert when an asset first lands. Stage flags start false.
#[derive(Debug, Clone)]
pub struct NewAsset {
	pub device: String,
	pub path: String,
	pub date: String,
	pub capture_time: i64,
	pub kind: AssetKind,
	pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
	CaptureTimeAsc,
	CaptureTimeDesc,
	Path,
}

/// Filtered scan parameters; `None` means "don't filter on this".
#[derive(Debug, Clone, Default)]
pub struct AssetQuery {
	pub device: Option<String>,
	pub date: Option<String>,
	pub paths: Option<Vec<String>>,
	pub deleted: Option<bool>,
	pub embedded: Option<bool>,
	/// Some(true): segment_id IS NOT NULL; Some(false): IS NULL.
	pub segmented: Option<bool>,
	pub order: Option<OrderBy>,
	pub limit: Option<usize>,
	pub skip: Option<usize>,
}

#[derive(Debug)]
pub struct DB {
	conn: Mutex<Connection>,
}

const ASSET_COLS: &str = "device, path, date, capture_time, kind, content_hash, thumbnail_path, \
	 objects, people, segment_id, activity, activity_description, deleted, delete_time, \
	 detected, redacted, embedded";

fn row_to_asset(row: &rusqlite::Row) -> rusqlite::Result<AssetRecord> {
	let objects: String = row.get(7)?;
	let people: String = row.get(8)?;
	Ok(AssetRecord {
		device: row.get(0)?,
		path: row.get(1)?,
		date: row.get(2)?,
		capture_time: row.get(3)?,
		kind: AssetKind::from_i64(row.get(4)?),
		content_hash: row.get(5)?,
		thumbnail_path: row.get(6)?,
		objects: serde_json::from_str::<Vec<Detection>>(&objects).unwrap_or_default(),
		people: serde_json::from_str::<Vec<FaceDetection>>(&people).unwrap_or_default(),
		segment_id: row.get(9)?,
		activity: row.get(10)?,
		activity_description: row.get(11)?,
		deleted: row.get(12)?,
		delete_time: row.get(13)?,
		stage: StageFlags {
			detected: row.get(14)?,
			redacted: row.get(15)?,
			embedded: row.get(16)?,
		},
	})
}

impl DB {
	pub fn new(mut conn: Connection) -> anyhow::Result<Self> {
		run_migrations(&mut conn)?;
		Ok(DB {
			conn: Mutex::new(conn),
		})
	}

	pub fn in_memory() -> Self {
		DB::new(Connection::open_in_memory().unwrap()).unwrap()
	}

	/// Insert a freshly landed asset. Re-inserting an existing (device, path)
	/// keeps the row (and its stage flags) untouched.
	pub async fn insert_asset(&self, asset: &NewAsset) -> anyhow::Result<()> {
		let conn = self.conn.lock().await;
		conn.execute(
			"INSERT INTO assets (device, path, date, capture_time, kind, content_hash)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
			 ON CONFLICT(device, path) DO NOTHING",
			rusqlite::params![
				asset.device,
				asset.path,
				asset.date,
				asset.capture_time,
				asset.kind.to_i64(),
				asset.content_hash,
			],
		)?;
		Ok(())
	}

	pub async fn get_asset(&self, device: &str, path: &str) -> anyhow::Result<Option<AssetRecord>> {
		let conn = self.conn.lock().await;
		let sql = format!("SELECT {ASSET_COLS} FROM assets WHERE device = ?1 AND path = ?2");
		let record = conn
			.query_row(&sql, [device, path], row_to_asset)
			.optional()?;
		Ok(record)
	}

	pub async fn set_detections(
		&self,
		device: &str,
		path: &str,
		objects: &[Detection],
		people: &[FaceDetection],
	) -> anyhow::Result<()> {
		let conn = self.conn.lock().await;
		let n = conn.execute(
			"UPDATE assets SET objects = ?3, people = ?4, detected = true
			 WHERE device = ?1 AND path = ?2",
			rusqlite::params![
				device,
				path,
				serde_json::to_string(objects)?,
				serde_json::to_string(people)?,
			],
		)?;
		if n == 0 {
			return Err(anyhow!("no asset {}/{}", device, path));
		}
		Ok(())
	}

	pub async fn set_thumbnail(
		&self,
		device: &str,
		path: &str,
		thumbnail_path: &str,
	) -> anyhow::Result<()> {
		let conn = self.conn.lock().await;
		let n = conn.execute(
			"UPDATE assets SET thumbnail_path = ?3, redacted = true
			 WHERE device = ?1 AND path = ?2",
			rusqlite::params![device, path, thumbnail_path],
		)?;
		if n == 0 {
			return Err(anyhow!("no asset {}/{}", device, path));
		}
		Ok(())
	}

	pub async fn set_embedded(&self, device: &str, path: &str) -> anyhow::Result<()> {
		let conn = self.conn.lock().await;
		let n = conn.execute(
			"UPDATE assets SET embedded = true WHERE device = ?1 AND path = ?2",
			[device, path],
		)?;
		if n == 0 {
			return Err(anyhow!("no asset {}/{}", device, path));
		}
		Ok(())
	}

	pub async fn find_assets(&self, query: &AssetQuery) -> anyhow::Result<Vec<AssetRecord>> {
		let conn = self.conn.lock().await;
		let mut sql = format!("SELECT {ASSET_COLS} FROM assets");
		let mut conditions: Vec<String> = Vec::new();
		let mut params: Vec<Box<dyn ToSql>> = Vec::new();

		if let Some(device) = &query.device {
			conditions.push("device = ?".into());
			params.push(Box::new(device.clone()));
		}
		if let Some(date) = &query.date {
			conditions.push("date = ?".into());
			params.push(Box::new(date.clone()));
		}
		if let Some(paths) = &query.paths {
			if paths.is_empty() {
				return Ok(Vec::new());
			}
			let placeholders = std::iter::repeat("?")
				.take(paths.len())
				.collect::<Vec<_>>()
				.join(", ");
			conditions.push(format!("path IN ({placeholders})"));
			for p in paths {
				params.push(Box::new(p.clone()));
			}
		}
		if let Some(deleted) = query.deleted {
			conditions.push("deleted = ?".into());
			params.push(Box::new(deleted));
		}
		if let Some(embedded) = query.embedded {
			conditions.push("embedded = ?".into());
			params.push(Box::new(embedded));
		}
		if let Some(segmented) = query.segmented {
			if segmented {
				conditions.push("segment_id IS NOT NULL".into());
			} else {
				conditions.push("segment_id IS NULL".into());
			}
		}
		if !conditions.is_empty() {
			sql.push_str(" WHERE ");
			sql.push_str(&conditions.join(" AND "));
		}
		match query.order {
			Some(OrderBy::CaptureTimeAsc) => sql.push_str(" ORDER BY capture_time ASC"),
			Some(OrderBy::CaptureTimeDesc) => sql.push_str(" ORDER BY capture_time DESC"),
			Some(OrderBy::Path) => sql.push_str(" ORDER BY path ASC"),
			None => {}
		}
		if let Some(limit) = query.limit {
			sql.push_str(" LIMIT ?");
			params.push(Box::new(limit as i64));
			if let Some(skip) = query.skip {
				sql.push_str(" OFFSET ?");
				params.push(Box::new(skip as i64));
			}
		}

		let mut stmt = conn.prepare(&sql)?;
		let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(|p| &**p)))?;
		let mut out = Vec::new();
		while let Some(row) = rows.next()? {
			out.push(row_to_asset(row)?);
		}
		Ok(out)
	}

	/// The deletion tombstone set of a device.
	pub async fn deleted_paths(&self, device: &str) -> anyhow::Result<HashSet<String>> {
		let conn = self.conn.lock().await;
		let mut stmt =
			conn.prepare("SELECT DISTINCT path FROM assets WHERE device = ?1 AND deleted = true")?;
		let mut rows = stmt.query([device])?;
		let mut out = HashSet::new();
		while let Some(row) = rows.next()? {
			out.insert(row.get(0)?);
		}
		Ok(out)
	}

	pub async fn all_devices(&self) -> anyhow::Result<Vec<String>> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare("SELECT DISTINCT device FROM assets ORDER BY device")?;
		let mut rows = stmt.query([])?;
		let mut out = Vec::new();
		while let Some(row) = rows.next()? {
			out.push(row.get(0)?);
		}
		Ok(out)
	}

	pub async fn all_dates(&self, device: &str) -> anyhow::Result<Vec<String>> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(
			"SELECT DISTINCT date FROM assets WHERE device = ?1 AND deleted = false ORDER BY date",
		)?;
		let mut rows = stmt.query([device])?;
		let mut out = Vec::new();
		while let Some(row) = rows.next()? {
			out.push(row.get(0)?);
		}
		Ok(out)
	}

	pub async fn mark_deleted(&self, device: &str, path: &str, now_ms: i64) -> anyhow::Result<()> {
		let conn = self.conn.lock().await;
		conn.execute(
			"UPDATE assets SET deleted = true, delete_time = ?3
			 WHERE device = ?1 AND path = ?2 AND deleted = false",
			rusqlite::params![device, path, now_ms],
		)?;
		Ok(())
	}

	/// Physical row removal; only the reconciler's cleanup paths call this.
	pub async fn purge_asset(&self, device: &str, path: &str) -> anyhow::Result<()> {
		let conn = self.conn.lock().await;
		conn.execute(
			"DELETE FROM assets WHERE device = ?1 AND path = ?2",
			[device, path],
		)?;
		Ok(())
	}

	pub async fn expired_deleted(&self, cutoff_ms: i64) -> anyhow::Result<Vec<(String, String)>> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(
			"SELECT device, path FROM assets
			 WHERE deleted = true AND delete_time IS NOT NULL AND delete_time < ?1",
		)?;
		let mut rows = stmt.query([cutoff_ms])?;
		let mut out = Vec::new();
		while let Some(row) = rows.next()? {
			out.push((row.get(0)?, row.get(1)?));
		}
		Ok(out)
	}

	// --- segmentation ------------------------------------------------------

	pub async fn max_segment_id(&self, device: &str, date: &str) -> anyhow::Result<Option<i64>> {
		let conn = self.conn.lock().await;
		let max: Option<i64> = conn.query_row(
			"SELECT MAX(segment_id) FROM assets WHERE device = ?1 AND date = ?2",
			[device, date],
			|row| row.get(0),
		)?;
		Ok(max)
	}

	/// Clear segment ids on the suffix `capture_time >= t_star`. Part of the
	/// resegmentation protocol; nothing else may null a segment id.
	pub async fn clear_segments_from(
		&self,
		device: &str,
		date: &str,
		t_star: i64,
	) -> anyhow::Result<usize> {
		let conn = self.conn.lock().await;
		let n = conn.execute(
			"UPDATE assets SET segment_id = NULL
			 WHERE device = ?1 AND date = ?2 AND capture_time >= ?3",
			rusqlite::params![device, date, t_star],
		)?;
		Ok(n)
	}

	pub async fn assign_segment(
		&self,
		device: &str,
		paths: &[String],
		segment_id: i64,
	) -> anyhow::Result<()> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;
		{
			let mut stmt = tx.prepare(
				"UPDATE assets SET segment_id = ?3 WHERE device = ?1 AND path = ?2",
			)?;
			for path in paths {
				stmt.execute(rusqlite::params![device, path, segment_id])?;
			}
		}
		tx.commit()?;
		Ok(())
	}

	/// Renumber a whole device-date in one transaction (reconciler
	/// compaction).
	pub async fn renumber_segments(
		&self,
		device: &str,
		date: &str,
		mapping: &[(i64, i64)],
	) -> anyhow::Result<()> {
		let mut conn = self.conn.lock().await;
		let tx = conn.transaction()?;
		{
			// Two passes through a temporary offset so old and new id ranges
			// can overlap.
			let mut shift = tx.prepare(
				"UPDATE assets SET segment_id = segment_id + 1000000
				 WHERE device = ?1 AND date = ?2 AND segment_id = ?3",
			)?;
			for (old, _) in mapping {
				shift.execute(rusqlite::params![device, date, old])?;
			}
			let mut set = tx.prepare(
				"UPDATE assets SET segment_id = ?4
				 WHERE device = ?1 AND date = ?2 AND segment_id = ?3",
			)?;
			for (old, new) in mapping {
				set.execute(rusqlite::params![device, date, old + 1_000_000, new])?;
			}
		}
		tx.commit()?;
		Ok(())
	}

	/// `{segment_id -> chronological records}` of one device-date,
	/// non-deleted and segmented only.
	pub async fn segment_groups(
		&self,
		device: &str,
		date: &str,
	) -> anyhow::Result<BTreeMap<i64, Vec<AssetRecord>>> {
		self.segment_groups_in_hour(device, date, None).await
	}

	/// Like `segment_groups`, optionally restricted to one UTC hour of the
	/// day.
	pub async fn segment_groups_in_hour(
		&self,
		device: &str,
		date: &str,
		hour: Option<u32>,
	) -> anyhow::Result<BTreeMap<i64, Vec<AssetRecord>>> {
		let records = self
			.find_assets(&AssetQuery {
				device: Some(device.to_string()),
				date: Some(date.to_string()),
				deleted: Some(false),
				segmented: Some(true),
				order: Some(OrderBy::CaptureTimeAsc),
				..Default::default()
			})
			.await?;
		let mut groups: BTreeMap<i64, Vec<AssetRecord>> = BTreeMap::new();
		for record in records {
			if let Some(h) = hour {
				let in_hour = crate::types::capture_datetime(record.capture_time)
					.map(|dt| chrono::Timelike::hour(&dt) == h)
					.unwrap_or(false);
				if !in_hour {
					continue;
				}
			}
			if let Some(id) = record.segment_id {
				groups.entry(id).or_default().push(record);
			}
		}
		Ok(groups)
	}

	/// Device-dates that still have embedded but unsegmented records.
	pub async fn unsegmented_dates(&self) -> anyhow::Result<Vec<(String, String)>> {
		let conn = self.conn.lock().await;
		let mut stmt = conn.prepare(
			"SELECT DISTINCT device, date FROM assets
			 WHERE deleted = false AND embedded = true AND segment_id IS NULL",
		)?;
		let mut rows = stmt.query([])?;
		let mut out = Vec::new();
		while let Some(row) = rows.next()? {
			out.push((row.get(0)?, row.get(1)?));
		}
		Ok(out)
	}

	pub async fn set_activity(
		&self,
		device: &str,
		segment_id: i64,
		activity: &str,
		description: &str,
	) -> anyhow::Result<()> {
		let conn = self.conn.lock().await;
		conn.execute(
			"UPDATE assets SET activity = ?3, activity_description = ?4
			 WHERE device = ?1 AND segment_id = ?2",
			rusqlite::params![device, segment_id, activity, description],
		)?;
		Ok(())
	}

	// --- devices -----------------------------------------------------------

	/// Look up a device, creating it (with a fresh Haar-uniform transform)
	/// on first sight.
	pub async fn get_or_create_device(&self, device: &str, dim: usize) -> anyhow::Result<Device> {
		if let Some(existing) = self.get_device(device).await? {
			return Ok(existing);
		}
		let transform = Transform::random(dim);
		{
			let conn = self.conn.lock().await;
			conn.execute(
				"INSERT INTO devices (id, embedding_dim, transform)
				 VALUES (?1, ?2, ?3)
				 ON CONFLICT(id) DO NOTHING",
				rusqlite::params![device, dim as i64, transform.to_bytes()],
			)?;
		}
		// Re-read in case another writer won the race.
		let created = self
			.get_device(device)
			.await?
			.ok_or_else(|| anyhow!("device {} vanished after insert", device))?;
		log::info!(
			"registered device {} with embedding dim {}",
			created.id,
			created.embedding_dim
		);
		Ok(created)
	}

	pub async fn get_device(&self, device: &str) -> anyhow::Result<Option<Device>> {
		let conn = self.conn.lock().await;
		let row = conn
			.query_row(
				"SELECT id, embedding_dim, transform, whitelist FROM devices WHERE id = ?1",
				[device],
				|row| {
					let id: String = row.get(0)?;
					let dim: i64 = row.get(1)?;
					let transform: Vec<u8> = row.get(2)?;
					let whitelist: String = row.get(3)?;
					Ok((id, dim, transform, whitelist))
				},
			)
			.optional()?;
		match row {
			Some((id, dim, transform, whitelist)) => Ok(Some(Device {
				id,
				embedding_dim: dim as usize,
				transform: Transform::from_bytes(&transform)?,
				whitelist: serde_json::from_str(&whitelist).unwrap_or_default(),
			})),
			None => Ok(None),
		}
	}

	pub async fn add_whitelist_face(
		&self,
		device: &str,
		face: WhitelistFace,
	) -> anyhow::Result<()> {
		let conn = self.conn.lock().await;
		let whitelist: String = conn.query_row(
			"SELECT whitelist FROM devices WHERE id = ?1",
			[device],
			|row| row.get(0),
		)?;
		let mut faces: Vec<WhitelistFace> = serde_json::from_str(&whitelist).unwrap_or_default();
		if let Some(existing) = faces.iter_mut().find(|f| f.name == face.name) {
			existing.embeddings.extend(face.embeddings);
			existing.cropped.extend(face.cropped);
		} else {
			faces.push(face);
		}
		conn.execute(
			"UPDATE devices SET whitelist = ?2 WHERE id = ?1",
			rusqlite::params![device, serde_json::to_string(&faces)?],
		)?;
		Ok(())
	}
}

fn run_migrations(conn: &mut Connection) -> anyhow::Result<()> {
	conn.execute(
		"CREATE TABLE IF NOT EXISTS migrations (
			id INTEGER PRIMARY KEY,
			name TEXT NOT NULL UNIQUE,
			applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
		)",
		(),
	)?;
	let applied: Vec<u32> = {
		let mut stmt = conn.prepare("SELECT id FROM migrations")?;
		let m = stmt.query_map((), |row| row.get(0))?;
		m.filter_map(Result::ok).collect()
	};
	let mut pending: Vec<&Migration> = MIGRATIONS
		.iter()
		.filter(|migration| !applied.contains(&migration.id))
		.collect();
	pending.sort_by_key(|migration| migration.id);
	for migration in pending {
		log::info!("applying migration {}: {}", migration.id, migration.name);
		let tx = conn.transaction()?;
		tx.execute_batch(migration.sql)?;
		tx.execute(
			"INSERT INTO migrations (id, name) VALUES (?1, ?2)",
			[&migration.id as &dyn ToSql, &migration.name as &dyn ToSql],
		)?;
		tx.commit()?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::parse_capture_time;

	fn asset(device: &str, stem: &str) -> NewAsset {
		let ms = parse_capture_time(stem).unwrap();
		let (path, date) = crate::types::canonical_relpath(ms, "jpg").unwrap();
		NewAsset {
			device: device.to_string(),
			path,
			date,
			capture_time: ms,
			kind: AssetKind::Image,
			content_hash: None,
		}
	}

	#[tokio::test]
	async fn insert_is_idempotent() {
		let db = DB::in_memory();
		let a = asset("dev1", "20250101_093000");
		db.insert_asset(&a).await.unwrap();
		db.set_embedded("dev1", &a.path).await.unwrap();
		// Re-inserting must not reset the stage flags.
		db.insert_asset(&a).await.unwrap();
		let record = db.get_asset("dev1", &a.path).await.unwrap().unwrap();
		assert!(record.stage.embedded);
	}

	#[tokio::test]
	async fn stage_flags_progress() {
		let db = DB::in_memory();
		let a = asset("dev1", "20250101_093000");
		db.insert_asset(&a).await.unwrap();
		let record = db.get_asset("dev1", &a.path).await.unwrap().unwrap();
		assert_eq!(record.stage, StageFlags::default());

		db.set_detections("dev1", &a.path, &[], &[]).await.unwrap();
		db.set_thumbnail("dev1", &a.path, "thumb.webp").await.unwrap();
		db.set_embedded("dev1", &a.path).await.unwrap();
		let record = db.get_asset("dev1", &a.path).await.unwrap().unwrap();
		assert!(record.stage.detected && record.stage.redacted && record.stage.embedded);
		assert_eq!(record.thumbnail_path.as_deref(), Some("thumb.webp"));
	}

	#[tokio::test]
	async fn find_assets_filters_and_orders() {
		let db = DB::in_memory();
		for stem in ["20250101_093000", "20250101_093100", "20250102_120000"] {
			db.insert_asset(&asset("dev1", stem)).await.unwrap();
		}
		db.insert_asset(&asset("dev2", "20250101_080000")).await.unwrap();

		let day = db
			.find_assets(&AssetQuery {
				device: Some("dev1".into()),
				date: Some("2025-01-01".into()),
				order: Some(OrderBy::CaptureTimeAsc),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(day.len(), 2);
		assert!(day[0].capture_time < day[1].capture_time);

		let paged = db
			.find_assets(&AssetQuery {
				device: Some("dev1".into()),
				order: Some(OrderBy::CaptureTimeDesc),
				limit: Some(1),
				skip: Some(1),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(paged.len(), 1);
		assert_eq!(paged[0].date, "2025-01-01");
	}

	#[tokio::test]
	async fn tombstone_and_retention() {
		let db = DB::in_memory();
		let a = asset("dev1", "20250101_093000");
		db.insert_asset(&a).await.unwrap();
		db.mark_deleted("dev1", &a.path, 1_000).await.unwrap();
		let record = db.get_asset("dev1", &a.path).await.unwrap().unwrap();
		assert!(record.deleted);
		assert_eq!(record.delete_time, Some(1_000));
		assert!(db.deleted_paths("dev1").await.unwrap().contains(&a.path));

		// mark_deleted twice must not move delete_time.
		db.mark_deleted("dev1", &a.path, 9_999).await.unwrap();
		let record = db.get_asset("dev1", &a.path).await.unwrap().unwrap();
		assert_eq!(record.delete_time, Some(1_000));

		assert_eq!(db.expired_deleted(500).await.unwrap().len(), 0);
		let expired = db.expired_deleted(2_000).await.unwrap();
		assert_eq!(expired, vec![("dev1".to_string(), a.path.clone())]);

		db.purge_asset("dev1", &a.path).await.unwrap();
		assert!(db.get_asset("dev1", &a.path).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn segment_assignment_and_groups() {
		let db = DB::in_memory();
		let stems = ["20250101_093000", "20250101_093100", "20250101_200000"];
		for stem in stems {
			let a = asset("dev1", stem);
			db.insert_asset(&a).await.unwrap();
			db.set_embedded("dev1", &a.path).await.unwrap();
		}
		let paths: Vec<String> = stems
			.iter()
			.map(|s| format!("2025-01-01/{s}.jpg"))
			.collect();
		db.assign_segment("dev1", &paths[..2], 0).await.unwrap();
		db.assign_segment("dev1", &paths[2..], 1).await.unwrap();

		assert_eq!(db.max_segment_id("dev1", "2025-01-01").await.unwrap(), Some(1));
		let groups = db.segment_groups("dev1", "2025-01-01").await.unwrap();
		assert_eq!(groups.len(), 2);
		assert_eq!(groups[&0].len(), 2);
		assert_eq!(groups[&1].len(), 1);

		let t_star = parse_capture_time("20250101_093100").unwrap();
		let cleared = db
			.clear_segments_from("dev1", "2025-01-01", t_star)
			.await
			.unwrap();
		assert_eq!(cleared, 2);
		let unsegmented = db.unsegmented_dates().await.unwrap();
		assert_eq!(unsegmented, vec![("dev1".to_string(), "2025-01-01".to_string())]);
	}

	#[tokio::test]
	async fn renumber_compacts_ids() {
		let db = DB::in_memory();
		let stems = ["20250101_093000", "20250101_120000", "20250101_200000"];
		for (i, stem) in stems.iter().enumerate() {
			let a = asset("dev1", stem);
			db.insert_asset(&a).await.unwrap();
			db.set_embedded("dev1", &a.path).await.unwrap();
			db.assign_segment("dev1", &[a.path.clone()], [0, 2, 3][i])
				.await
				.unwrap();
		}
		db.renumber_segments("dev1", "2025-01-01", &[(2, 1), (3, 2)])
			.await
			.unwrap();
		let groups = db.segment_groups("dev1", "2025-01-01").await.unwrap();
		let ids: Vec<i64> = groups.keys().copied().collect();
		assert_eq!(ids, vec![0, 1, 2]);
	}

	#[tokio::test]
	async fn segment_groups_respect_hour_filter() {
		let db = DB::in_memory();
		for (stem, id) in [("20250101_093000", 0), ("20250101_200000", 1)] {
			let a = asset("dev1", stem);
			db.insert_asset(&a).await.unwrap();
			db.set_embedded("dev1", &a.path).await.unwrap();
			db.assign_segment("dev1", &[a.path.clone()], id).await.unwrap();
		}
		let morning = db
			.segment_groups_in_hour("dev1", "2025-01-01", Some(9))
			.await
			.unwrap();
		assert_eq!(morning.keys().copied().collect::<Vec<_>>(), vec![0]);
		let all = db.segment_groups("dev1", "2025-01-01").await.unwrap();
		assert_eq!(all.len(), 2);
	}

	#[tokio::test]
	async fn device_creation_and_whitelist() {
		let db = DB::in_memory();
		let device = db.get_or_create_device("dev1", 8).await.unwrap();
		assert_eq!(device.embedding_dim, 8);
		assert!(device.whitelist.is_empty());

		// Same transform on re-read.
		let again = db.get_or_create_device("dev1", 8).await.unwrap();
		assert_eq!(device.transform, again.transform);

		db.add_whitelist_face(
			"dev1",
			WhitelistFace {
				name: "Alice".into(),
				embeddings: vec![vec![1.0; 4]],
				cropped: vec![],
			},
		)
		.await
		.unwrap();
		db.add_whitelist_face(
			"dev1",
			WhitelistFace {
				name: "Alice".into(),
				embeddings: vec![vec![0.5; 4]],
				cropped: vec![],
			},
		)
		.await
		.unwrap();
		let device = db.get_device("dev1").await.unwrap().unwrap();
		assert_eq!(device.whitelist.len(), 1);
		assert_eq!(device.whitelist[0].embeddings.len(), 2);
	}

	#[tokio::test]
	async fn activity_writes_back_by_segment() {
		let db = DB::in_memory();
		let a = asset("dev1", "20250101_093000");
		db.insert_asset(&a).await.unwrap();
		db.set_embedded("dev1", &a.path).await.unwrap();
		db.assign_segment("dev1", &[a.path.clone()], 0).await.unwrap();
		db.set_activity("dev1", 0, "Making Coffee", "grinding beans at the counter")
			.await
			.unwrap();
		let record = db.get_asset("dev1", &a.path).await.unwrap().unwrap();
		assert_eq!(record.activity, "Making Coffee");
	}
}
