use std::path::PathBuf;

/// Root directories and tunables. Everything can be overridden through the
/// environment so that a deployment only needs a handful of variables.
#[derive(Debug, Clone)]
pub struct Config {
	pub assets_root: PathBuf,
	pub thumb_root: PathBuf,
	pub vec_root: PathBuf,
	pub db_path: PathBuf,
	/// Time gap that always starts a new segment.
	pub segment_gap_secs: i64,
	pub pipeline_workers: usize,
	pub pipeline_queue_cap: usize,
	/// Queue depth above which new uploads are rejected.
	pub queue_high_water: usize,
	/// Soft-delete retention before physical removal.
	pub retention_days: i64,
	/// Non-whitelisted face embeddings older than this are aged out.
	pub face_ttl_secs: i64,
	pub port: u16,
}

fn env_path(key: &str, default: &str) -> PathBuf {
	match std::env::var(key) {
		Ok(val) => PathBuf::from(val),
		Err(_) => PathBuf::from(default),
	}
}

fn env_num<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
	std::env::var(key)
		.ok()
		.and_then(|v| v.parse().ok())
		.unwrap_or(default)
}

impl Config {
	pub fn from_env() -> Self {
		Config {
			assets_root: env_path("ASSETS_PATH", "./data/assets"),
			thumb_root: env_path("THUMBNAILS_PATH", "./data/thumbnails"),
			vec_root: env_path("EMBEDDINGS_PATH", "./data/embeddings"),
			db_path: env_path("DB_PATH", "./data/db.sqlite"),
			segment_gap_secs: env_num("SEGMENT_GAP_SECS", 120),
			pipeline_workers: env_num("PIPELINE_WORKERS", num_cpus::get().max(1)),
			pipeline_queue_cap: env_num("PIPELINE_QUEUE_CAP", 1024),
			queue_high_water: env_num("QUEUE_HIGH_WATER", 900),
			retention_days: 30,
			face_ttl_secs: 3600,
			port: env_num("PORT", 3337),
		}
	}

	/// Config rooted at a single directory, used by tests.
	#[cfg(test)]
	pub fn rooted(dir: &std::path::Path) -> Self {
		Config {
			assets_root: dir.join("assets"),
			thumb_root: dir.join("thumbnails"),
			vec_root: dir.join("embeddings"),
			db_path: dir.join("db.sqlite"),
			segment_gap_secs: 120,
			pipeline_workers: 1,
			pipeline_queue_cap: 64,
			queue_high_water: 60,
			retention_days: 30,
			face_ttl_secs: 3600,
			port: 0,
		}
	}
}
