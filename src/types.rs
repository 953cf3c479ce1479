use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

pub const CANONICAL_STEM_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const IMAGE_EXTS: &[&str] = &["jpg"];
pub const VIDEO_EXTS: &[&str] = &["mp4", "h264", "mov", "avi"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
	Image,
	Video,
}

impl AssetKind {
	pub fn from_ext(ext: &str) -> Option<AssetKind> {
		let ext = ext.to_ascii_lowercase();
		if IMAGE_EXTS.contains(&ext.as_str()) {
			Some(AssetKind::Image)
		} else if VIDEO_EXTS.contains(&ext.as_str()) {
			Some(AssetKind::Video)
		} else {
			None
		}
	}

	pub fn to_i64(self) -> i64 {
		match self {
			AssetKind::Image => 0,
			AssetKind::Video => 1,
		}
	}

	pub fn from_i64(v: i64) -> AssetKind {
		if v == 1 {
			AssetKind::Video
		} else {
			AssetKind::Image
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
	pub label: String,
	pub confidence: f32,
	/// (x1, y1, x2, y2) in image coordinates.
	pub bbox: [i32; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceDetection {
	pub label: String,
	pub confidence: f32,
	pub bbox: [i32; 4],
	pub embedding: Vec<f32>,
}

pub const REDACTED_FACE_LABEL: &str = "redacted face";

impl FaceDetection {
	pub fn is_whitelisted(&self) -> bool {
		self.label != REDACTED_FACE_LABEL && self.label != "face"
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
	pub detected: bool,
	pub redacted: bool,
	pub embedded: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
	pub device: String,
	/// Canonical relative path `YYYY-MM-DD/YYYYMMDD_HHMMSS.<ext>`.
	pub path: String,
	pub date: String,
	/// Capture time in UTC epoch milliseconds, parsed from the filename.
	pub capture_time: i64,
	pub kind: AssetKind,
	pub content_hash: Option<String>,
	pub thumbnail_path: Option<String>,
	pub objects: Vec<Detection>,
	pub people: Vec<FaceDetection>,
	pub segment_id: Option<i64>,
	pub activity: String,
	pub activity_description: String,
	pub deleted: bool,
	pub delete_time: Option<i64>,
	#[serde(skip)]
	pub stage: StageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
	Pending,
	Processing,
	Done,
	Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
	Relevance,
	Time,
}

/// Per-device named identity whose faces are exempt from redaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistFace {
	pub name: String,
	pub embeddings: Vec<Vec<f32>>,
	/// Cropped face thumbnails, base64 jpeg.
	pub cropped: Vec<String>,
}

/// Emitted once per freshly assigned segment, consumed by the description
/// worker.
#[derive(Debug, Clone)]
pub struct SegmentEvent {
	pub device: String,
	pub date: String,
	pub segment_id: i64,
	pub paths: Vec<String>,
}

/// Parse a canonical stem (`YYYYMMDD_HHMMSS`) into UTC epoch millis.
pub fn parse_capture_time(stem: &str) -> Option<i64> {
	parse_stem_with(stem, CANONICAL_STEM_FORMAT)
}

/// Parse a stem against an arbitrary strftime format, treating the wall
/// clock as UTC.
pub fn parse_stem_with(stem: &str, format: &str) -> Option<i64> {
	NaiveDateTime::parse_from_str(stem, format)
		.ok()
		.map(|dt| dt.and_utc().timestamp_millis())
}

pub fn capture_datetime(ms: i64) -> Option<DateTime<Utc>> {
	DateTime::<Utc>::from_timestamp_millis(ms)
}

/// `1735723800000` -> `("2025-01-01/20250101_093000.jpg", "2025-01-01")`.
pub fn canonical_relpath(capture_ms: i64, ext: &str) -> Option<(String, String)> {
	let dt = capture_datetime(capture_ms)?;
	let date = dt.format("%Y-%m-%d").to_string();
	let stem = dt.format(CANONICAL_STEM_FORMAT).to_string();
	Some((format!("{date}/{stem}.{ext}"), date))
}

/// Split a canonical relative path into (date, stem, ext). Returns None for
/// anything that does not follow the on-disk naming contract.
pub fn split_relpath(relpath: &str) -> Option<(String, String, String)> {
	let (date, file) = relpath.split_once('/')?;
	let (stem, ext) = file.rsplit_once('.')?;
	if date.len() != 10 {
		return None;
	}
	Some((date.to_string(), stem.to_string(), ext.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_canonical_stem() {
		let ms = parse_capture_time("20250101_093000").unwrap();
		let dt = capture_datetime(ms).unwrap();
		assert_eq!(dt.to_rfc3339(), "2025-01-01T09:30:00+00:00");
	}

	#[test]
	fn parse_rejects_garbage() {
		assert!(parse_capture_time("not_a_time").is_none());
		assert!(parse_capture_time("2025_0101").is_none());
	}

	#[test]
	fn relpath_round_trip() {
		let ms = parse_capture_time("20250101_093000").unwrap();
		let (relpath, date) = canonical_relpath(ms, "jpg").unwrap();
		assert_eq!(relpath, "2025-01-01/20250101_093000.jpg");
		assert_eq!(date, "2025-01-01");
		let (d, stem, ext) = split_relpath(&relpath).unwrap();
		assert_eq!(d, date);
		assert_eq!(stem, "20250101_093000");
		assert_eq!(ext, "jpg");
	}

	#[test]
	fn kind_from_ext() {
		assert_eq!(AssetKind::from_ext("jpg"), Some(AssetKind::Image));
		assert_eq!(AssetKind::from_ext("MP4"), Some(AssetKind::Video));
		assert_eq!(AssetKind::from_ext("txt"), None);
	}
}
