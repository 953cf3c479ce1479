use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;

use crate::types::Detection;

/// Image/text embedding model. Vectors come back L2-normalisable; the
/// dimension is fixed per model.
#[async_trait]
pub trait ImageTextEncoder: Send + Sync {
	fn dim(&self) -> usize;
	async fn encode_image(&self, path: &Path) -> anyhow::Result<Vec<f32>>;
	async fn encode_text(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

#[async_trait]
pub trait ObjectDetector: Send + Sync {
	async fn detect(&self, path: &Path) -> anyhow::Result<Vec<Detection>>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFace {
	pub bbox: [i32; 4],
	pub confidence: f32,
	pub embedding: Vec<f32>,
}

/// Face detector + embedder, fed image bytes (typically a person crop).
#[async_trait]
pub trait FaceDetector: Send + Sync {
	async fn detect_faces(&self, image: &[u8]) -> anyhow::Result<Vec<RawFace>>;
}

/// Promptable segmenter; returns the union mask over the given labels,
/// 255 = masked.
#[async_trait]
pub trait MaskSegmenter: Send + Sync {
	async fn mask(&self, path: &Path, labels: &[&str]) -> anyhow::Result<image::GrayImage>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentDescription {
	pub category: String,
	pub description: String,
	pub confidence: String,
}

/// The LLM-backed worker that writes activity descriptions for freshly
/// assigned segments. Best-effort from the caller's standpoint.
#[async_trait]
pub trait SegmentDescriber: Send + Sync {
	async fn describe(
		&self,
		device: &str,
		date: &str,
		thumbnails: &[PathBuf],
	) -> anyhow::Result<SegmentDescription>;
}

/// Bundle of all model handles threaded through the pipeline and retrieval.
#[derive(Clone)]
pub struct Models {
	pub encoder: Arc<dyn ImageTextEncoder>,
	pub detector: Arc<dyn ObjectDetector>,
	pub faces: Arc<dyn FaceDetector>,
	pub masks: Arc<dyn MaskSegmenter>,
	pub describer: Arc<dyn SegmentDescriber>,
}

impl Models {
	pub fn remote(base_url: &str, dim: usize) -> Models {
		let client = Arc::new(SidecarClient::new(base_url));
		Models {
			encoder: Arc::new(RemoteEncoder {
				client: client.clone(),
				dim,
			}),
			detector: Arc::new(RemoteDetector {
				client: client.clone(),
			}),
			faces: Arc::new(RemoteFaceDetector {
				client: client.clone(),
			}),
			masks: Arc::new(RemoteMaskSegmenter {
				client: client.clone(),
			}),
			describer: Arc::new(RemoteDescriber { client }),
		}
	}
}

/// Known activity labels for segment classification. Model output is free
/// text; `canonical_activity` snaps it onto this table.
pub const ACTIVITY_CATEGORIES: &[&str] = &[
	"Writing",
	"Coding",
	"Email & Admin",
	"Taking Notes",
	"Meeting",
	"Zoom Call",
	"Conference / Workshop",
	"Lecturing",
	"Commuting",
	"Walking on Campus",
	"Eating",
	"Drinking",
	"Making Coffee",
	"Making Tea",
	"Cooking at Home",
	"Eating Out",
	"Reading",
	"Watching TV",
	"Listening to Music",
	"Exercise / Gym",
	"Relaxing / Doing Nothing",
	"Talking with People",
	"Video Call",
	"Family Time",
	"Shopping / Errands",
	"House Cleaning",
	"Personal Care",
	"Sleeping",
	"Resting",
	"Transit / Waiting",
	"Unclear Activity",
];

pub fn canonical_activity(raw: &str) -> &'static str {
	let raw = raw.to_lowercase();
	ACTIVITY_CATEGORIES
		.iter()
		.find(|c| raw.contains(&c.to_lowercase()) || c.to_lowercase().contains(&raw))
		.copied()
		.unwrap_or("Unclear Activity")
}

// --- HTTP sidecar implementations ------------------------------------------

const MODEL_TIMEOUT: Duration = Duration::from_secs(120);
const MODEL_RETRIES: usize = 3;

/// Thin client for the GPU inference sidecar. Every call has a hard timeout
/// and a bounded retry budget; a final failure surfaces without mutating
/// anything.
pub struct SidecarClient {
	base_url: String,
	client: reqwest::Client,
}

impl SidecarClient {
	pub fn new(base_url: &str) -> SidecarClient {
		SidecarClient {
			base_url: base_url.trim_end_matches('/').to_string(),
			client: reqwest::Client::builder()
				.timeout(MODEL_TIMEOUT)
				.build()
				.expect("reqwest client"),
		}
	}

	async fn post_json(&self, endpoint: &str, body: Value) -> anyhow::Result<Value> {
		let url = format!("{}/{}", self.base_url, endpoint);
		let mut last_err = anyhow!("no attempt made");
		for attempt in 0..MODEL_RETRIES {
			match self.client.post(&url).json(&body).send().await {
				Ok(resp) if resp.status().is_success() => {
					return Ok(resp.json().await?);
				}
				Ok(resp) => {
					last_err = anyhow!("{} returned {}", url, resp.status());
				}
				Err(err) => {
					last_err = anyhow!("{} failed: {}", url, err);
				}
			}
			log::warn!("model call attempt {} failed: {}", attempt + 1, last_err);
		}
		Err(last_err)
	}

	async fn post_bytes(&self, endpoint: &str, body: Vec<u8>) -> anyhow::Result<Value> {
		let url = format!("{}/{}", self.base_url, endpoint);
		let mut last_err = anyhow!("no attempt made");
		for attempt in 0..MODEL_RETRIES {
			match self.client.post(&url).body(body.clone()).send().await {
				Ok(resp) if resp.status().is_success() => {
					return Ok(resp.json().await?);
				}
				Ok(resp) => {
					last_err = anyhow!("{} returned {}", url, resp.status());
				}
				Err(err) => {
					last_err = anyhow!("{} failed: {}", url, err);
				}
			}
			log::warn!("model call attempt {} failed: {}", attempt + 1, last_err);
		}
		Err(last_err)
	}
}

fn vec_from_value(value: &Value) -> anyhow::Result<Vec<f32>> {
	let arr = value
		.as_array()
		.ok_or_else(|| anyhow!("expected a float array"))?;
	arr.iter()
		.map(|v| {
			v.as_f64()
				.map(|f| f as f32)
				.ok_or_else(|| anyhow!("non-numeric embedding element"))
		})
		.collect()
}

struct RemoteEncoder {
	client: Arc<SidecarClient>,
	dim: usize,
}

#[async_trait]
impl ImageTextEncoder for RemoteEncoder {
	fn dim(&self) -> usize {
		self.dim
	}

	async fn encode_image(&self, path: &Path) -> anyhow::Result<Vec<f32>> {
		let resp = self
			.client
			.post_json("encode_image", json!({ "path": path.to_string_lossy() }))
			.await?;
		vec_from_value(&resp["embedding"])
	}

	async fn encode_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
		let resp = self
			.client
			.post_json("encode_text", json!({ "text": text }))
			.await?;
		vec_from_value(&resp["embedding"])
	}
}

struct RemoteDetector {
	client: Arc<SidecarClient>,
}

#[async_trait]
impl ObjectDetector for RemoteDetector {
	async fn detect(&self, path: &Path) -> anyhow::Result<Vec<Detection>> {
		let resp = self
			.client
			.post_json("detect", json!({ "path": path.to_string_lossy() }))
			.await?;
		Ok(serde_json::from_value(resp["objects"].clone())?)
	}
}

struct RemoteFaceDetector {
	client: Arc<SidecarClient>,
}

#[async_trait]
impl FaceDetector for RemoteFaceDetector {
	async fn detect_faces(&self, image: &[u8]) -> anyhow::Result<Vec<RawFace>> {
		let resp = self.client.post_bytes("faces", image.to_vec()).await?;
		Ok(serde_json::from_value(resp["faces"].clone())?)
	}
}

struct RemoteMaskSegmenter {
	client: Arc<SidecarClient>,
}

#[async_trait]
impl MaskSegmenter for RemoteMaskSegmenter {
	async fn mask(&self, path: &Path, labels: &[&str]) -> anyhow::Result<image::GrayImage> {
		let resp = self
			.client
			.post_json(
				"mask",
				json!({ "path": path.to_string_lossy(), "labels": labels }),
			)
			.await?;
		// The sidecar returns the union mask as a base64 PNG.
		let encoded = resp["mask"]
			.as_str()
			.ok_or_else(|| anyhow!("expected a base64 mask"))?;
		let png = base64::engine::general_purpose::STANDARD
			.decode(encoded)
			.map_err(|e| anyhow!("undecodable mask: {e}"))?;
		Ok(image::load_from_memory(&png)?.to_luma8())
	}
}

struct RemoteDescriber {
	client: Arc<SidecarClient>,
}

#[async_trait]
impl SegmentDescriber for RemoteDescriber {
	async fn describe(
		&self,
		device: &str,
		date: &str,
		thumbnails: &[PathBuf],
	) -> anyhow::Result<SegmentDescription> {
		let paths: Vec<String> = thumbnails
			.iter()
			.map(|p| p.to_string_lossy().into_owned())
			.collect();
		let resp = self
			.client
			.post_json(
				"describe_segment",
				json!({ "device": device, "date": date, "thumbnails": paths }),
			)
			.await?;
		Ok(serde_json::from_value(resp)?)
	}
}

// --- test doubles -----------------------------------------------------------
