use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context as _;
use tokio::sync::Mutex;

use crate::ortho::dot;
use crate::ortho::l2_normalize;

/// Collection name of the image-text search embeddings.
pub const DEFAULT_MODEL: &str = "conclip";
/// Collection name of the per-face embeddings.
pub const FACE_MODEL: &str = "faces";
pub const FACE_DIM: usize = 512;

const MAGIC: &[u8] = b"LLVEC";
const VERSION: u16 = 1;
const OP_INSERT: u8 = 1;
const OP_DELETE: u8 = 2;

/// One stored vector. `id` is the path with separators substituted so it is
/// safe as a flat key; the payload keeps the original path.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
	pub id: String,
	pub path: String,
	pub vector: Vec<f32>,
	pub timestamp: Option<i64>,
	pub whitelist: Option<bool>,
}

pub fn vector_id(path: &str) -> String {
	path.replace(['/', '\\'], "_")
}

/// A single `(device, model)` collection of fixed-dimension L2-normalised
/// vectors, persisted as an append-only operation log that `optimize`
/// rewrites compacted.
#[derive(Debug)]
pub struct Collection {
	dim: usize,
	file: PathBuf,
	entries: Mutex<HashMap<String, VectorRecord>>,
}

impl Collection {
	pub fn open(dir: &Path, dim: usize) -> anyhow::Result<Collection> {
		std::fs::create_dir_all(dir)?;
		let file = dir.join("index.vec");
		let entries = if file.exists() {
			let buf = std::fs::read(&file)
				.with_context(|| format!("cannot read {}", file.display()))?;
			replay(&buf, dim)?
		} else {
			write_header(&file, dim)?;
			HashMap::new()
		};
		Ok(Collection {
			dim,
			file,
			entries: Mutex::new(entries),
		})
	}

	pub async fn len(&self) -> usize {
		self.entries.lock().await.len()
	}

	/// Insert or replace. The vector is L2-normalised before it is stored;
	/// the collection never holds a non-normalised vector.
	pub async fn insert(&self, mut record: VectorRecord) -> anyhow::Result<()> {
		if record.vector.len() != self.dim {
			return Err(anyhow!(
				"vector has dim {}, collection wants {}",
				record.vector.len(),
				self.dim
			));
		}
		l2_normalize(&mut record.vector);
		let mut entries = self.entries.lock().await;
		append_op(&self.file, OP_INSERT, &record)?;
		entries.insert(record.id.clone(), record);
		Ok(())
	}

	pub async fn insert_batch(&self, records: Vec<VectorRecord>) -> anyhow::Result<()> {
		for record in records {
			self.insert(record).await?;
		}
		self.optimize().await
	}

	pub async fn get(&self, id: &str) -> Option<VectorRecord> {
		self.entries.lock().await.get(id).cloned()
	}

	pub async fn fetch(&self, ids: &[String]) -> HashMap<String, VectorRecord> {
		let entries = self.entries.lock().await;
		ids.iter()
			.filter_map(|id| entries.get(id).map(|r| (id.clone(), r.clone())))
			.collect()
	}

	/// `(id, payload path)` of every stored record.
	pub async fn paths(&self) -> Vec<(String, String)> {
		self.entries
			.lock()
			.await
			.values()
			.map(|r| (r.id.clone(), r.path.clone()))
			.collect()
	}

	pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
		let mut entries = self.entries.lock().await;
		if entries.remove(id).is_none() {
			return Ok(false);
		}
		let tombstone = VectorRecord {
			id: id.to_string(),
			path: String::new(),
			vector: Vec::new(),
			timestamp: None,
			whitelist: None,
		};
		append_op(&self.file, OP_DELETE, &tombstone)?;
		Ok(true)
	}

	/// Delete every record matching the predicate; returns how many went.
	pub async fn delete_where(
		&self,
		predicate: impl Fn(&VectorRecord) -> bool,
	) -> anyhow::Result<usize> {
		let doomed: Vec<String> = {
			let entries = self.entries.lock().await;
			entries
				.values()
				.filter(|r| predicate(r))
				.map(|r| r.id.clone())
				.collect()
		};
		for id in &doomed {
			self.delete(id).await?;
		}
		Ok(doomed.len())
	}

	/// Top-k by cosine score. The query is normalised locally so callers may
	/// hand in raw model output.
	pub async fn query_by_vector(&self, vector: &[f32], k: usize) -> Vec<(String, f32)> {
		let mut query = vector.to_vec();
		l2_normalize(&mut query);
		let entries = self.entries.lock().await;
		let mut scored: Vec<(String, f32)> = entries
			.values()
			.map(|r| (r.id.clone(), dot(&r.vector, &query)))
			.collect();
		scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
		scored.truncate(k);
		scored
	}

	/// Like `query_by_vector` but seeded by a stored id. Unknown ids return
	/// an empty result, not an error.
	pub async fn query_by_id(&self, id: &str, k: usize) -> Vec<(String, f32)> {
		let vector = match self.get(id).await {
			Some(record) => record.vector,
			None => return Vec::new(),
		};
		self.query_by_vector(&vector, k).await
	}

	/// Rewrite the log without superseded or deleted records. Idempotent.
	pub async fn optimize(&self) -> anyhow::Result<()> {
		let entries = self.entries.lock().await;
		let tmp = self.file.with_extension("tmp");
		{
			let mut out = std::fs::File::create(&tmp)?;
			out.write_all(&header_bytes(self.dim))?;
			for record in entries.values() {
				out.write_all(&op_bytes(OP_INSERT, record))?;
			}
			out.sync_all()?;
		}
		std::fs::rename(&tmp, &self.file)?;
		Ok(())
	}
}

/// All collections of the process, keyed `(device, model)`, lazily opened
/// under `<vec_root>/<device>_<model>/`.
#[derive(Debug)]
pub struct VectorIndex {
	root: PathBuf,
	collections: Mutex<HashMap<String, Arc<Collection>>>,
}

impl VectorIndex {
	pub fn new(root: PathBuf) -> VectorIndex {
		VectorIndex {
			root,
			collections: Mutex::new(HashMap::new()),
		}
	}

	pub async fn collection(
		&self,
		device: &str,
		model: &str,
		dim: usize,
	) -> anyhow::Result<Arc<Collection>> {
		let key = format!("{device}_{model}");
		let mut collections = self.collections.lock().await;
		if let Some(collection) = collections.get(&key) {
			return Ok(collection.clone());
		}
		let collection = Arc::new(Collection::open(&self.root.join(&key), dim)?);
		collections.insert(key, collection.clone());
		Ok(collection)
	}
}

fn header_bytes(dim: usize) -> Vec<u8> {
	let mut buf = Vec::with_capacity(MAGIC.len() + 6);
	buf.extend_from_slice(MAGIC);
	buf.extend_from_slice(&VERSION.to_le_bytes());
	buf.extend_from_slice(&(dim as u32).to_le_bytes());
	buf
}

fn write_header(file: &Path, dim: usize) -> anyhow::Result<()> {
	let mut out = std::fs::File::create(file)?;
	out.write_all(&header_bytes(dim))?;
	Ok(())
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
	buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
	buf.extend_from_slice(s.as_bytes());
}

fn op_bytes(op: u8, record: &VectorRecord) -> Vec<u8> {
	let mut buf = Vec::new();
	buf.push(op);
	put_str(&mut buf, &record.id);
	if op == OP_DELETE {
		return buf;
	}
	put_str(&mut buf, &record.path);
	buf.extend_from_slice(&(record.vector.len() as u32).to_le_bytes());
	for v in &record.vector {
		buf.extend_from_slice(&v.to_le_bytes());
	}
	match record.timestamp {
		Some(ts) => {
			buf.push(1);
			buf.extend_from_slice(&ts.to_le_bytes());
		}
		None => buf.push(0),
	}
	match record.whitelist {
		Some(true) => buf.push(2),
		Some(false) => buf.push(1),
		None => buf.push(0),
	}
	buf
}

fn append_op(file: &Path, op: u8, record: &VectorRecord) -> anyhow::Result<()> {
	let mut out = std::fs::OpenOptions::new().append(true).open(file)?;
	out.write_all(&op_bytes(op, record))?;
	Ok(())
}

struct Reader<'a> {
	buf: &'a [u8],
	ptr: usize,
}

impl<'a> Reader<'a> {
	fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
		if self.ptr + n > self.buf.len() {
			return Err(anyhow!("truncated vector log"));
		}
		let out = &self.buf[self.ptr..self.ptr + n];
		self.ptr += n;
		Ok(out)
	}

	fn u8(&mut self) -> anyhow::Result<u8> {
		Ok(self.take(1)?[0])
	}

	fn u32(&mut self) -> anyhow::Result<u32> {
		Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
	}

	fn str(&mut self) -> anyhow::Result<String> {
		let len = self.u32()? as usize;
		Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
	}
}

fn replay(buf: &[u8], dim: usize) -> anyhow::Result<HashMap<String, VectorRecord>> {
	let mut r = Reader { buf, ptr: 0 };
	if r.take(MAGIC.len())? != MAGIC {
		return Err(anyhow!("bad vector log magic"));
	}
	let version = u16::from_le_bytes(r.take(2)?.try_into().unwrap());
	if version != VERSION {
		return Err(anyhow!("unsupported vector log version {version}"));
	}
	let file_dim = r.u32()? as usize;
	if file_dim != dim {
		return Err(anyhow!("vector log dim {file_dim}, expected {dim}"));
	}
	let mut entries = HashMap::new();
	while r.ptr < r.buf.len() {
		let op = r.u8()?;
		let id = r.str()?;
		match op {
			OP_DELETE => {
				entries.remove(&id);
			}
			OP_INSERT => {
				let path = r.str()?;
				let len = r.u32()? as usize;
				let mut vector = Vec::with_capacity(len);
				for _ in 0..len {
					vector.push(f32::from_le_bytes(r.take(4)?.try_into().unwrap()));
				}
				let timestamp = match r.u8()? {
					0 => None,
					_ => Some(i64::from_le_bytes(r.take(8)?.try_into().unwrap())),
				};
				let whitelist = match r.u8()? {
					0 => None,
					1 => Some(false),
					_ => Some(true),
				};
				entries.insert(
					id.clone(),
					VectorRecord {
						id,
						path,
						vector,
						timestamp,
						whitelist,
					},
				);
			}
			other => return Err(anyhow!("unknown vector log op {other}")),
		}
	}
	Ok(entries)
}
