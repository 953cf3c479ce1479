use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use tokio::fs;

use crate::types::split_relpath;

/// Content layout of originals and thumbnails on disk:
/// `<assets_root>/<device>/<YYYY-MM-DD>/<YYYYMMDD_HHMMSS>.<ext>` and
/// `<thumb_root>/<device>/<YYYY-MM-DD>/<YYYYMMDD_HHMMSS>.webp`.
#[derive(Debug, Clone)]
pub struct AssetStore {
	assets_root: PathBuf,
	thumb_root: PathBuf,
}

impl AssetStore {
	pub fn new(assets_root: PathBuf, thumb_root: PathBuf) -> AssetStore {
		AssetStore {
			assets_root,
			thumb_root,
		}
	}

	pub fn assets_root(&self) -> &Path {
		&self.assets_root
	}

	pub fn full_path(&self, device: &str, relpath: &str) -> PathBuf {
		self.assets_root.join(device).join(relpath)
	}

	pub fn thumbnail_path(&self, device: &str, relpath: &str) -> PathBuf {
		let rel = match split_relpath(relpath) {
			Some((date, stem, _)) => format!("{date}/{stem}.webp"),
			None => format!("{relpath}.webp"),
		};
		self.thumb_root.join(device).join(rel)
	}

	pub async fn exists(&self, device: &str, relpath: &str) -> bool {
		fs::try_exists(self.full_path(device, relpath))
			.await
			.unwrap_or(false)
	}

	/// Atomic write: temp file in the target directory, then rename. A put
	/// on an existing path with identical bytes is a no-op; differing bytes
	/// replace the file.
	pub async fn put(&self, device: &str, relpath: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
		let path = self.full_path(device, relpath);
		if let Ok(existing) = fs::read(&path).await {
			if existing == bytes {
				return Ok(path);
			}
		}
		write_atomic(&path, bytes).await?;
		Ok(path)
	}

	pub async fn open(&self, device: &str, relpath: &str) -> anyhow::Result<Vec<u8>> {
		let path = self.full_path(device, relpath);
		fs::read(&path)
			.await
			.with_context(|| format!("cannot read {}", path.display()))
	}

	pub async fn delete(&self, device: &str, relpath: &str) -> anyhow::Result<()> {
		let path = self.full_path(device, relpath);
		match fs::remove_file(&path).await {
			Ok(_) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	pub async fn write_thumbnail(
		&self,
		device: &str,
		relpath: &str,
		bytes: &[u8],
	) -> anyhow::Result<PathBuf> {
		let path = self.thumbnail_path(device, relpath);
		write_atomic(&path, bytes).await?;
		Ok(path)
	}

	pub async fn thumbnail_exists(&self, device: &str, relpath: &str) -> bool {
		fs::try_exists(self.thumbnail_path(device, relpath))
			.await
			.unwrap_or(false)
	}

	pub async fn delete_thumbnail(&self, device: &str, relpath: &str) -> anyhow::Result<()> {
		let path = self.thumbnail_path(device, relpath);
		match fs::remove_file(&path).await {
			Ok(_) => Ok(()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(err) => Err(err.into()),
		}
	}

	pub async fn list_devices(&self) -> anyhow::Result<Vec<String>> {
		let mut out = Vec::new();
		let mut dir = match fs::read_dir(&self.assets_root).await {
			Ok(d) => d,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
			Err(err) => return Err(err.into()),
		};
		while let Some(entry) = dir.next_entry().await? {
			if entry.file_type().await?.is_dir() {
				out.push(entry.file_name().to_string_lossy().into_owned());
			}
		}
		out.sort();
		Ok(out)
	}

	pub async fn list_dates(&self, device: &str) -> anyhow::Result<Vec<String>> {
		let mut out = Vec::new();
		let mut dir = match fs::read_dir(self.assets_root.join(device)).await {
			Ok(d) => d,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
			Err(err) => return Err(err.into()),
		};
		while let Some(entry) = dir.next_entry().await? {
			if entry.file_type().await?.is_dir() {
				out.push(entry.file_name().to_string_lossy().into_owned());
			}
		}
		out.sort();
		Ok(out)
	}

	/// All canonical relpaths of a device, across all dates.
	pub async fn list_assets(&self, device: &str) -> anyhow::Result<Vec<String>> {
		let mut out = Vec::new();
		for date in self.list_dates(device).await? {
			let mut dir = fs::read_dir(self.assets_root.join(device).join(&date)).await?;
			while let Some(entry) = dir.next_entry().await? {
				if entry.file_type().await?.is_file() {
					let name = entry.file_name().to_string_lossy().into_owned();
					out.push(format!("{date}/{name}"));
				}
			}
		}
		out.sort();
		Ok(out)
	}
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
	let parent = path
		.parent()
		.with_context(|| format!("no parent dir for {}", path.display()))?;
	fs::create_dir_all(parent).await?;
	let tmp = path.with_extension("part");
	fs::write(&tmp, bytes)
		.await
		.with_context(|| format!("cannot write {}", tmp.display()))?;
	fs::rename(&tmp, path)
		.await
		.with_context(|| format!("cannot rename {} into place", tmp.display()))?;
	Ok(())
}
