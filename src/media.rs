use std::path::Path;
use std::process::Command;

use anyhow::anyhow;
use anyhow::Context as _;

/// Wrap a raw H264 elementary stream into an MP4 container, tagging the
/// 90° rotation the POV cameras capture with. Stream copy, no re-encode.
pub fn transcode_h264_to_mp4(source: &Path, target: &Path) -> anyhow::Result<()> {
	if let Some(parent) = target.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let status = Command::new("ffmpeg")
		.args(["-y", "-framerate", "30", "-i"])
		.arg(source)
		.args(["-c", "copy", "-metadata:s:v", "rotate=90"])
		.arg(target)
		.output()
		.context("cannot run ffmpeg")?;
	if !status.status.success() {
		return Err(anyhow!(
			"ffmpeg transcode failed: {}",
			String::from_utf8_lossy(&status.stderr)
		));
	}
	Ok(())
}

/// Transcode raw H264 bytes to MP4 bytes through temp files. Used at
/// landing time so only containerized video ever reaches the store.
pub fn transcode_h264_bytes(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
	let tmp = std::env::temp_dir();
	let stamp = uuid::Uuid::new_v4();
	let source = tmp.join(format!("{stamp}.h264"));
	let target = tmp.join(format!("{stamp}.mp4"));
	std::fs::write(&source, bytes)?;
	let result = transcode_h264_to_mp4(&source, &target).and_then(|_| Ok(std::fs::read(&target)?));
	let _ = std::fs::remove_file(&source);
	let _ = std::fs::remove_file(&target);
	result
}

/// Extract the first frame of a video as a JPEG; this frame stands in for
/// the video in detection, redaction and embedding.
pub async fn extract_keyframe(source: &Path, target: &Path) -> anyhow::Result<()> {
	if let Some(parent) = target.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	let output = tokio::process::Command::new("ffmpeg")
		.args(["-y", "-i"])
		.arg(source)
		.args(["-frames:v", "1", "-q:v", "2"])
		.arg(target)
		.output()
		.await
		.context("cannot run ffmpeg")?;
	if !output.status.success() {
		return Err(anyhow!(
			"ffmpeg keyframe extraction failed: {}",
			String::from_utf8_lossy(&output.stderr)
		));
	}
	Ok(())
}


#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	#[test]
	fn transcode_rejects_garbage() {
		let dir = tempdir().unwrap();
		let source = dir.path().join("bad.h264");
		std::fs::write(&source, b"not an elementary stream").unwrap();
		let target = dir.path().join("bad.mp4");
		// Fails the same way whether ffmpeg chokes on the input or is not
		// installed at all.
		assert!(transcode_h264_to_mp4(&source, &target).is_err());
	}

	#[test]
	fn transcode_bytes_rejects_garbage() {
		assert!(transcode_h264_bytes(b"garbage").is_err());
	}

	#[test]
	fn h264_round_trip_lands_playable_mp4() {
		let dir = tempdir().unwrap();
		let raw = dir.path().join("clip.h264");
		if !testing::write_test_h264(&raw) {
			eprintln!("ffmpeg with h264 support unavailable, skipping");
			return;
		}
		let mp4 = dir.path().join("clip.mp4");
		transcode_h264_to_mp4(&raw, &mp4).unwrap();
		assert!(std::fs::metadata(&mp4).unwrap().len() > 0);

		let bytes = transcode_h264_bytes(&std::fs::read(&raw).unwrap()).unwrap();
		assert!(!bytes.is_empty());
	}

	#[tokio::test]
	async fn keyframe_extraction_yields_decodable_jpeg() {
		let dir = tempdir().unwrap();
		let clip = dir.path().join("clip.mp4");
		if !testing::write_test_mp4(&clip) {
			eprintln!("ffmpeg unavailable, skipping");
			return;
		}
		let frame = dir.path().join("frames/clip.frame.jpg");
		extract_keyframe(&clip, &frame).await.unwrap();
		let img = image::open(&frame).unwrap();
		assert_eq!(img.width(), 128);
		assert_eq!(img.height(), 96);
	}

	#[tokio::test]
	async fn keyframe_extraction_fails_on_garbage() {
		let dir = tempdir().unwrap();
		let clip = dir.path().join("clip.mp4");
		std::fs::write(&clip, b"junk").unwrap();
		let frame = dir.path().join("clip.frame.jpg");
		assert!(extract_keyframe(&clip, &frame).await.is_err());
	}
}
