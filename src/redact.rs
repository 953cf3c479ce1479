use image::DynamicImage;
use image::GrayImage;
use image::RgbImage;

/// Prompt set for the promptable segmenter; everything it returns is
/// mosaicked out of the thumbnail.
pub const PRIVATE_LABELS: &[&str] = &[
	"face",
	"face with glasses or masks",
	"screen content (e.g. computer screen, phone screen, tablet screen)",
	"private document (e.g. bank statement, tax document, medical record, passport, visa, id card)",
	"home address (e.g. on a letter, package, or document)",
	"license plate",
	"signature",
	"cards (e.g. credit card, id card, bank card)",
];

pub const THUMBNAIL_MAX_SIDE: u32 = 1080;
/// Mosaic tile radius as a fraction of the image diagonal.
const MOSAIC_SCALE: f32 = 0.0075;
/// Face ovals are grown by this fraction per side before masking.
const FACE_BOX_EXPAND: f32 = 0.1;

/// Binary redaction mask over an image.
#[derive(Debug, Clone)]
pub struct Mask {
	width: u32,
	height: u32,
	bits: Vec<bool>,
}

impl Mask {
	pub fn new(width: u32, height: u32) -> Mask {
		Mask {
			width,
			height,
			bits: vec![false; (width * height) as usize],
		}
	}

	pub fn get(&self, x: u32, y: u32) -> bool {
		self.bits[(y * self.width + x) as usize]
	}

	fn set(&mut self, x: u32, y: u32, v: bool) {
		self.bits[(y * self.width + x) as usize] = v;
	}

	pub fn any(&self) -> bool {
		self.bits.iter().any(|b| *b)
	}

	/// Union in an axis-aligned oval over the bbox, expanded by
	/// `FACE_BOX_EXPAND` per side.
	pub fn or_oval(&mut self, bbox: [i32; 4]) {
		let [x1, y1, x2, y2] = bbox;
		let bw = (x2 - x1) as f32;
		let bh = (y2 - y1) as f32;
		if bw <= 0.0 || bh <= 0.0 {
			return;
		}
		let x1 = (x1 as f32 - bw * FACE_BOX_EXPAND).max(0.0);
		let y1 = (y1 as f32 - bh * FACE_BOX_EXPAND).max(0.0);
		let x2 = (x2 as f32 + bw * FACE_BOX_EXPAND).min(self.width as f32);
		let y2 = (y2 as f32 + bh * FACE_BOX_EXPAND).min(self.height as f32);
		let cx = (x1 + x2) / 2.0;
		let cy = (y1 + y2) / 2.0;
		let rx = (x2 - x1) / 2.0;
		let ry = (y2 - y1) / 2.0;
		if rx <= 0.0 || ry <= 0.0 {
			return;
		}
		for y in y1 as u32..(y2 as u32).min(self.height) {
			for x in x1 as u32..(x2 as u32).min(self.width) {
				let dx = (x as f32 + 0.5 - cx) / rx;
				let dy = (y as f32 + 0.5 - cy) / ry;
				if dx * dx + dy * dy <= 1.0 {
					self.set(x, y, true);
				}
			}
		}
	}

	/// Union in a grayscale mask (anything > 127 counts as masked).
	pub fn or_gray(&mut self, gray: &GrayImage) {
		let w = self.width.min(gray.width());
		let h = self.height.min(gray.height());
		for y in 0..h {
			for x in 0..w {
				if gray.get_pixel(x, y).0[0] > 127 {
					self.set(x, y, true);
				}
			}
		}
	}

	/// Clear a rectangle (whitelisted face region).
	pub fn clear_rect(&mut self, bbox: [i32; 4]) {
		let [x1, y1, x2, y2] = bbox;
		let x1 = x1.max(0) as u32;
		let y1 = y1.max(0) as u32;
		let x2 = (x2.max(0) as u32).min(self.width);
		let y2 = (y2.max(0) as u32).min(self.height);
		for y in y1..y2 {
			for x in x1..x2 {
				self.set(x, y, false);
			}
		}
	}
}

/// Build the full redaction mask: ovals over all non-whitelisted face
/// boxes, union with the segmenter mask, minus the whitelisted boxes.
pub fn build_mask(
	width: u32,
	height: u32,
	face_boxes: &[[i32; 4]],
	whitelist_boxes: &[[i32; 4]],
	segmenter_mask: Option<&GrayImage>,
) -> Mask {
	let mut mask = Mask::new(width, height);
	for bbox in face_boxes {
		mask.or_oval(*bbox);
	}
	if let Some(gray) = segmenter_mask {
		mask.or_gray(gray);
	}
	for bbox in whitelist_boxes {
		mask.clear_rect(*bbox);
	}
	mask
}

/// Replace masked pixels with a hexagonal tile mosaic. Tile radius scales
/// with the image diagonal; each tile takes the colour of the pixel at its
/// centre.
pub fn apply_hex_mosaic(img: &mut RgbImage, mask: &Mask) {
	let (w, h) = (img.width(), img.height());
	let diagonal = ((w * w + h * h) as f32).sqrt();
	let size = (diagonal * MOSAIC_SCALE).max(4.0);
	let v_step = size * 1.5;
	let h_step = size * 3.0f32.sqrt();

	let source = img.clone();
	let center_color = |row: i32, col: i32| -> image::Rgb<u8> {
		let offset = if row.rem_euclid(2) == 1 { h_step / 2.0 } else { 0.0 };
		let cx = (col as f32 * h_step + offset).clamp(0.0, (w - 1) as f32) as u32;
		let cy = (row as f32 * v_step).clamp(0.0, (h - 1) as f32) as u32;
		*source.get_pixel(cx, cy)
	};

	for y in 0..h {
		for x in 0..w {
			if !mask.get(x, y) {
				continue;
			}
			// Nearest hex centre among the three candidate rows.
			let fy = y as f32;
			let fx = x as f32;
			let row0 = (fy / v_step).round() as i32;
			let mut best: Option<(f32, i32, i32)> = None;
			for row in [row0 - 1, row0, row0 + 1] {
				let offset = if row.rem_euclid(2) == 1 { h_step / 2.0 } else { 0.0 };
				let col = ((fx - offset) / h_step).round() as i32;
				let cx = col as f32 * h_step + offset;
				let cy = row as f32 * v_step;
				let d = (fx - cx) * (fx - cx) + (fy - cy) * (fy - cy);
				if best.map(|(bd, _, _)| d < bd).unwrap_or(true) {
					best = Some((d, row, col));
				}
			}
			let (_, row, col) = best.unwrap();
			img.put_pixel(x, y, center_color(row, col));
		}
	}
}

/// Resize to the thumbnail bound and encode as WebP.
pub fn encode_thumbnail(img: &DynamicImage) -> anyhow::Result<Vec<u8>> {
	let resized = if img.width() > THUMBNAIL_MAX_SIDE || img.height() > THUMBNAIL_MAX_SIDE {
		img.thumbnail(THUMBNAIL_MAX_SIDE, THUMBNAIL_MAX_SIDE)
	} else {
		img.clone()
	};
	let rgb = resized.to_rgb8();
	let mut out = Vec::new();
	let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut out);
	encoder.encode(
		rgb.as_raw(),
		rgb.width(),
		rgb.height(),
		image::ExtendedColorType::Rgb8,
	)?;
	Ok(out)
}

/// Full redaction path for one source image: decode, mask, mosaic, encode.
pub fn redacted_thumbnail(
	source: &[u8],
	face_boxes: &[[i32; 4]],
	whitelist_boxes: &[[i32; 4]],
	segmenter_mask: Option<&GrayImage>,
) -> anyhow::Result<Vec<u8>> {
	let img = image::load_from_memory(source)?;
	let mut rgb = img.to_rgb8();
	let mask = build_mask(
		rgb.width(),
		rgb.height(),
		face_boxes,
		whitelist_boxes,
		segmenter_mask,
	);
	if mask.any() {
		apply_hex_mosaic(&mut rgb, &mask);
	}
	encode_thumbnail(&DynamicImage::ImageRgb8(rgb))
}
