use anyhow::anyhow;
use rand::Rng;
use rand_distr::StandardNormal;

/// Per-device orthonormal map applied to embeddings before they are stored
/// and to query vectors before search. It keeps in-device cosine geometry
/// intact while making vectors unintelligible across devices.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
	dim: usize,
	/// Row-major `dim * dim`.
	m: Vec<f32>,
}

impl Transform {
	/// Sample a Haar-uniform orthonormal matrix: fill with standard normals,
	/// orthonormalize the columns with modified Gram-Schmidt, then fix the
	/// sign of each column so the distribution is uniform over O(dim).
	pub fn random(dim: usize) -> Transform {
		let mut rng = rand::rng();
		loop {
			let mut cols: Vec<Vec<f64>> = (0..dim)
				.map(|_| (0..dim).map(|_| rng.sample::<f64, _>(StandardNormal)).collect())
				.collect();
			if let Some(m) = orthonormalize(&mut cols) {
				return Transform { dim, m };
			}
			// Degenerate draw (numerically dependent columns); extremely
			// unlikely, just resample.
		}
	}

	pub fn apply(&self, v: &[f32]) -> Vec<f32> {
		debug_assert_eq!(v.len(), self.dim);
		let mut out = vec![0.0f32; self.dim];
		for (i, row) in self.m.chunks(self.dim).enumerate() {
			let mut acc = 0.0f32;
			for (a, b) in row.iter().zip(v) {
				acc += a * b;
			}
			out[i] = acc;
		}
		out
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(4 + self.m.len() * 4);
		buf.extend_from_slice(&(self.dim as u32).to_le_bytes());
		for v in &self.m {
			buf.extend_from_slice(&v.to_le_bytes());
		}
		buf
	}

	pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Transform> {
		if buf.len() < 4 {
			return Err(anyhow!("transform blob too short"));
		}
		let dim = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
		let expected = 4 + dim * dim * 4;
		if buf.len() != expected {
			return Err(anyhow!(
				"transform blob has {} bytes, expected {}",
				buf.len(),
				expected
			));
		}
		let m = buf[4..]
			.chunks_exact(4)
			.map(|c| f32::from_le_bytes(c.try_into().unwrap()))
			.collect();
		Ok(Transform { dim, m })
	}
}

/// Modified Gram-Schmidt over the given columns. Returns the row-major f32
/// matrix whose columns are the orthonormal basis, or None on degeneracy.
fn orthonormalize(cols: &mut [Vec<f64>]) -> Option<Vec<f32>> {
	let dim = cols.len();
	for i in 0..dim {
		let (done, rest) = cols.split_at_mut(i);
		let current = &mut rest[0];
		for prev in done.iter() {
			let dot: f64 = current.iter().zip(prev).map(|(a, b)| a * b).sum();
			for k in 0..dim {
				current[k] -= dot * prev[k];
			}
		}
		let norm: f64 = current.iter().map(|x| x * x).sum::<f64>().sqrt();
		if norm < 1e-10 {
			return None;
		}
		// Sign correction equivalent to taking Q from QR with positive
		// diagonal of R.
		let sign = if current[i] < 0.0 { -1.0 } else { 1.0 };
		for v in current.iter_mut() {
			*v = *v / norm * sign;
		}
	}
	let mut m = vec![0.0f32; dim * dim];
	for (c, col) in cols.iter().enumerate() {
		for (r, v) in col.iter().enumerate() {
			m[r * dim + c] = *v as f32;
		}
	}
	Some(m)
}

pub fn l2_normalize(v: &mut [f32]) {
	let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
	if norm > 0.0 {
		for x in v.iter_mut() {
			*x /= norm;
		}
	}
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
	a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
	a.iter()
		.zip(b)
		.map(|(x, y)| (x - y) * (x - y))
		.sum::<f32>()
		.sqrt()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn random_transform_is_orthonormal() {
		let t = Transform::random(16);
		// Rows must be unit length and pairwise orthogonal.
		for i in 0..16 {
			let ri = &t.m[i * 16..(i + 1) * 16];
			for j in 0..16 {
				let rj = &t.m[j * 16..(j + 1) * 16];
				let d = dot(ri, rj);
				if i == j {
					assert!((d - 1.0).abs() < 1e-4, "row {i} norm {d}");
				} else {
					assert!(d.abs() < 1e-4, "rows {i},{j} dot {d}");
				}
			}
		}
	}

	#[test]
	fn transform_preserves_cosine() {
		let t = Transform::random(8);
		let mut a = vec![0.3, -1.0, 0.5, 2.0, 0.0, 0.7, -0.2, 1.1];
		let mut b = vec![1.0, 0.1, -0.4, 0.0, 0.9, -1.3, 0.6, 0.2];
		l2_normalize(&mut a);
		l2_normalize(&mut b);
		let before = dot(&a, &b);
		let ta = t.apply(&a);
		let tb = t.apply(&b);
		let after = dot(&ta, &tb);
		assert!((before - after).abs() < 1e-4);
	}

	#[test]
	fn bytes_round_trip() {
		let t = Transform::random(4);
		let decoded = Transform::from_bytes(&t.to_bytes()).unwrap();
		assert_eq!(t, decoded);
	}

	#[test]
	fn from_bytes_rejects_truncated() {
		let t = Transform::random(4);
		let bytes = t.to_bytes();
		assert!(Transform::from_bytes(&bytes[..bytes.len() - 1]).is_err());
	}

	#[test]
	fn normalize_handles_zero() {
		let mut v = vec![0.0f32; 4];
		l2_normalize(&mut v);
		assert_eq!(v, vec![0.0f32; 4]);
	}
}
