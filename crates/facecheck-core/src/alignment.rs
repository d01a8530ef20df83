//! Face alignment for descriptor extraction.
//!
//! Warps a detected face into a canonical 112×112 RGB crop. With landmarks,
//! a 4-DOF similarity transform maps the five points onto the reference
//! layout; without them, the bounding box is resampled directly.

use crate::codec::PixelGrid;
use crate::types::Region;

/// Reference landmark layout for a 112×112 crop.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit of `src` onto `dst`.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        // Each point pair contributes two rows to A·[a b tx ty]ᵀ = B:
        //   [sx, -sy, 1, 0] → dx
        //   [sy,  sx, 0, 1] → dy
        let mut normal = [[0.0f32; 5]; 4];
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
            for (row, rhs) in rows {
                for j in 0..4 {
                    for k in 0..4 {
                        normal[j][k] += row[j] * row[k];
                    }
                    normal[j][4] += row[j] * rhs;
                }
            }
        }

        match solve_normal_equations(normal) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 },
        }
    }

    /// Map a destination point back into source coordinates.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let dx = x - self.tx;
        let dy = y - self.ty;
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Gaussian elimination with partial pivoting on a 4×5 augmented matrix.
#[allow(clippy::needless_range_loop)]
fn solve_normal_equations(mut m: [[f32; 5]; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear RGB sample; out-of-bounds neighbours read as black.
fn sample_rgb(grid: &PixelGrid, sx: f32, sy: f32) -> [u8; 3] {
    let (w, h) = (grid.width() as i32, grid.height() as i32);
    let x0 = sx.floor() as i32;
    let y0 = sy.floor() as i32;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let at = |x: i32, y: i32| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = grid.pixel(x as usize, y as usize);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr, bl, br) = (at(x0, y0), at(x0 + 1, y0), at(x0, y0 + 1), at(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    out
}

fn render(size: usize, mut source_of: impl FnMut(f32, f32) -> Option<[u8; 3]>) -> Vec<u8> {
    let mut out = vec![0u8; size * size * 3];
    for oy in 0..size {
        for ox in 0..size {
            if let Some(px) = source_of(ox as f32, oy as f32) {
                let i = (oy * size + ox) * 3;
                out[i..i + 3].copy_from_slice(&px);
            }
        }
    }
    out
}

/// Align a face with landmarks into a 112×112 RGB crop (packed, 3 bytes/pixel).
pub fn align_face(grid: &PixelGrid, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let transform = Similarity::fit(landmarks, &REFERENCE_LANDMARKS);
    render(ALIGNED_SIZE, |x, y| {
        transform
            .invert_point(x, y)
            .map(|(sx, sy)| sample_rgb(grid, sx, sy))
    })
}

/// Resample a region's bounding box into a 112×112 RGB crop.
pub fn crop_region(grid: &PixelGrid, region: &Region) -> Vec<u8> {
    let sx = region.width / ALIGNED_SIZE as f32;
    let sy = region.height / ALIGNED_SIZE as f32;
    render(ALIGNED_SIZE, |x, y| {
        Some(sample_rgb(
            grid,
            region.x + (x + 0.5) * sx - 0.5,
            region.y + (y + 0.5) * sy - 0.5,
        ))
    })
}

/// Canonical crop for a region: landmark alignment when available.
pub fn face_crop(grid: &PixelGrid, region: &Region) -> Vec<u8> {
    match &region.landmarks {
        Some(landmarks) => align_face(grid, landmarks),
        None => crop_region(grid, region),
    }
}
