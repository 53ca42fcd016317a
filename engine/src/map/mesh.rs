//! Triangulation of resource masks
//!
//! The mask is ear-clipped and every ear is then split into `k * k` smaller
//! triangles on a regular barycentric lattice. `k` is shared by all ears so
//! that an edge shared by two ears is split at the same points on both sides.

use std::collections::HashMap;

use crate::geometry::{orient2d, point_in_triangle, signed_area2, Bbox, Point};

/// Upper bound on the number of triangles in a mesh.
pub const MAX_MESH_TRIANGLES: usize = 8192;

/// Triangle mesh in resource space.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub points: Vec<Point>,
    /// Counter-clockwise (in a y-up frame) vertex indices
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    pub fn triangle(&self, index: usize) -> [Point; 3] {
        let [a, b, c] = self.triangles[index];
        [
            self.points[a as usize],
            self.points[b as usize],
            self.points[c as usize],
        ]
    }

    pub fn len(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }
}

/// Triangulate `mask` so that no triangle edge is much longer than
/// `max(mask width, mask height) / density`.
///
/// Returns `None` if the mask has no area.
pub fn triangulate_mask(mask: &[Point], density: u32) -> Option<Mesh> {
    let ring = clean_ring(mask);
    if ring.len() < 3 {
        return None;
    }
    let area2 = signed_area2(&ring);
    if area2.abs() < 1e-9 {
        return None;
    }
    let ring: Vec<Point> = if area2 < 0.0 {
        ring.into_iter().rev().collect()
    } else {
        ring
    };

    let ears = ear_clip(&ring);
    if ears.is_empty() {
        return None;
    }

    let bbox = Bbox::from_points(&ring)?;
    let spacing = bbox.width().max(bbox.height()) / density.max(1) as f64;
    let longest = ears
        .iter()
        .flat_map(|[a, b, c]| {
            [
                ring[*a].distance(&ring[*b]),
                ring[*b].distance(&ring[*c]),
                ring[*c].distance(&ring[*a]),
            ]
        })
        .fold(0.0_f64, f64::max);
    let k_max = ((MAX_MESH_TRIANGLES / ears.len()) as f64).sqrt().floor().max(1.0) as u32;
    let k = ((longest / spacing).ceil() as u32).clamp(1, k_max);

    Some(subdivide(&ring, &ears, k))
}

/// Drop repeated and closing points.
fn clean_ring(mask: &[Point]) -> Vec<Point> {
    let mut ring: Vec<Point> = Vec::with_capacity(mask.len());
    for p in mask {
        if !p.is_finite() {
            continue;
        }
        if ring.last() != Some(p) {
            ring.push(*p);
        }
    }
    while ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    ring
}

/// Ear clipping of a counter-clockwise ring. Returns index triples into `ring`.
fn ear_clip(ring: &[Point]) -> Vec<[usize; 3]> {
    let mut remaining: Vec<usize> = (0..ring.len()).collect();
    let mut ears = Vec::with_capacity(ring.len().saturating_sub(2));

    while remaining.len() > 3 {
        let n = remaining.len();
        let ear = (0..n).find(|&i| {
            let (a, b, c) = (
                remaining[(i + n - 1) % n],
                remaining[i],
                remaining[(i + 1) % n],
            );
            is_ear(ring, &remaining, a, b, c)
        });

        // Without a proper ear the ring is self-touching or degenerate; cut
        // the flattest corner to make progress.
        let i = ear.unwrap_or_else(|| flattest_corner(ring, &remaining));
        let (a, b, c) = (
            remaining[(i + n - 1) % n],
            remaining[i],
            remaining[(i + 1) % n],
        );
        if orient2d(ring[a], ring[b], ring[c]) > 0.0 {
            ears.push([a, b, c]);
        }
        remaining.remove(i);
    }

    let (a, b, c) = (remaining[0], remaining[1], remaining[2]);
    if orient2d(ring[a], ring[b], ring[c]) > 0.0 {
        ears.push([a, b, c]);
    }
    ears
}

fn is_ear(ring: &[Point], remaining: &[usize], a: usize, b: usize, c: usize) -> bool {
    let (pa, pb, pc) = (ring[a], ring[b], ring[c]);
    if orient2d(pa, pb, pc) <= 0.0 {
        return false;
    }
    remaining.iter().all(|&other| {
        if other == a || other == b || other == c {
            return true;
        }
        let p = ring[other];
        if p == pa || p == pb || p == pc {
            return true;
        }
        !point_in_triangle(p, pa, pb, pc)
    })
}

fn flattest_corner(ring: &[Point], remaining: &[usize]) -> usize {
    let n = remaining.len();
    (0..n)
        .min_by(|&i, &j| {
            let corner = |k: usize| {
                orient2d(
                    ring[remaining[(k + n - 1) % n]],
                    ring[remaining[k]],
                    ring[remaining[(k + 1) % n]],
                )
                .abs()
            };
            corner(i).total_cmp(&corner(j))
        })
        .unwrap_or(0)
}

/// Split every ear on a lattice with `k` steps per edge.
fn subdivide(ring: &[Point], ears: &[[usize; 3]], k: u32) -> Mesh {
    let mut mesh = Mesh::default();
    let mut index: HashMap<(u64, u64), u32> = HashMap::new();

    for ear in ears {
        // lattice[i][j] for i + j <= k
        let mut lattice: Vec<Vec<u32>> = Vec::with_capacity(k as usize + 1);
        for i in 0..=k {
            let mut row = Vec::with_capacity((k - i) as usize + 1);
            for j in 0..=(k - i) {
                let p = lattice_point(ring, ear, [k - i - j, i, j], k);
                let key = (p.x.to_bits(), p.y.to_bits());
                let id = *index.entry(key).or_insert_with(|| {
                    mesh.points.push(p);
                    (mesh.points.len() - 1) as u32
                });
                row.push(id);
            }
            lattice.push(row);
        }

        for i in 0..k as usize {
            for j in 0..(k as usize - i) {
                mesh.triangles
                    .push([lattice[i][j], lattice[i + 1][j], lattice[i][j + 1]]);
                if i + j + 1 < k as usize {
                    mesh.triangles.push([
                        lattice[i + 1][j],
                        lattice[i + 1][j + 1],
                        lattice[i][j + 1],
                    ]);
                }
            }
        }
    }

    mesh
}

/// Lattice point with integer barycentric `weights` (summing to `k`).
///
/// Points on an edge are interpolated from the lower ring index to the higher
/// one, so both ears sharing that edge produce bit-identical coordinates.
fn lattice_point(ring: &[Point], ear: &[usize; 3], weights: [u32; 3], k: u32) -> Point {
    let nonzero: Vec<usize> = (0..3).filter(|&v| weights[v] > 0).collect();
    match nonzero.as_slice() {
        [v] => ring[ear[*v]],
        [u, v] => {
            let (lo, hi) = if ear[*u] < ear[*v] { (*u, *v) } else { (*v, *u) };
            let t = weights[hi] as f64 / k as f64;
            let (p, q) = (ring[ear[lo]], ring[ear[hi]]);
            p + (q - p) * t
        }
        _ => {
            let kf = k as f64;
            let (pa, pb, pc) = (ring[ear[0]], ring[ear[1]], ring[ear[2]]);
            pa * (weights[0] as f64 / kf) + pb * (weights[1] as f64 / kf) + pc * (weights[2] as f64 / kf)
        }
    }
}
