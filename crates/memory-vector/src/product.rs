//! Product quantization codebooks.
//!
//! A vector is split into `subspaces` equal sub-vectors and each sub-vector
//! is replaced by the index of its nearest centroid. Codebooks are trained
//! with k-means (k-means++ seeding) over the vectors present at rebuild time.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::distance::l2_squared;

/// Centroids per subspace; codes are one byte.
pub const MAX_CENTROIDS: usize = 256;

const MAX_ITERS: usize = 25;
const TOLERANCE: f32 = 1e-4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCodebook {
    pub dimensions: usize,
    pub subspaces: usize,
    /// Centroids actually trained per subspace, at most [`MAX_CENTROIDS`].
    pub centroids: usize,
    /// `[subspace][centroid][sub_dim]`, flattened.
    pub codebook: Vec<f32>,
}

impl ProductCodebook {
    pub fn sub_dim(&self) -> usize {
        self.dimensions / self.subspaces
    }

    #[inline]
    pub fn centroid(&self, subspace: usize, code: u8) -> &[f32] {
        let sub_dim = self.sub_dim();
        let offset = (subspace * self.centroids + code as usize) * sub_dim;
        &self.codebook[offset..offset + sub_dim]
    }

    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let sub_dim = self.sub_dim();
        (0..self.subspaces)
            .map(|s| {
                let sub = &vector[s * sub_dim..(s + 1) * sub_dim];
                let mut best = 0u8;
                let mut best_dist = f32::MAX;
                for c in 0..self.centroids {
                    let d = l2_squared(sub, self.centroid(s, c as u8));
                    if d < best_dist {
                        best_dist = d;
                        best = c as u8;
                    }
                }
                best
            })
            .collect()
    }

    /// Approximate reconstruction from codes.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimensions);
        for (s, &code) in codes.iter().enumerate() {
            out.extend_from_slice(self.centroid(s, code));
        }
        out
    }

    /// Train one codebook per subspace. Returns `None` when there is nothing
    /// to train on or the dimensions do not split evenly.
    pub fn train(vectors: &[Vec<f32>], dimensions: usize, subspaces: usize, seed: u64) -> Option<Self> {
        if vectors.is_empty() || subspaces == 0 || dimensions % subspaces != 0 {
            return None;
        }
        let sub_dim = dimensions / subspaces;
        let centroids = vectors.len().min(MAX_CENTROIDS);
        let mut codebook = Vec::with_capacity(subspaces * centroids * sub_dim);

        for s in 0..subspaces {
            let data: Vec<&[f32]> = vectors
                .iter()
                .map(|v| &v[s * sub_dim..(s + 1) * sub_dim])
                .collect();
            let trained = kmeans(&data, sub_dim, centroids, seed.wrapping_add(s as u64));
            codebook.extend_from_slice(&trained);
        }

        Some(Self {
            dimensions,
            subspaces,
            centroids,
            codebook,
        })
    }
}

/// k-means++ seeding: each next centroid is sampled with probability
/// proportional to its squared distance from the nearest chosen one.
fn kmeans_plus_plus(data: &[&[f32]], dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = data.len();
    let mut centroids = vec![0.0f32; k * dim];
    centroids[..dim].copy_from_slice(data[rng.random_range(0..n)]);

    let mut min_dists = vec![f32::MAX; n];
    for c in 1..k {
        let last = &centroids[(c - 1) * dim..c * dim];
        for (i, point) in data.iter().enumerate() {
            let d = l2_squared(point, last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
        }

        let total: f64 = min_dists.iter().map(|&d| d as f64).sum();
        let chosen = if total <= 0.0 {
            rng.random_range(0..n)
        } else {
            let threshold = rng.random::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut chosen = n - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids[c * dim..(c + 1) * dim].copy_from_slice(data[chosen]);
    }
    centroids
}

/// Lloyd iterations until the largest centroid move drops under tolerance.
fn kmeans(data: &[&[f32]], dim: usize, k: usize, seed: u64) -> Vec<f32> {
    let n = data.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = kmeans_plus_plus(data, dim, k, &mut rng);
    let mut next = vec![0.0f32; k * dim];
    let mut counts = vec![0usize; k];
    let mut assignments = vec![0usize; n];

    for iter in 0..MAX_ITERS {
        for (i, point) in data.iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f32::MAX;
            for c in 0..k {
                let d = l2_squared(point, &centroids[c * dim..(c + 1) * dim]);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            assignments[i] = best;
        }

        next.fill(0.0);
        counts.fill(0);
        for (i, point) in data.iter().enumerate() {
            let c = assignments[i];
            counts[c] += 1;
            for (acc, x) in next[c * dim..(c + 1) * dim].iter_mut().zip(point.iter()) {
                *acc += x;
            }
        }
        for c in 0..k {
            let slot = &mut next[c * dim..(c + 1) * dim];
            if counts[c] > 0 {
                let count = counts[c] as f32;
                slot.iter_mut().for_each(|x| *x /= count);
            } else {
                // Dead centroid: reseed from a random point.
                slot.copy_from_slice(data[rng.random_range(0..n)]);
            }
        }

        let max_move = (0..k)
            .map(|c| l2_squared(&centroids[c * dim..(c + 1) * dim], &next[c * dim..(c + 1) * dim]))
            .fold(0.0f32, f32::max);
        std::mem::swap(&mut centroids, &mut next);

        if max_move < TOLERANCE * TOLERANCE {
            tracing::debug!(iterations = iter + 1, "k-means converged");
            break;
        }
    }
    centroids
}
