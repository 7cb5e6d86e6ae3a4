//! Vector math shared by the index and the quantizers.

use hybridmem_protocols::DistanceMetric;

/// Norms within this distance of 1.0 are treated as already normalized.
pub const NORM_EPSILON: f32 = 1e-6;

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// L2-normalize in place. Returns `false` for a zero vector, which cannot be
/// normalized. Unit vectors are left untouched.
pub fn normalize(v: &mut [f32]) -> bool {
    let n = norm(v);
    if n == 0.0 || !n.is_finite() {
        return false;
    }
    if (n - 1.0).abs() <= NORM_EPSILON {
        return true;
    }
    for x in v.iter_mut() {
        *x /= n;
    }
    true
}

/// Convert a squared Euclidean distance into a similarity in `(0, 1]`.
#[inline]
pub fn euclidean_similarity(l2_sq: f32) -> f32 {
    1.0 / (1.0 + l2_sq.max(0.0).sqrt())
}

/// Similarity between two full-precision vectors; higher is closer.
///
/// Cosine assumes both sides were normalized on the way in.
#[inline]
pub fn similarity(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::Dot => dot(a, b),
        DistanceMetric::Euclidean => euclidean_similarity(l2_squared(a, b)),
    }
}
