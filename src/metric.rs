//! Distance functions between histograms and the named metric registry.
//!
//! A metric maps two histograms to a score ≥ 0 where smaller means more
//! similar; it need not be a metric in the mathematical sense. Callers
//! guarantee that both histograms share the same `k` (and therefore length),
//! the functions here do not re-check it.

use std::{
    collections::BTreeMap,
    sync::OnceLock,
};

use parking_lot::RwLock;

use crate::histogram::Histogram;

/// A distance function between two histograms of the same `k`.
pub type HistogramMetric = fn(&Histogram, &Histogram) -> f64;

/// Σ |pᵢ − qᵢ|
pub fn manhattan(a: &Histogram, b: &Histogram) -> f64 {
    a.entries
        .iter()
        .zip(&b.entries)
        .map(|(p, q)| (p - q).abs())
        .sum()
}

/// √Σ (pᵢ − qᵢ)²
pub fn euclid(a: &Histogram, b: &Histogram) -> f64 {
    a.entries
        .iter()
        .zip(&b.entries)
        .map(|(p, q)| (p - q) * (p - q))
        .sum::<f64>()
        .sqrt()
}

/// The complement of histogram intersection: 1 − Σ min(pᵢ, qᵢ).
pub fn min(a: &Histogram, b: &Histogram) -> f64 {
    1.0 - a
        .entries
        .iter()
        .zip(&b.entries)
        .map(|(p, q)| p.min(*q))
        .sum::<f64>()
}

/// Cosine distance 1 − (p·q)/(‖p‖·‖q‖).
///
/// If either vector has norm zero the angle is undefined; the constant 2.1
/// is returned, a value strictly greater than the natural range of 0–2 so a
/// zero histogram loses against every well-defined candidate.
pub fn cosine(a: &Histogram, b: &Histogram) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (p, q) in a.entries.iter().zip(&b.entries) {
        dot += p * q;
        norm_a += p * p;
        norm_b += q * q;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.1;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// maxᵢ |pᵢ − qᵢ|
pub fn chessboard(a: &Histogram, b: &Histogram) -> f64 {
    a.entries
        .iter()
        .zip(&b.entries)
        .map(|(p, q)| (p - q).abs())
        .fold(0.0, f64::max)
}

/// Σ |pᵢ − qᵢ| / (|pᵢ| + |qᵢ|), where a 0/0 term contributes 0.
pub fn canberra(a: &Histogram, b: &Histogram) -> f64 {
    a.entries
        .iter()
        .zip(&b.entries)
        .map(|(p, q)| {
            let denom = p.abs() + q.abs();
            if denom == 0.0 {
                0.0
            } else {
                (p - q).abs() / denom
            }
        })
        .sum()
}

static REGISTRY: OnceLock<RwLock<BTreeMap<String, HistogramMetric>>> = OnceLock::new();

fn registry() -> &'static RwLock<BTreeMap<String, HistogramMetric>> {
    REGISTRY.get_or_init(|| {
        let mut map: BTreeMap<String, HistogramMetric> = BTreeMap::new();
        map.insert("manhattan".to_string(), manhattan);
        map.insert("euclid".to_string(), euclid);
        map.insert("euclidean".to_string(), euclid);
        map.insert("min".to_string(), min);
        map.insert("cosine".to_string(), cosine);
        map.insert("chessboard".to_string(), chessboard);
        map.insert("canberra".to_string(), canberra);
        RwLock::new(map)
    })
}

/// Looks up a metric by name. Names are case-insensitive.
pub fn get_metric(name: &str) -> Option<HistogramMetric> {
    registry().read().get(&name.to_lowercase()).copied()
}

/// Registers a metric under `name` if that name is still free and returns
/// whether the metric was inserted. Registering an existing name is a no-op.
pub fn register_metric(name: &str, metric: HistogramMetric) -> bool {
    let mut map = registry().write();
    let key = name.to_lowercase();
    if map.contains_key(&key) {
        return false;
    }
    map.insert(key, metric);
    true
}

/// The sorted list of all registered metric names.
pub fn metric_names() -> Vec<String> {
    registry().read().keys().cloned().collect()
}
