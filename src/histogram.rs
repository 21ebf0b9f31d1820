//! Quantized RGB color histograms.
//!
//! Every 8-bit color component is quantized to `k` sub-divisions, so a
//! histogram has `k³` entries; the entry for a quantized color `(r, g, b)`
//! lives at index `r + k·g + k²·b`. Histograms either count pixels or, once
//! normalized, carry relative frequencies.

use image::RgbaImage;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    run_queue,
    storage::{
        id_list,
        ImageStorage,
    },
    ImageId,
    Progress,
    Result,
};

/// Quantizes the color component `c` to `k` sub-divisions, that is
/// `⌊c·k/256⌋`. `k` must be in `[1, 256]`.
pub fn quantize_channel(c: u8, k: u32) -> u32 {
    c as u32 * k / 256
}

/// The unique histogram index of a color already quantized to `k`
/// sub-divisions: `r + k·g + k²·b`. The result is always `< k³`.
pub fn bin_index(r: u32, g: u32, b: u32, k: u32) -> usize {
    (r + k * g + k * k * b) as usize
}

/// A color histogram with `k` sub-divisions per RGB component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// One frequency per quantized color, indexed by [`bin_index`].
    pub entries: Vec<f64>,
    /// The number of sub-divisions, between 1 and 256.
    pub k: u32,
}

impl Histogram {
    /// Creates an all-zero histogram with `k³` entries. `k` must be in
    /// `[1, 256]`.
    pub fn new(k: u32) -> Self {
        debug_assert!((1..=256).contains(&k));
        Histogram {
            entries: vec![0.0; (k * k * k) as usize],
            k,
        }
    }

    /// Counts the colors of every pixel of `img` into this histogram.
    ///
    /// An empty image is a no-op. Accumulation is additive, so calling this
    /// repeatedly builds the histogram of several images; it must not be
    /// called concurrently on the same histogram.
    pub fn accumulate(&mut self, img: &RgbaImage) {
        for pixel in img.pixels() {
            let r = quantize_channel(pixel[0], self.k);
            let g = quantize_channel(pixel[1], self.k);
            let b = quantize_channel(pixel[2], self.k);
            self.entries[bin_index(r, g, b, self.k)] += 1.0;
        }
    }

    /// The sum of all entries.
    pub fn entry_sum(&self) -> f64 {
        self.entries.iter().sum()
    }

    /// Returns the normalized histogram, dividing every entry by `pixels`.
    ///
    /// If `pixels` is zero or negative the divisor is the entry sum instead.
    /// If the divisor still is zero (empty source image) an all-zero
    /// histogram of the same `k` is returned.
    pub fn normalize(&self, pixels: i64) -> Histogram {
        let size = if pixels > 0 {
            pixels as f64
        } else {
            self.entry_sum()
        };
        if size == 0.0 {
            return Histogram::new(self.k);
        }
        Histogram {
            entries: self.entries.iter().map(|e| e / size).collect(),
            k: self.k,
        }
    }

    /// Checks whether both histograms share the same `k` and every pair of
    /// entries differs by at most `epsilon`.
    pub fn approx_eq(&self, other: &Histogram, epsilon: f64) -> bool {
        self.k == other.k
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| (a - b).abs() <= epsilon)
    }
}

/// Creates the histogram of a single image with `k` sub-divisions.
pub fn gen_histogram(img: &RgbaImage, k: u32) -> Histogram {
    let mut res = Histogram::new(k);
    res.accumulate(img);
    res
}

/// Creates one histogram accumulated over a list of images.
///
/// The normalization divisor is the total pixel count of all listed images,
/// which keeps the result a proper frequency distribution even when the
/// parts differ in size.
pub fn gen_histogram_from_parts(k: u32, normalize: bool, parts: &[RgbaImage]) -> Histogram {
    let mut res = Histogram::new(k);
    let mut size: i64 = 0;
    for img in parts {
        if img.width() == 0 || img.height() == 0 {
            continue;
        }
        res.accumulate(img);
        size += img.width() as i64 * img.height() as i64;
    }
    if normalize {
        res = res.normalize(size);
    }
    res
}

/// Builds the histogram descriptor for every id in `ids`, loading the images
/// through `storage`.
///
/// The build runs on `routines` worker threads. The driver consumes exactly
/// one outcome per id, remembers the first error, and calls `progress` after
/// each outcome with the number of finished images; a failed image does not
/// stop the remaining jobs from draining. On any error the first one is
/// returned, otherwise the descriptor at position `i` belongs to `ids[i]`.
pub fn build_histograms(
    ids: &[ImageId],
    storage: &dyn ImageStorage,
    normalize: bool,
    k: u32,
    routines: usize,
    progress: Progress<'_>,
) -> Result<Vec<Histogram>> {
    let mut out: Vec<Option<Histogram>> = (0..ids.len()).map(|_| None).collect();
    let mut first_err = None;
    let mut done = 0usize;
    run_queue(
        ids.len(),
        routines,
        |pos| -> Result<Histogram> {
            let img = storage.load_image(ids[pos])?;
            let mut hist = gen_histogram(&img, k);
            if normalize {
                let pixels = img.width() as i64 * img.height() as i64;
                if pixels > 0 {
                    hist = hist.normalize(pixels);
                }
            }
            Ok(hist)
        },
        |pos, outcome| {
            match outcome {
                Ok(hist) => out[pos] = Some(hist),
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
            done += 1;
            if let Some(p) = progress {
                p(done);
            }
        },
    );
    match first_err {
        Some(err) => Err(err),
        None => Ok(out.into_iter().flatten().collect()),
    }
}

/// Builds histogram descriptors for every image in the storage, see
/// [`build_histograms`].
pub fn build_all_histograms(
    storage: &dyn ImageStorage,
    normalize: bool,
    k: u32,
    routines: usize,
    progress: Progress<'_>,
) -> Result<Vec<Histogram>> {
    build_histograms(&id_list(storage), storage, normalize, k, routines, progress)
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        collections::HashSet,
    };

    use image::Rgba;

    use super::*;
    use crate::storage::MemImageStorage;

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([rgb[0], rgb[1], rgb[2], 255]))
    }

    #[test]
    fn bin_index_is_in_range_and_unique() {
        for k in [1u32, 2, 3, 8, 256] {
            let mut seen = HashSet::new();
            for r in 0..k.min(4) {
                for g in 0..k.min(4) {
                    for b in 0..k.min(4) {
                        let idx = bin_index(r, g, b, k);
                        assert!(idx < (k * k * k) as usize);
                        assert!(seen.insert(idx));
                    }
                }
            }
        }
    }

    #[test]
    fn quantize_keeps_component_below_k() {
        for k in [1u32, 2, 7, 256] {
            for c in [0u8, 1, 127, 128, 254, 255] {
                assert!(quantize_channel(c, k) < k);
            }
        }
    }

    #[test]
    fn solid_image_fills_one_bin() {
        let img = solid(2, 2, [200, 30, 30]);
        let hist = gen_histogram(&img, 2);
        assert_eq!(hist.entries.len(), 8);
        // (200, 30, 30) quantizes to (1, 0, 0) for k = 2.
        assert_eq!(hist.entries[bin_index(1, 0, 0, 2)], 4.0);
        assert_eq!(hist.entry_sum(), 4.0);

        let norm = hist.normalize(4);
        assert_eq!(norm.entries[bin_index(1, 0, 0, 2)], 1.0);
        assert!((norm.entry_sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn entry_sum_matches_pixel_count() {
        let mut img = solid(5, 3, [10, 20, 30]);
        img.put_pixel(0, 0, Rgba([250, 250, 250, 255]));
        let hist = gen_histogram(&img, 4);
        assert_eq!(hist.entry_sum(), 15.0);
        assert!((hist.normalize(15).entry_sum() - 1.0).abs() < 1e-9 * 64.0);
    }

    #[test]
    fn k_one_collapses_everything() {
        let mut img = solid(3, 3, [0, 128, 255]);
        img.put_pixel(1, 1, Rgba([255, 0, 0, 255]));
        let hist = gen_histogram(&img, 1);
        assert_eq!(hist.entries, vec![9.0]);
        assert_eq!(hist.normalize(9).entries, vec![1.0]);
    }

    #[test]
    fn empty_image_is_noop() {
        let img = RgbaImage::new(0, 0);
        let hist = gen_histogram(&img, 2);
        assert_eq!(hist.entry_sum(), 0.0);
        // Dividing by zero pixels falls back to an all-zero histogram.
        assert_eq!(hist.normalize(0).entries, vec![0.0; 8]);
    }

    #[test]
    fn normalize_is_idempotent_once_sum_is_one() {
        let img = solid(4, 2, [9, 200, 90]);
        let normalized = gen_histogram(&img, 3).normalize(8);
        let again = normalized.normalize(0);
        assert!(normalized.approx_eq(&again, 1e-12));
    }

    #[test]
    fn approx_eq_rejects_different_k() {
        assert!(!Histogram::new(2).approx_eq(&Histogram::new(3), 1.0));
    }

    #[test]
    fn accumulate_is_additive() {
        let a = solid(2, 2, [200, 10, 10]);
        let b = solid(3, 1, [10, 200, 10]);
        let mut hist = Histogram::new(2);
        hist.accumulate(&a);
        hist.accumulate(&b);
        assert_eq!(hist.entries[bin_index(1, 0, 0, 2)], 4.0);
        assert_eq!(hist.entries[bin_index(0, 1, 0, 2)], 3.0);
        let combined = gen_histogram_from_parts(2, true, &[a, b]);
        assert!((combined.entries[bin_index(1, 0, 0, 2)] - 4.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn batch_build_keeps_input_order() {
        let storage = MemImageStorage::new(vec![
            solid(2, 2, [200, 10, 10]),
            solid(2, 2, [10, 200, 10]),
            solid(2, 2, [10, 10, 200]),
        ]);
        let count = Cell::new(0usize);
        let progress = |n: usize| count.set(n);
        let hists = build_all_histograms(&storage, true, 2, 4, Some(&progress)).unwrap();
        assert_eq!(hists.len(), 3);
        assert_eq!(count.get(), 3);
        assert_eq!(hists[0].entries[bin_index(1, 0, 0, 2)], 1.0);
        assert_eq!(hists[1].entries[bin_index(0, 1, 0, 2)], 1.0);
        assert_eq!(hists[2].entries[bin_index(0, 0, 1, 2)], 1.0);
    }

    #[test]
    fn batch_build_reports_first_error_but_drains() {
        let storage = MemImageStorage::new(vec![solid(2, 2, [1, 2, 3])]);
        let count = Cell::new(0usize);
        let progress = |n: usize| count.set(n);
        let err = build_histograms(&[0, 7, 0], &storage, false, 2, 2, Some(&progress));
        assert!(err.is_err());
        assert_eq!(count.get(), 3);
    }
}
