//! Local color histograms.
//!
//! Where a global histogram describes the whole image at once, an LCH keeps
//! one histogram per region of a fixed spatial partitioning scheme, so two
//! images only score as similar when their colors agree region by region.

use image::RgbaImage;
use rayon::iter::{
    IntoParallelRefIterator,
    ParallelIterator,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    divide::{
        extract_tiles,
        repair_division,
        Divider,
        FixedNumDivider,
        Rect,
    },
    histogram::{
        gen_histogram_from_parts,
        Histogram,
    },
    metric::HistogramMetric,
    run_queue,
    storage::{
        id_list,
        ImageStorage,
    },
    ImageId,
    Progress,
    Result,
    TessellaError,
};

/// A local color histogram: an ordered, fixed-size sequence of histograms,
/// all built with the same `k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lch {
    pub histograms: Vec<Histogram>,
}

impl Lch {
    pub fn new(histograms: Vec<Histogram>) -> Self {
        Lch { histograms }
    }

    pub fn size(&self) -> usize {
        self.histograms.len()
    }
}

/// The distance between two LCHs under the histogram metric `delta`:
/// `|δ(h₁ᵢ, h₂ᵢ)|` summed over all regions.
///
/// The LCHs must have the same number of regions and every aligned pair of
/// histograms the same `k`, otherwise a dimension error is returned.
pub fn lch_dist(a: &Lch, b: &Lch, delta: HistogramMetric) -> Result<f64> {
    if a.size() != b.size() {
        return Err(TessellaError::DimensionMismatch {
            what: "LCH",
            left: a.size(),
            right: b.size(),
        });
    }
    let mut sum = 0.0;
    for (ha, hb) in a.histograms.iter().zip(&b.histograms) {
        if ha.k != hb.k {
            return Err(TessellaError::DimensionMismatch {
                what: "histogram",
                left: ha.k as usize,
                right: hb.k as usize,
            });
        }
        sum += delta(ha, hb).abs();
    }
    Ok(sum)
}

/// A spatial partitioning rule turning an image into a fixed number of
/// sub-image lists.
///
/// A sub-image may appear in several lists and the lists may differ in
/// length; only their number is fixed per scheme.
pub trait LchScheme: Sync {
    /// The per-region sub-image lists, always `size()` of them.
    fn parts(&self, img: &RgbaImage) -> Result<Vec<Vec<RgbaImage>>>;

    /// The number of regions this scheme produces.
    fn size(&self) -> u32;
}

fn scheme_blocks(img: &RgbaImage, n: u32) -> Vec<Vec<RgbaImage>> {
    let divider = FixedNumDivider::new(n, n, false);
    let mut division = divider.divide(Rect::from_size(img.width(), img.height()));
    if division.len() != n as usize || division.iter().any(|row| row.len() != n as usize) {
        division = repair_division(division, n as usize, n as usize);
    }
    extract_tiles(img, &division, (n * n) as usize)
}

/// The four-part scheme: north, west, south and east, each region covering
/// half of a 2×2 block division.
#[derive(Debug, Clone, Copy, Default)]
pub struct FourScheme;

impl LchScheme for FourScheme {
    fn parts(&self, img: &RgbaImage) -> Result<Vec<Vec<RgbaImage>>> {
        let blocks = scheme_blocks(img, 2);
        Ok(vec![
            // north
            vec![blocks[0][0].clone(), blocks[0][1].clone()],
            // west
            vec![blocks[0][0].clone(), blocks[1][0].clone()],
            // south
            vec![blocks[1][0].clone(), blocks[1][1].clone()],
            // east
            vec![blocks[0][1].clone(), blocks[1][1].clone()],
        ])
    }

    fn size(&self) -> u32 {
        4
    }
}

/// The five-part scheme: north, west, south, east and center over a 3×3
/// block division.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiveScheme;

impl LchScheme for FiveScheme {
    fn parts(&self, img: &RgbaImage) -> Result<Vec<Vec<RgbaImage>>> {
        let blocks = scheme_blocks(img, 3);
        Ok(vec![
            // north
            vec![
                blocks[0][0].clone(),
                blocks[0][1].clone(),
                blocks[0][2].clone(),
            ],
            // west
            vec![
                blocks[0][0].clone(),
                blocks[1][0].clone(),
                blocks[2][0].clone(),
            ],
            // south
            vec![
                blocks[2][0].clone(),
                blocks[2][1].clone(),
                blocks[2][2].clone(),
            ],
            // east
            vec![
                blocks[0][2].clone(),
                blocks[1][2].clone(),
                blocks[2][2].clone(),
            ],
            // center
            vec![blocks[1][1].clone()],
        ])
    }

    fn size(&self) -> u32 {
        5
    }
}

/// Builds the LCH of one image: the scheme partitions the image and the
/// per-region histograms are computed in parallel, joining before return.
pub fn gen_lch(scheme: &dyn LchScheme, img: &RgbaImage, k: u32, normalize: bool) -> Result<Lch> {
    let parts = scheme.parts(img)?;
    let histograms = parts
        .par_iter()
        .map(|list| gen_histogram_from_parts(k, normalize, list))
        .collect();
    Ok(Lch::new(histograms))
}

/// Builds the LCH descriptor for every id in `ids`, loading the images
/// through `storage`.
///
/// Same batch contract as [`build_histograms`](crate::build_histograms):
/// `routines` workers, exactly one outcome drained per id, first error wins,
/// `progress` after every outcome, result position `i` belongs to `ids[i]`.
pub fn build_lchs(
    scheme: &dyn LchScheme,
    ids: &[ImageId],
    storage: &dyn ImageStorage,
    normalize: bool,
    k: u32,
    routines: usize,
    progress: Progress<'_>,
) -> Result<Vec<Lch>> {
    let mut out: Vec<Option<Lch>> = (0..ids.len()).map(|_| None).collect();
    let mut first_err = None;
    let mut done = 0usize;
    run_queue(
        ids.len(),
        routines,
        |pos| -> Result<Lch> {
            let img = storage.load_image(ids[pos])?;
            gen_lch(scheme, &img, k, normalize)
        },
        |pos, outcome| {
            match outcome {
                Ok(lch) => out[pos] = Some(lch),
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

/// Builds LCH descriptors for every image in the storage, see
/// [`build_lchs`].
pub fn build_all_lchs(
    scheme: &dyn LchScheme,
    storage: &dyn ImageStorage,
    normalize: bool,
    k: u32,
    routines: usize,
    progress: Progress<'_>,
) -> Result<Vec<Lch>> {
    build_lchs(
        scheme,
        &id_list(storage),
        storage,
        normalize,
        k,
        routines,
        progress,
    )
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;
    use crate::{
        metric::{
            euclid,
            manhattan,
        },
        storage::MemImageStorage,
    };

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([rgb[0], rgb[1], rgb[2], 255]))
    }

    #[test]
    fn four_scheme_has_two_blocks_per_region() {
        let img = solid(4, 4, [50, 50, 50]);
        let parts = FourScheme.parts(&img).unwrap();
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|list| list.len() == 2));
        for list in &parts {
            for block in list {
                assert_eq!(block.dimensions(), (2, 2));
            }
        }
    }

    #[test]
    fn five_scheme_region_sizes() {
        let img = solid(6, 6, [50, 50, 50]);
        let parts = FiveScheme.parts(&img).unwrap();
        assert_eq!(parts.len(), 5);
        let lens: Vec<usize> = parts.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![3, 3, 3, 3, 1]);
    }

    #[test]
    fn lch_distance_to_itself_is_zero() {
        let img = solid(2, 2, [220, 10, 10]);
        let lch = gen_lch(&FourScheme, &img, 2, true).unwrap();
        assert_eq!(lch.size(), 4);
        assert_eq!(lch_dist(&lch, &lch, euclid).unwrap(), 0.0);
    }

    #[test]
    fn lch_distance_separates_different_images() {
        let red = gen_lch(&FourScheme, &solid(4, 4, [220, 10, 10]), 2, true).unwrap();
        let green = gen_lch(&FourScheme, &solid(4, 4, [10, 220, 10]), 2, true).unwrap();
        assert!(lch_dist(&red, &green, manhattan).unwrap() > 0.0);
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let img = solid(6, 6, [1, 2, 3]);
        let four = gen_lch(&FourScheme, &img, 2, true).unwrap();
        let five = gen_lch(&FiveScheme, &img, 2, true).unwrap();
        assert!(matches!(
            lch_dist(&four, &five, euclid),
            Err(TessellaError::DimensionMismatch { what: "LCH", .. })
        ));
    }

    #[test]
    fn mismatched_k_is_rejected() {
        let img = solid(4, 4, [1, 2, 3]);
        let a = gen_lch(&FourScheme, &img, 2, true).unwrap();
        let b = gen_lch(&FourScheme, &img, 3, true).unwrap();
        assert!(matches!(
            lch_dist(&a, &b, euclid),
            Err(TessellaError::DimensionMismatch {
                what: "histogram",
                ..
            })
        ));
    }

    #[test]
    fn normalized_regions_sum_to_one() {
        let img = solid(5, 5, [9, 90, 200]);
        let lch = gen_lch(&FiveScheme, &img, 2, true).unwrap();
        for hist in &lch.histograms {
            assert!((hist.entry_sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn batch_build_keeps_order() {
        let storage = MemImageStorage::new(vec![
            solid(4, 4, [220, 10, 10]),
            solid(4, 4, [10, 220, 10]),
        ]);
        let lchs = build_all_lchs(&FourScheme, &storage, true, 2, 2, None).unwrap();
        assert_eq!(lchs.len(), 2);
        assert!(lch_dist(&lchs[0], &lchs[1], manhattan).unwrap() > 0.0);
        let direct = gen_lch(&FourScheme, &solid(4, 4, [220, 10, 10]), 2, true).unwrap();
        assert_eq!(lch_dist(&lchs[0], &direct, manhattan).unwrap(), 0.0);
    }
}
