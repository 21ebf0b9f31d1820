//! Variety selection: keep the top-k candidates per tile and pick among
//! them instead of always taking the single minimizer.
//!
//! Large databases usually contain many images that fit a tile almost
//! equally well; choosing randomly among the best few avoids the same
//! handful of images tiling every flat region of the mosaic.

use image::RgbaImage;
use log::error;
use rand::{
    rngs::StdRng,
    Rng,
    SeedableRng,
};

use crate::{
    divide::TileDivision,
    heap::{
        ImageHeap,
        ImageHeapEntry,
    },
    run_queue,
    select::{
        tile_coords,
        ImageSelector,
        TileMetric,
    },
    storage::ImageStorage,
    ImageId,
    Progress,
    Result,
    NO_IMAGE_ID,
};

/// Computes the bounded top-`bound` heap for every tile of the division.
///
/// Every database id is scored against every tile; failing comparisons are
/// logged and skipped. The work is spread over `routines` workers and
/// `progress` is called after each finished tile. The metric must already be
/// initialized for the query.
pub fn compute_heaps<M: TileMetric>(
    metric: &M,
    division: &TileDivision,
    num_images: ImageId,
    bound: usize,
    routines: usize,
    progress: Progress<'_>,
) -> Vec<Vec<ImageHeap>> {
    let coords = tile_coords(division);
    let mut heaps: Vec<Vec<ImageHeap>> = division
        .iter()
        .map(|row| (0..row.len()).map(|_| ImageHeap::new(Some(bound))).collect())
        .collect();
    let mut done = 0usize;
    run_queue(
        coords.len(),
        routines,
        |pos| {
            let (y, x) = coords[pos];
            let mut heap = ImageHeap::new(Some(bound));
            for id in 0..num_images {
                match metric.compare(id, y, x) {
                    Ok(score) => heap.push(id, score),
                    Err(err) => {
                        error!("skipping image {id} for tile ({y}, {x}): {err}");
                    }
                }
            }
            heap
        },
        |pos, heap| {
            let (y, x) = coords[pos];
            heaps[y][x] = heap;
            done += 1;
            if let Some(p) = progress {
                p(done);
            }
        },
    );
    heaps
}

/// The sorted views of a heap matrix, a shortcut over
/// [`ImageHeap::view`].
pub fn heap_views(heaps: &[Vec<ImageHeap>]) -> Vec<Vec<Vec<ImageHeapEntry>>> {
    heaps
        .iter()
        .map(|row| row.iter().map(ImageHeap::view).collect())
        .collect()
}

/// Picks the final image per tile from the precomputed heaps.
pub trait HeapSelector {
    fn select(
        &mut self,
        storage: &dyn ImageStorage,
        division: &TileDivision,
        heaps: &[Vec<ImageHeap>],
    ) -> Result<Vec<Vec<ImageId>>>;
}

/// A [`HeapSelector`] choosing uniformly at random from each heap view.
///
/// The generator is a plain single-threaded source; selection runs strictly
/// after the parallel heap computation, so it is never shared between
/// workers.
pub struct RandomHeapSelector {
    rng: StdRng,
}

impl RandomHeapSelector {
    pub fn new() -> Self {
        RandomHeapSelector {
            rng: StdRng::from_entropy(),
        }
    }

    /// A selector with a caller-provided generator, which makes the picks
    /// reproducible.
    pub fn with_rng(rng: StdRng) -> Self {
        RandomHeapSelector { rng }
    }
}

impl Default for RandomHeapSelector {
    fn default() -> Self {
        RandomHeapSelector::new()
    }
}

impl HeapSelector for RandomHeapSelector {
    fn select(
        &mut self,
        _storage: &dyn ImageStorage,
        division: &TileDivision,
        heaps: &[Vec<ImageHeap>],
    ) -> Result<Vec<Vec<ImageId>>> {
        let views = heap_views(heaps);
        let mut result: Vec<Vec<ImageId>> = Vec::with_capacity(division.len());
        for (y, row) in division.iter().enumerate() {
            let mut out_row = Vec::with_capacity(row.len());
            for x in 0..row.len() {
                let view = &views[y][x];
                if view.is_empty() {
                    out_row.push(NO_IMAGE_ID);
                } else {
                    let index = self.rng.gen_range(0..view.len());
                    out_row.push(view[index].image);
                }
            }
            result.push(out_row);
        }
        Ok(result)
    }
}

/// An [`ImageSelector`] computing per-tile top-k heaps with a
/// [`TileMetric`] and delegating the final pick to a [`HeapSelector`].
pub struct HeapImageSelector<M, S> {
    metric: M,
    selector: S,
    bound: usize,
    routines: usize,
}

impl<M: TileMetric, S: HeapSelector> HeapImageSelector<M, S> {
    /// `bound` is the number of best candidates kept per tile.
    pub fn new(metric: M, selector: S, bound: usize, routines: usize) -> Self {
        HeapImageSelector {
            metric,
            selector,
            bound,
            routines: routines.max(1),
        }
    }
}

impl<M: TileMetric, S: HeapSelector> ImageSelector for HeapImageSelector<M, S> {
    fn init(&mut self, storage: &dyn ImageStorage) -> Result<()> {
        self.metric.init_storage(storage)
    }

    fn select(
        &mut self,
        storage: &dyn ImageStorage,
        query: &RgbaImage,
        division: &TileDivision,
        progress: Progress<'_>,
    ) -> Result<Vec<Vec<ImageId>>> {
        self.metric.init_tiles(query, division)?;
        let heaps = compute_heaps(
            &self.metric,
            division,
            storage.num_images(),
            self.bound,
            self.routines,
            progress,
        );
        self.selector.select(storage, division, &heaps)
    }
}

/// A heap selector over `metric` picking randomly among the `bound` best
/// candidates per tile.
pub fn random_heap_selector<M: TileMetric>(
    metric: M,
    bound: usize,
    routines: usize,
) -> HeapImageSelector<M, RandomHeapSelector> {
    HeapImageSelector::new(metric, RandomHeapSelector::new(), bound, routines)
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;
    use crate::{
        divide::Rect,
        histogram::{
            bin_index,
            Histogram,
        },
        metric::manhattan,
        select::HistogramTileMetric,
        storage::{
            MemImageStorage,
            MemoryHistogramStorage,
        },
    };

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([rgb[0], rgb[1], rgb[2], 255]))
    }

    fn storage_with_reds(n: usize) -> MemoryHistogramStorage {
        // Increasingly wrong candidates: id 0 matches a red tile perfectly,
        // later ids mix in more green.
        let mut histograms = Vec::new();
        for i in 0..n {
            let mut h = Histogram::new(2);
            let green_share = i as f64 / n as f64;
            h.entries[bin_index(1, 0, 0, 2)] = 1.0 - green_share;
            h.entries[bin_index(0, 1, 0, 2)] = green_share;
            histograms.push(h);
        }
        MemoryHistogramStorage::new(histograms, 2)
    }

    #[test]
    fn heaps_keep_the_best_candidates() {
        let storage = storage_with_reds(10);
        let query = solid(4, 4, [220, 10, 10]);
        let division = vec![vec![Rect::from_size(4, 4)]];
        let mut metric = HistogramTileMetric::new(&storage, manhattan, 2);
        metric.init_tiles(&query, &division).unwrap();

        let heaps = compute_heaps(&metric, &division, 10, 3, 2, None);
        let view = heaps[0][0].view();
        assert_eq!(view.len(), 3);
        assert_eq!(
            view.iter().map(|e| e.image).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn random_selector_picks_within_heap() {
        let storage = storage_with_reds(10);
        let images = MemImageStorage::new(vec![solid(1, 1, [0; 3]); 10]);
        let query = solid(8, 4, [220, 10, 10]);
        let division = vec![vec![Rect::from_size(4, 4), Rect::new(4, 0, 8, 4)]];

        let metric = HistogramTileMetric::new(&storage, manhattan, 2);
        let selector = RandomHeapSelector::with_rng(StdRng::seed_from_u64(7));
        let mut heap_selector = HeapImageSelector::new(metric, selector, 4, 2);
        heap_selector.init(&images).unwrap();
        let selection = heap_selector
            .select(&images, &query, &division, None)
            .unwrap();
        assert_eq!(selection.len(), 1);
        assert_eq!(selection[0].len(), 2);
        for &id in &selection[0] {
            // Only the four best candidates are eligible.
            assert!((0..4).contains(&id));
        }
    }

    #[test]
    fn empty_heap_yields_sentinel() {
        let storage = storage_with_reds(0);
        let images = MemImageStorage::default();
        let query = solid(4, 4, [220, 10, 10]);
        let division = vec![vec![Rect::from_size(4, 4)]];
        let metric = HistogramTileMetric::new(&storage, manhattan, 1);
        let mut selector = random_heap_selector(metric, 3, 1);
        selector.init(&images).unwrap();
        let selection = selector.select(&images, &query, &division, None).unwrap();
        assert_eq!(selection, vec![vec![NO_IMAGE_ID]]);
    }

    #[test]
    fn progress_counts_tiles() {
        use std::cell::Cell;

        let storage = storage_with_reds(3);
        let query = solid(4, 4, [220, 10, 10]);
        let division = vec![
            vec![Rect::from_size(2, 2), Rect::new(2, 0, 4, 2)],
            vec![Rect::new(0, 2, 2, 4), Rect::new(2, 2, 4, 4)],
        ];
        let mut metric = HistogramTileMetric::new(&storage, manhattan, 2);
        metric.init_tiles(&query, &division).unwrap();
        let count = Cell::new(0usize);
        let progress = |n: usize| count.set(n);
        compute_heaps(&metric, &division, 3, 2, 2, Some(&progress));
        assert_eq!(count.get(), 4);
    }
}
