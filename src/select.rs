//! Selection of the best-matching database image for every tile.
//!
//! A [`TileMetric`] scores a database image against one tile of the query;
//! an [`ImageSelector`] turns those scores into a full assignment. The
//! baseline selector is [`MetricMinimizer`], which picks the id with the
//! smallest score per tile.

use image::RgbaImage;
use log::error;
use rayon::iter::{
    IntoParallelRefIterator,
    ParallelIterator,
};

use crate::{
    divide::{
        extract_tiles,
        TileDivision,
    },
    histogram::gen_histogram,
    lch::{
        gen_lch,
        lch_dist,
        Lch,
        LchScheme,
    },
    metric::HistogramMetric,
    run_queue,
    sized_pool,
    storage::{
        HistogramStorage,
        ImageStorage,
        LchStorage,
    },
    Histogram,
    ImageId,
    Progress,
    Result,
    NO_IMAGE_ID,
};

/// Scores a database image (by id) against a tile of the query image.
///
/// Workflow: `init_storage` once per database, `init_tiles` once per query,
/// then many concurrent `compare` calls. Implementations therefore keep
/// their per-tile data immutable after `init_tiles`.
pub trait TileMetric: Sync {
    /// Called when the database changes and at creation.
    fn init_storage(&mut self, _storage: &dyn ImageStorage) -> Result<()> {
        Ok(())
    }

    /// Computes the per-tile descriptors of the query image.
    fn init_tiles(&mut self, query: &RgbaImage, division: &TileDivision) -> Result<()>;

    /// The score between the database image `id` and the tile at
    /// `[tile_y][tile_x]`; smaller is more similar.
    fn compare(&self, id: ImageId, tile_y: usize, tile_x: usize) -> Result<f64>;
}

/// Selects a database image for every tile of a division.
///
/// The returned matrix has the shape of the division; cells without a
/// usable candidate carry [`NO_IMAGE_ID`].
pub trait ImageSelector {
    /// Called each time the storage changes and at creation.
    fn init(&mut self, storage: &dyn ImageStorage) -> Result<()>;

    /// Picks the most fitting image for every tile of the query.
    fn select(
        &mut self,
        storage: &dyn ImageStorage,
        query: &RgbaImage,
        division: &TileDivision,
        progress: Progress<'_>,
    ) -> Result<Vec<Vec<ImageId>>>;
}

/// Computes the tile descriptor matrix for a query: all sub-images are
/// extracted, then `routines` workers fill the matrix one cell each, every
/// cell written exactly once, joining before return.
pub(crate) fn init_tiles_matrix<T, F>(
    query: &RgbaImage,
    division: &TileDivision,
    routines: usize,
    on_tile: F,
) -> Vec<Vec<T>>
where
    T: Send,
    F: Fn(&RgbaImage) -> T + Sync,
{
    let tiles = extract_tiles(query, division, routines);
    sized_pool(routines).install(|| {
        tiles
            .par_iter()
            .map(|row| row.par_iter().map(|tile| on_tile(tile)).collect())
            .collect()
    })
}

/// The row-major list of all cell coordinates of a division.
pub(crate) fn tile_coords(division: &TileDivision) -> Vec<(usize, usize)> {
    division
        .iter()
        .enumerate()
        .flat_map(|(y, row)| (0..row.len()).map(move |x| (y, x)))
        .collect()
}

/// A [`TileMetric`] scoring tiles by their global color histogram against a
/// histogram storage.
pub struct HistogramTileMetric<'a> {
    storage: &'a dyn HistogramStorage,
    delta: HistogramMetric,
    routines: usize,
    tile_data: Vec<Vec<Histogram>>,
}

impl<'a> HistogramTileMetric<'a> {
    pub fn new(storage: &'a dyn HistogramStorage, delta: HistogramMetric, routines: usize) -> Self {
        HistogramTileMetric {
            storage,
            delta,
            routines,
            tile_data: Vec::new(),
        }
    }
}

impl TileMetric for HistogramTileMetric<'_> {
    fn init_tiles(&mut self, query: &RgbaImage, division: &TileDivision) -> Result<()> {
        let k = self.storage.divisions();
        self.tile_data = init_tiles_matrix(query, division, self.routines, |tile| {
            let hist = gen_histogram(tile, k);
            let pixels = tile.width() as i64 * tile.height() as i64;
            if pixels > 0 {
                hist.normalize(pixels)
            } else {
                hist
            }
        });
        Ok(())
    }

    fn compare(&self, id: ImageId, tile_y: usize, tile_x: usize) -> Result<f64> {
        let db_hist = self.storage.histogram(id)?;
        let tile_hist = &self.tile_data[tile_y][tile_x];
        if db_hist.k != tile_hist.k {
            return Err(crate::TessellaError::DimensionMismatch {
                what: "histogram",
                left: tile_hist.k as usize,
                right: db_hist.k as usize,
            });
        }
        Ok((self.delta)(tile_hist, db_hist))
    }
}

/// A [`TileMetric`] scoring tiles by their local color histograms against an
/// LCH storage.
pub struct LchTileMetric<'a> {
    storage: &'a dyn LchStorage,
    scheme: Box<dyn LchScheme>,
    delta: HistogramMetric,
    routines: usize,
    tile_data: Vec<Vec<Lch>>,
}

impl<'a> LchTileMetric<'a> {
    pub fn new(
        storage: &'a dyn LchStorage,
        scheme: Box<dyn LchScheme>,
        delta: HistogramMetric,
        routines: usize,
    ) -> Self {
        LchTileMetric {
            storage,
            scheme,
            delta,
            routines,
            tile_data: Vec::new(),
        }
    }
}

impl TileMetric for LchTileMetric<'_> {
    fn init_tiles(&mut self, query: &RgbaImage, division: &TileDivision) -> Result<()> {
        let k = self.storage.divisions();
        let scheme = self.scheme.as_ref();
        let data = init_tiles_matrix(query, division, self.routines, |tile| {
            gen_lch(scheme, tile, k, true)
        });
        let mut rows = Vec::with_capacity(data.len());
        for row in data {
            rows.push(row.into_iter().collect::<Result<Vec<Lch>>>()?);
        }
        self.tile_data = rows;
        Ok(())
    }

    fn compare(&self, id: ImageId, tile_y: usize, tile_x: usize) -> Result<f64> {
        let db_lch = self.storage.lch(id)?;
        lch_dist(&self.tile_data[tile_y][tile_x], db_lch, self.delta)
    }
}

/// An [`ImageSelector`] that assigns every tile the database image with the
/// smallest metric score.
///
/// Candidates whose comparison fails are logged and skipped, they never
/// abort a selection. Tiles are scored by `routines` workers over the
/// shared, read-only tile descriptors.
pub struct MetricMinimizer<M> {
    metric: M,
    routines: usize,
}

impl<M: TileMetric> MetricMinimizer<M> {
    pub fn new(metric: M, routines: usize) -> Self {
        MetricMinimizer {
            metric,
            routines: routines.max(1),
        }
    }
}

impl<M: TileMetric> ImageSelector for MetricMinimizer<M> {
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
        let coords = tile_coords(division);
        let num_images = storage.num_images();
        let mut result: Vec<Vec<ImageId>> = division
            .iter()
            .map(|row| vec![NO_IMAGE_ID; row.len()])
            .collect();
        let metric = &self.metric;
        let mut done = 0usize;
        run_queue(
            coords.len(),
            self.routines,
            |pos| {
                let (y, x) = coords[pos];
                let mut best = NO_IMAGE_ID;
                let mut best_score = f64::INFINITY;
                for id in 0..num_images {
                    match metric.compare(id, y, x) {
                        Ok(score) => {
                            if score < best_score {
                                best_score = score;
                                best = id;
                            }
                        }
                        Err(err) => {
                            error!("skipping image {id} for tile ({y}, {x}): {err}");
                        }
                    }
                }
                best
            },
            |pos, best| {
                let (y, x) = coords[pos];
                result[y][x] = best;
                done += 1;
                if let Some(p) = progress {
                    p(done);
                }
            },
        );
        Ok(result)
    }
}

/// The selector that minimizes a histogram metric over GCH descriptors.
pub fn gch_selector<'a>(
    storage: &'a dyn HistogramStorage,
    delta: HistogramMetric,
    routines: usize,
) -> MetricMinimizer<HistogramTileMetric<'a>> {
    MetricMinimizer::new(HistogramTileMetric::new(storage, delta, routines), routines)
}

/// The selector that minimizes a histogram metric over LCH descriptors.
pub fn lch_selector<'a>(
    storage: &'a dyn LchStorage,
    scheme: Box<dyn LchScheme>,
    delta: HistogramMetric,
    routines: usize,
) -> MetricMinimizer<LchTileMetric<'a>> {
    MetricMinimizer::new(
        LchTileMetric::new(storage, scheme, delta, routines),
        routines,
    )
}
