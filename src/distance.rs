//! Spatially diverse selection from the per-tile candidate heaps.
//!
//! Picking randomly still lets a popular image land on neighbouring tiles.
//! This selector walks the tiles in row-major order and, among each tile's
//! top candidates, picks the one whose previous placements are farthest away
//! in Manhattan distance.

use std::collections::HashMap;

use image::RgbaImage;

use crate::{
    divide::TileDivision,
    select::{
        ImageSelector,
        TileMetric,
    },
    storage::ImageStorage,
    variety::compute_heaps,
    ImageId,
    Progress,
    Result,
    NO_IMAGE_ID,
};

fn manhattan_dist(a: (i64, i64), b: (i64, i64)) -> i64 {
    (a.0 - b.0).abs() + (a.1 - b.1).abs()
}

/// The smallest Manhattan distance from `point` to any of `placements`;
/// unplaced candidates are infinitely far away.
fn closest_placement(point: (i64, i64), placements: Option<&Vec<(i64, i64)>>) -> i64 {
    placements
        .map(|points| {
            points
                .iter()
                .map(|&p| manhattan_dist(point, p))
                .min()
                .unwrap_or(i64::MAX)
        })
        .unwrap_or(i64::MAX)
}

/// An [`ImageSelector`] that computes per-tile top-k heaps and then greedily
/// maximizes the distance between repeated placements of the same image.
///
/// For every tile (row-major) the candidate maximizing the minimum Manhattan
/// distance between the tile origin and the candidate's already assigned
/// origins wins; on equal distances the earlier candidate in the heap view
/// (i.e. the better-scoring one) is kept.
pub struct DistanceHeapSelector<M> {
    metric: M,
    bound: usize,
    routines: usize,
}

impl<M: TileMetric> DistanceHeapSelector<M> {
    /// `bound` is the number of best candidates considered per tile.
    pub fn new(metric: M, bound: usize, routines: usize) -> Self {
        DistanceHeapSelector {
            metric,
            bound,
            routines: routines.max(1),
        }
    }
}

impl<M: TileMetric> ImageSelector for DistanceHeapSelector<M> {
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

        let mut placements: HashMap<ImageId, Vec<(i64, i64)>> = HashMap::new();
        let mut result: Vec<Vec<ImageId>> = Vec::with_capacity(division.len());
        for (y, row) in division.iter().enumerate() {
            let mut out_row = Vec::with_capacity(row.len());
            for (x, rect) in row.iter().enumerate() {
                let origin = (rect.min_x as i64, rect.min_y as i64);
                let mut best = NO_IMAGE_ID;
                let mut best_dist = i64::MIN;
                for entry in heaps[y][x].view() {
                    let dist = closest_placement(origin, placements.get(&entry.image));
                    if dist > best_dist {
                        best_dist = dist;
                        best = entry.image;
                    }
                }
                if best != NO_IMAGE_ID {
                    placements.entry(best).or_default().push(origin);
                }
                out_row.push(best);
            }
            result.push(out_row);
        }
        Ok(result)
    }
}
