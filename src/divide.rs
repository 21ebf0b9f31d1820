//! Division of an image into a grid of tile rectangles.
//!
//! A division is a matrix of rectangles indexed `[y][x]`: every entry of the
//! outer vector is one row of tiles. Rectangles may differ in size, may be
//! empty, and (depending on the divide mode) may extend past the image.

use image::{
    imageops,
    RgbaImage,
};
use log::warn;
use rayon::iter::{
    IntoParallelRefIterator,
    ParallelIterator,
};

use crate::sized_pool;

/// An axis-aligned rectangle in pixel coordinates, min inclusive, max
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Rect {
    pub fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Rect {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// The rectangle from the origin to `(width, height)`.
    pub fn from_size(width: u32, height: u32) -> Self {
        Rect::new(0, 0, width, height)
    }

    pub fn dx(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x)
    }

    pub fn dy(&self) -> u32 {
        self.max_y.saturating_sub(self.min_y)
    }

    /// A rectangle is empty iff it has no interior points.
    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_y <= self.min_y
    }

    /// The intersection of two rectangles; the zero rectangle if they do not
    /// overlap.
    pub fn intersect(&self, other: &Rect) -> Rect {
        let res = Rect {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        };
        if res.is_empty() {
            Rect::default()
        } else {
            res
        }
    }
}

/// The tile rectangles of a divided image, indexed `[y][x]`.
pub type TileDivision = Vec<Vec<Rect>>;

/// The extracted tile images of a divided image, same shape as the division.
pub type Tiles = Vec<Vec<RgbaImage>>;

/// How to handle pixels left over when an image dimension is not an exact
/// multiple of the tile dimension.
///
/// Consider an image 99 pixels wide divided into tiles of width 10: nine
/// tiles fit and 9 pixels remain. `Crop` discards them, `Adjust` shrinks a
/// final tile to width 9, and `Pad` appends a full-width tile that extends
/// past the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DivideMode {
    #[default]
    Crop,
    Adjust,
    Pad,
}

/// A strategy that divides a bounding rectangle into tile rectangles.
///
/// Implementations must return a matrix: each row has the same length. Rows
/// may be absent entirely (empty division) and rectangles are not required
/// to lie inside the input.
pub trait Divider {
    fn divide(&self, bounds: Rect) -> TileDivision;
}

/// Divides an image into tiles of a fixed width and height, the
/// [`DivideMode`] decides what happens to remaining pixels.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeDivider {
    pub width: u32,
    pub height: u32,
    pub mode: DivideMode,
}

impl FixedSizeDivider {
    pub fn new(width: u32, height: u32, mode: DivideMode) -> Self {
        FixedSizeDivider {
            width,
            height,
            mode,
        }
    }

    fn count(&self, original: u32, tile: u32) -> u32 {
        if tile > original || tile == 0 {
            1
        } else if original % tile == 0 {
            original / tile
        } else if self.mode == DivideMode::Crop {
            original / tile
        } else {
            original / tile + 1
        }
    }

    fn outer_bound(&self, img_bound: u32, position: u32) -> u32 {
        if position <= img_bound {
            position
        } else if self.mode == DivideMode::Adjust {
            img_bound
        } else {
            // Crop never produces a tile past the image bound, so this is
            // the pad case: the tile keeps its full size.
            if cfg!(debug_assertions) && self.mode != DivideMode::Pad {
                warn!("divider in mode {:?} produced an out-of-bounds tile", self.mode);
            }
            position
        }
    }
}

impl Divider for FixedSizeDivider {
    fn divide(&self, bounds: Rect) -> TileDivision {
        if bounds.is_empty() {
            return Vec::new();
        }
        let num_rows = self.count(bounds.dy(), self.height);
        let num_cols = self.count(bounds.dx(), self.width);
        let mut res = Vec::with_capacity(num_rows as usize);
        for i in 0..num_rows {
            let mut row = Vec::with_capacity(num_cols as usize);
            for j in 0..num_cols {
                let x0 = bounds.min_x + j * self.width;
                let y0 = bounds.min_y + i * self.height;
                let x1 = self.outer_bound(bounds.max_x, x0 + self.width);
                let y1 = self.outer_bound(bounds.max_y, y0 + self.height);
                row.push(Rect::new(x0, y0, x1, y1));
            }
            res.push(row);
        }
        res
    }
}

/// Divides an image into a fixed number of tiles in each direction.
///
/// `cut` decides what happens to remaining pixels: with an image 99 pixels
/// wide and ten tiles, each tile is 9 wide and 9 pixels remain. `cut = true`
/// drops them (the union of tiles stops at 90), `cut = false` widens the
/// last column so the tiles still cover the whole image.
#[derive(Debug, Clone, Copy)]
pub struct FixedNumDivider {
    pub num_x: u32,
    pub num_y: u32,
    pub cut: bool,
}

impl FixedNumDivider {
    pub fn new(num_x: u32, num_y: u32, cut: bool) -> Self {
        FixedNumDivider { num_x, num_y, cut }
    }

    fn outer_bound(&self, division_num: u32, index: u32, img_bound: u32, value: u32) -> u32 {
        if index + 1 == division_num && !self.cut {
            img_bound
        } else {
            value
        }
    }
}

impl Divider for FixedNumDivider {
    fn divide(&self, bounds: Rect) -> TileDivision {
        if bounds.is_empty() {
            return Vec::new();
        }
        let tile_width = (bounds.dx() / self.num_x.max(1)).max(1);
        let tile_height = (bounds.dy() / self.num_y.max(1)).max(1);
        let mut res = Vec::with_capacity(self.num_y as usize);
        for i in 0..self.num_y {
            let mut row = Vec::with_capacity(self.num_x as usize);
            for j in 0..self.num_x {
                let x0 = bounds.min_x + j * tile_width;
                let y0 = bounds.min_y + i * tile_height;
                let x1 = self.outer_bound(self.num_x, j, bounds.max_x, x0 + tile_width);
                let y1 = self.outer_bound(self.num_y, i, bounds.max_y, y0 + tile_height);
                row.push(Rect::new(x0, y0, x1, y1));
            }
            res.push(row);
        }
        res
    }
}

/// Pads a division to `num_x × num_y`, appending empty rectangles where rows
/// or columns are missing. Never removes anything.
///
/// A divider that fulfills its contract never needs this; a warning is
/// logged whenever a repair actually changes the shape.
pub fn repair_division(mut division: TileDivision, num_x: usize, num_y: usize) -> TileDivision {
    if division.len() != num_y {
        warn!(
            "divider returned {} rows, expected {}",
            division.len(),
            num_y
        );
    }
    while division.len() < num_y {
        division.push(vec![Rect::default(); num_x]);
    }
    for (y, row) in division.iter_mut().enumerate() {
        if row.len() != num_x {
            warn!(
                "divider returned {} tiles in row {}, expected {}",
                row.len(),
                y,
                num_x
            );
        }
        while row.len() < num_x {
            row.push(Rect::default());
        }
    }
    division
}

/// Extracts the tile images of a division from `img`, running on `routines`
/// worker threads.
///
/// Every sub-image is the intersection of the tile rectangle with the image
/// bounds, so tiles reaching past the image come back smaller and
/// non-overlapping tiles come back empty. The result has the same shape as
/// the division.
pub fn extract_tiles(img: &RgbaImage, division: &TileDivision, routines: usize) -> Tiles {
    let bounds = Rect::from_size(img.width(), img.height());
    sized_pool(routines).install(|| {
        division
            .par_iter()
            .map(|row| {
                row.par_iter()
                    .map(|tile| {
                        let r = tile.intersect(&bounds);
                        imageops::crop_imm(img, r.min_x, r.min_y, r.dx(), r.dy()).to_image()
                    })
                    .collect()
            })
            .collect()
    })
}
