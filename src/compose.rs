//! Composition of the final mosaic from the per-tile selection.
//!
//! Selected database images are loaded, scaled to their tile rectangle and
//! blitted into one output image. The same image scaled to the same size
//! tends to reappear many times in a mosaic, so scaled tiles go through a
//! small FIFO cache.

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::Arc,
};

use image::{
    imageops,
    imageops::FilterType,
    RgbaImage,
};
use log::warn;
use parking_lot::Mutex;

use crate::{
    divide::{
        Rect,
        TileDivision,
    },
    run_queue,
    select::tile_coords,
    storage::ImageStorage,
    ImageId,
    Progress,
    Result,
    TessellaError,
    IMAGE_CACHE_SIZE,
    NO_IMAGE_ID,
};

/// The interpolation filter for a quality level between 0 (fastest) and 5
/// (best). Values above 5 select the best filter as well.
pub fn interp_filter(quality: u32) -> FilterType {
    match quality {
        0 => FilterType::Nearest,
        1 => FilterType::Triangle,
        2 => FilterType::CatmullRom,
        3 => FilterType::Gaussian,
        _ => FilterType::Lanczos3,
    }
}

/// A readable name for the filter selected by a quality level.
pub fn interp_name(quality: u32) -> &'static str {
    match quality {
        0 => "nearest",
        1 => "triangle",
        2 => "catmull-rom",
        3 => "gaussian",
        _ => "lanczos3",
    }
}

/// An engine scaling an image to exactly the requested dimensions.
pub trait ImageResizer: Sync {
    fn resize(&self, width: u32, height: u32, img: &RgbaImage) -> RgbaImage;
}

/// An [`ImageResizer`] backed by the `image` crate's resampling filters.
#[derive(Debug, Clone, Copy)]
pub struct FilterResizer {
    pub filter: FilterType,
}

impl FilterResizer {
    pub fn new(filter: FilterType) -> Self {
        FilterResizer { filter }
    }

    pub fn from_quality(quality: u32) -> Self {
        FilterResizer::new(interp_filter(quality))
    }
}

impl Default for FilterResizer {
    fn default() -> Self {
        FilterResizer::new(FilterType::Lanczos3)
    }
}

impl ImageResizer for FilterResizer {
    fn resize(&self, width: u32, height: u32, img: &RgbaImage) -> RgbaImage {
        imageops::resize(img, width, height, self.filter)
    }
}

/// Decides how a database image is fitted into a tile rectangle, given an
/// engine that does the actual scaling.
///
/// A strategy could crop first or preserve the aspect ratio and fill the
/// borders; [`force_resize`] simply scales to the exact tile size.
pub type ResizeStrategy = fn(&dyn ImageResizer, u32, u32, &RgbaImage) -> RgbaImage;

/// Scales to the exact tile dimensions, ignoring the aspect ratio of the
/// original image.
pub fn force_resize(
    resizer: &dyn ImageResizer,
    tile_width: u32,
    tile_height: u32,
    img: &RgbaImage,
) -> RgbaImage {
    resizer.resize(tile_width, tile_height, img)
}

type CacheKey = (ImageId, u32, u32);

struct CacheInner {
    content: HashMap<CacheKey, Arc<RgbaImage>>,
    insert_order: VecDeque<CacheKey>,
}

/// A FIFO cache of scaled images keyed by `(id, width, height)`.
///
/// The cache is one shared resource: reads and writes are mutually
/// exclusive behind a single lock. When full, a put evicts the oldest
/// insertion; putting a key that is already present changes nothing.
pub struct ImageCache {
    inner: Mutex<CacheInner>,
    size: usize,
}

impl ImageCache {
    /// Creates a cache for `size` images; `size` is clamped to at least 1.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        ImageCache {
            inner: Mutex::new(CacheInner {
                content: HashMap::with_capacity(size),
                insert_order: VecDeque::with_capacity(size),
            }),
            size,
        }
    }

    /// The cached image scaled to `width × height`, if present.
    pub fn get(&self, id: ImageId, width: u32, height: u32) -> Option<Arc<RgbaImage>> {
        self.inner.lock().content.get(&(id, width, height)).cloned()
    }

    /// Inserts a scaled image, evicting the oldest entry when full.
    pub fn put(&self, id: ImageId, width: u32, height: u32, img: Arc<RgbaImage>) {
        let key = (id, width, height);
        let mut inner = self.inner.lock();
        if inner.content.contains_key(&key) {
            return;
        }
        if inner.insert_order.len() >= self.size {
            if let Some(oldest) = inner.insert_order.pop_front() {
                inner.content.remove(&oldest);
            }
        }
        inner.insert_order.push_back(key);
        inner.content.insert(key, img);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn blit(out: &mut RgbaImage, area: Rect, tile: &RgbaImage) {
    let width = area
        .dx()
        .min(tile.width())
        .min(out.width().saturating_sub(area.min_x));
    let height = area
        .dy()
        .min(tile.height())
        .min(out.height().saturating_sub(area.min_y));
    for dy in 0..height {
        for dx in 0..width {
            out.put_pixel(area.min_x + dx, area.min_y + dy, *tile.get_pixel(dx, dy));
        }
    }
}

/// Composes the mosaic image from the selected tile images.
///
/// `division` holds the output tile rectangles, anchored at the origin so
/// the far corner of the last rectangle is the output size; `selection` is
/// the matching matrix of chosen ids. `routines` workers load, scale
/// (through `strategy` and `resizer`, with a cache of `cache_size` scaled
/// images, 0 meaning the default size) and hand the finished tiles to the
/// driver, which writes them into the output and reports `progress`.
///
/// An empty selection produces an empty image. Tiles without an id and
/// tiles whose image fails to load are logged and left transparent; the
/// composition itself still succeeds.
pub fn compose_mosaic(
    storage: &dyn ImageStorage,
    selection: &[Vec<ImageId>],
    division: &TileDivision,
    resizer: &dyn ImageResizer,
    strategy: ResizeStrategy,
    routines: usize,
    cache_size: usize,
    progress: Progress<'_>,
) -> Result<RgbaImage> {
    let cache_size = if cache_size == 0 {
        IMAGE_CACHE_SIZE
    } else {
        cache_size
    };
    let empty_selection = selection.is_empty() || selection.last().is_some_and(Vec::is_empty);
    if empty_selection {
        return Ok(RgbaImage::new(0, 0));
    }
    let last = division
        .last()
        .and_then(|row| row.last())
        .copied()
        .unwrap_or_default();
    let bounds = Rect::from_size(last.max_x, last.max_y);
    if bounds.is_empty() {
        return Err(TessellaError::EmptyImage(
            "mosaic output would be empty".to_string(),
        ));
    }

    let mut out = RgbaImage::new(bounds.max_x, bounds.max_y);
    let cache = ImageCache::new(cache_size);
    let coords = tile_coords(division);
    let mut done = 0usize;
    run_queue(
        coords.len(),
        routines,
        |pos| -> Option<(Rect, Arc<RgbaImage>)> {
            let (y, x) = coords[pos];
            let area = division[y][x];
            let id = selection[y][x];
            if id == NO_IMAGE_ID {
                warn!("no image selected for tile ({y}, {x})");
                return None;
            }
            if area.is_empty() {
                return None;
            }
            let (tile_w, tile_h) = (area.dx(), area.dy());
            if let Some(scaled) = cache.get(id, tile_w, tile_h) {
                return Some((area, scaled));
            }
            match storage.load_image(id) {
                Ok(img) => {
                    let scaled = Arc::new(strategy(resizer, tile_w, tile_h, &img));
                    cache.put(id, tile_w, tile_h, Arc::clone(&scaled));
                    Some((area, scaled))
                }
                Err(err) => {
                    warn!("skipping tile ({y}, {x}): {err}");
                    None
                }
            }
        },
        |_pos, tile| {
            if let Some((area, scaled)) = tile {
                blit(&mut out, area, &scaled);
            }
            done += 1;
            if let Some(p) = progress {
                p(done);
            }
        },
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;
    use crate::{
        divide::{
            Divider,
            FixedNumDivider,
        },
        storage::MemImageStorage,
    };

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([rgb[0], rgb[1], rgb[2], 255]))
    }

    fn arc_img(rgb: [u8; 3]) -> Arc<RgbaImage> {
        Arc::new(solid(1, 1, rgb))
    }

    #[test]
    fn cache_evicts_in_fifo_order() {
        let cache = ImageCache::new(2);
        cache.put(0, 10, 10, arc_img([1, 1, 1]));
        cache.put(1, 10, 10, arc_img([2, 2, 2]));
        cache.put(2, 10, 10, arc_img([3, 3, 3]));
        assert!(cache.get(0, 10, 10).is_none());
        assert!(cache.get(1, 10, 10).is_some());
        assert!(cache.get(2, 10, 10).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn cache_put_of_present_key_is_noop() {
        let cache = ImageCache::new(2);
        cache.put(0, 10, 10, arc_img([1, 1, 1]));
        cache.put(1, 10, 10, arc_img([2, 2, 2]));
        cache.put(0, 10, 10, arc_img([9, 9, 9]));
        // Nothing was evicted and the first value is still in place.
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(0, 10, 10).unwrap().get_pixel(0, 0)[0], 1);
        assert!(cache.get(1, 10, 10).is_some());
    }

    #[test]
    fn cache_keys_include_dimensions() {
        let cache = ImageCache::new(2);
        cache.put(0, 10, 10, arc_img([1, 1, 1]));
        assert!(cache.get(0, 20, 20).is_none());
    }

    #[test]
    fn cache_size_is_clamped() {
        let cache = ImageCache::new(0);
        cache.put(0, 1, 1, arc_img([1, 1, 1]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn compose_places_tiles() {
        let storage = MemImageStorage::new(vec![
            solid(4, 4, [200, 0, 0]),
            solid(4, 4, [0, 200, 0]),
        ]);
        let selection = vec![vec![0, 1]];
        let division = vec![vec![Rect::from_size(2, 2), Rect::new(2, 0, 4, 2)]];
        let out = compose_mosaic(
            &storage,
            &selection,
            &division,
            &FilterResizer::from_quality(0),
            force_resize,
            2,
            0,
            None,
        )
        .unwrap();
        assert_eq!(out.dimensions(), (4, 2));
        assert_eq!(out.get_pixel(0, 0), &Rgba([200, 0, 0, 255]));
        assert_eq!(out.get_pixel(1, 1), &Rgba([200, 0, 0, 255]));
        assert_eq!(out.get_pixel(2, 0), &Rgba([0, 200, 0, 255]));
        assert_eq!(out.get_pixel(3, 1), &Rgba([0, 200, 0, 255]));
    }

    #[test]
    fn compose_output_covers_division_bounds() {
        let storage = MemImageStorage::new(vec![solid(8, 8, [9, 9, 9])]);
        let division = FixedNumDivider::new(3, 2, false).divide(Rect::from_size(10, 6));
        let selection = vec![vec![0; 3], vec![0; 3]];
        let out = compose_mosaic(
            &storage,
            &selection,
            &division,
            &FilterResizer::from_quality(0),
            force_resize,
            3,
            2,
            None,
        )
        .unwrap();
        assert_eq!(out.dimensions(), (10, 6));
        assert_eq!(out.get_pixel(9, 5), &Rgba([9, 9, 9, 255]));
    }

    #[test]
    fn empty_selection_gives_empty_image() {
        let storage = MemImageStorage::default();
        let out = compose_mosaic(
            &storage,
            &[],
            &Vec::new(),
            &FilterResizer::default(),
            force_resize,
            1,
            0,
            None,
        )
        .unwrap();
        assert_eq!(out.dimensions(), (0, 0));
    }

    #[test]
    fn empty_output_rect_is_an_error() {
        let storage = MemImageStorage::new(vec![solid(2, 2, [1, 1, 1])]);
        let selection = vec![vec![0]];
        let division = vec![vec![Rect::default()]];
        let res = compose_mosaic(
            &storage,
            &selection,
            &division,
            &FilterResizer::default(),
            force_resize,
            1,
            0,
            None,
        );
        assert!(matches!(res, Err(TessellaError::EmptyImage(_))));
    }

    #[test]
    fn missing_ids_leave_tiles_transparent() {
        let storage = MemImageStorage::new(vec![solid(2, 2, [200, 0, 0])]);
        let selection = vec![vec![NO_IMAGE_ID, 0]];
        let division = vec![vec![Rect::from_size(2, 2), Rect::new(2, 0, 4, 2)]];
        let out = compose_mosaic(
            &storage,
            &selection,
            &division,
            &FilterResizer::from_quality(0),
            force_resize,
            1,
            0,
            None,
        )
        .unwrap();
        assert_eq!(out.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
        assert_eq!(out.get_pixel(2, 0), &Rgba([200, 0, 0, 255]));
    }

    #[test]
    fn load_failures_are_skipped() {
        use std::cell::Cell;

        let storage = MemImageStorage::new(vec![solid(2, 2, [200, 0, 0])]);
        // Id 7 does not exist; its tile is skipped but progress still runs.
        let selection = vec![vec![7, 0]];
        let division = vec![vec![Rect::from_size(2, 2), Rect::new(2, 0, 4, 2)]];
        let count = Cell::new(0usize);
        let progress = |n: usize| count.set(n);
        let out = compose_mosaic(
            &storage,
            &selection,
            &division,
            &FilterResizer::from_quality(0),
            force_resize,
            2,
            0,
            Some(&progress),
        )
        .unwrap();
        assert_eq!(count.get(), 2);
        assert_eq!(out.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
        assert_eq!(out.get_pixel(2, 0), &Rgba([200, 0, 0, 255]));
    }
}
