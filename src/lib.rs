//! Tessella builds photomosaics: a query image is divided into a grid of
//! tiles, every tile is matched against a database of images by
//! color-histogram distance, and the selected images are resized and
//! composed into the final mosaic.
//!
//! ### Basic Usage
//!
//! ```no_run
//! use tessella::{
//!     build_all_histograms,
//!     compose_mosaic,
//!     force_resize,
//!     gch_selector,
//!     get_metric,
//!     Divider,
//!     FilterResizer,
//!     FixedNumDivider,
//!     FsImageDb,
//!     FsMapper,
//!     ImageSelector,
//!     MemoryHistogramStorage,
//!     Rect,
//! };
//!
//! # fn main() -> tessella::Result<()> {
//! let mut mapper = FsMapper::new();
//! mapper.load("./pictures".as_ref(), false, None)?;
//! let db = FsImageDb::new(&mapper);
//!
//! let histograms = build_all_histograms(&db, true, 8, 4, None)?;
//! let storage = MemoryHistogramStorage::new(histograms, 8);
//!
//! let query = image::open("query.jpg")?.to_rgba8();
//! let division = FixedNumDivider::new(20, 30, true)
//!     .divide(Rect::from_size(query.width(), query.height()));
//!
//! let metric = get_metric("euclid").unwrap();
//! let mut selector = gch_selector(&storage, metric, 4);
//! selector.init(&db)?;
//! let selection = selector.select(&db, &query, &division, None)?;
//!
//! let output = FixedNumDivider::new(20, 30, false)
//!     .divide(Rect::from_size(query.width(), query.height()));
//! let mosaic = compose_mosaic(
//!     &db,
//!     &selection,
//!     &output,
//!     &FilterResizer::default(),
//!     force_resize,
//!     4,
//!     0,
//!     None,
//! )?;
//! mosaic.save("mosaic.png")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Choosing a Selector
//! - I want the closest match for every tile:
//!   - Use [`MetricMinimizer`] (or the [`gch_selector`] / [`lch_selector`]
//!     shortcuts).
//! - The same image keeps repeating over flat areas:
//!   - Use [`HeapImageSelector`] with a [`RandomHeapSelector`] to pick
//!     randomly among the best candidates, or [`DistanceHeapSelector`] to
//!     spread repeated candidates apart spatially.
//!
//! Local color histograms ([`Lch`]) score tiles by region (north, west,
//! south, east and optionally center) and usually give noticeably better
//! structure than a single global histogram, at roughly `n` times the
//! matching cost.

pub mod command;
pub mod compose;
pub mod distance;
pub mod divide;
pub mod heap;
pub mod histogram;
pub mod lch;
pub mod metric;
pub mod persist;
pub mod select;
pub mod storage;
pub mod variety;

use std::sync::{
    atomic::{
        AtomicUsize,
        Ordering,
    },
    mpsc,
};

use log::info;
use thiserror::Error;

pub use crate::{
    compose::{
        compose_mosaic,
        force_resize,
        interp_filter,
        FilterResizer,
        ImageCache,
        ImageResizer,
        ResizeStrategy,
    },
    distance::DistanceHeapSelector,
    divide::{
        extract_tiles,
        DivideMode,
        Divider,
        FixedNumDivider,
        FixedSizeDivider,
        Rect,
        TileDivision,
        Tiles,
    },
    heap::{
        ImageHeap,
        ImageHeapEntry,
    },
    histogram::{
        bin_index,
        build_all_histograms,
        build_histograms,
        gen_histogram,
        quantize_channel,
        Histogram,
    },
    lch::{
        build_all_lchs,
        build_lchs,
        gen_lch,
        lch_dist,
        FiveScheme,
        FourScheme,
        Lch,
        LchScheme,
    },
    metric::{
        get_metric,
        metric_names,
        register_metric,
        HistogramMetric,
    },
    select::{
        gch_selector,
        lch_selector,
        HistogramTileMetric,
        ImageSelector,
        LchTileMetric,
        MetricMinimizer,
        TileMetric,
    },
    storage::{
        id_list,
        FsImageDb,
        FsMapper,
        HistogramStorage,
        ImageConfig,
        ImageStorage,
        LchStorage,
        MemImageStorage,
        MemoryHistogramStorage,
        MemoryLchStorage,
    },
    variety::{
        compute_heaps,
        HeapImageSelector,
        HeapSelector,
        RandomHeapSelector,
    },
};

/// Identifies an image registered with an [`ImageStorage`]. Valid ids are
/// `0..num_images()`; [`NO_IMAGE_ID`] marks the absence of an image.
pub type ImageId = i64;

/// Sentinel id for "no image". Selection matrices carry this value in cells
/// for which no candidate could be chosen.
pub const NO_IMAGE_ID: ImageId = -1;

/// Capacity of the bounded outcome queues used by the parallel stages.
pub const BUFFER_SIZE: usize = 1000;

/// Default number of scaled images kept by the composer's [`ImageCache`].
pub const IMAGE_CACHE_SIZE: usize = 15;

/// The error type for all fallible tessella operations.
#[derive(Debug, Error)]
pub enum TessellaError {
    #[error("bad argument: {0}")]
    BadArgument(String),
    #[error("invalid {what} dimensions: {left} != {right}")]
    DimensionMismatch {
        what: &'static str,
        left: usize,
        right: usize,
    },
    #[error("no descriptor registered for image id {0}")]
    DescriptorMissing(ImageId),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("descriptor file error: {0}")]
    DescriptorFile(String),
    #[error("empty image: {0}")]
    EmptyImage(String),
    #[error("syntax error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, TessellaError>;

/// Optional progress callback, invoked on the driver thread after each
/// finished unit of work with the number of units finished so far.
pub type Progress<'a> = Option<&'a dyn Fn(usize)>;

/// Builds a progress callback that logs every `step` finished units as a
/// percentage of `total`. A `step` or `total` of zero disables the output.
pub fn progress_logger(prefix: String, total: usize, step: usize) -> impl Fn(usize) {
    move |num| {
        if step == 0 || total == 0 || num % step != 0 {
            return;
        }
        let percent = (num as f64 / total as f64 * 100.0).min(100.0);
        if prefix.is_empty() {
            info!("progress: {num} of {total} ({percent:.1}%)");
        } else {
            info!("{prefix}: {num} of {total} ({percent:.1}%)");
        }
    }
}

/// The default worker count for the parallel stages: twice the number of
/// logical CPUs.
pub fn default_routines() -> usize {
    (num_cpus::get() * 2).max(1)
}

/// Runs `num_jobs` jobs on `routines` worker threads and feeds every outcome
/// to `on_done` on the calling thread.
///
/// Workers pull job indices from a shared counter; outcomes travel through a
/// bounded channel. Exactly `num_jobs` outcomes are consumed, so `on_done`
/// sees every job exactly once regardless of worker scheduling. The job
/// index accompanies each outcome, which is what keeps output position `i`
/// tied to input position `i`.
pub(crate) fn run_queue<T, W, D>(num_jobs: usize, routines: usize, worker: W, mut on_done: D)
where
    T: Send,
    W: Fn(usize) -> T + Sync,
    D: FnMut(usize, T),
{
    if num_jobs == 0 {
        return;
    }
    let routines = routines.max(1).min(num_jobs);
    let next = AtomicUsize::new(0);
    let (done_tx, done_rx) = mpsc::sync_channel::<(usize, T)>(BUFFER_SIZE);
    std::thread::scope(|scope| {
        for _ in 0..routines {
            let done_tx = done_tx.clone();
            let next = &next;
            let worker = &worker;
            scope.spawn(move || loop {
                let pos = next.fetch_add(1, Ordering::Relaxed);
                if pos >= num_jobs {
                    break;
                }
                if done_tx.send((pos, worker(pos))).is_err() {
                    break;
                }
            });
        }
        drop(done_tx);
        for _ in 0..num_jobs {
            let Ok((pos, value)) = done_rx.recv() else {
                break;
            };
            on_done(pos, value);
        }
    });
}

/// Builds a rayon pool with exactly `routines` threads for the
/// fill-a-matrix stages.
pub(crate) fn sized_pool(routines: usize) -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(routines.max(1))
        .build()
        .expect("Failed to build worker pool")
}
