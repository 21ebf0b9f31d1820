//! Image databases and descriptor storages.
//!
//! Images live outside the process (usually on disk) and are identified by
//! dense [`ImageId`]s; descriptors (histograms, LCHs) are precomputed per id
//! and kept in memory. All storages are read-only while a query runs, so
//! they can be shared freely across worker threads.

use std::{
    collections::HashMap,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

use image::RgbaImage;
use log::info;

use crate::{
    histogram::Histogram,
    lch::Lch,
    ImageId,
    Result,
    TessellaError,
};

/// Width and height of an image, readable without decoding the pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageConfig {
    pub width: u32,
    pub height: u32,
}

/// A database of images, loaded on demand by id.
///
/// Valid ids are `0..num_images()`; access to any other id is an error, as
/// is a failure to read or decode the underlying data. Implementations must
/// be safe for concurrent reads.
pub trait ImageStorage: Sync {
    /// The number of registered images.
    fn num_images(&self) -> ImageId;

    /// Loads the image with the given id into memory.
    fn load_image(&self, id: ImageId) -> Result<RgbaImage>;

    /// Reads only the dimensions of the image with the given id.
    fn load_config(&self, id: ImageId) -> Result<ImageConfig>;
}

/// The list `[0, 1, ..., num_images - 1]`.
pub fn id_list(storage: &dyn ImageStorage) -> Vec<ImageId> {
    (0..storage.num_images()).collect()
}

/// Whether a file extension (without the dot) is a supported image format.
pub fn supported_extension(ext: &str) -> bool {
    ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") || ext.eq_ignore_ascii_case("png")
}

/// A bijective mapping between absolute image paths and image ids.
///
/// Descriptor files store paths, not ids, because ids are only dense within
/// one run: the mapper is what ties a loaded descriptor file back to the
/// current database.
#[derive(Debug, Default)]
pub struct FsMapper {
    name_mapping: HashMap<PathBuf, ImageId>,
    id_mapping: Vec<PathBuf>,
}

impl FsMapper {
    pub fn new() -> Self {
        FsMapper::default()
    }

    /// Removes all registered images.
    pub fn clear(&mut self) {
        self.name_mapping.clear();
        self.id_mapping.clear();
    }

    pub fn len(&self) -> usize {
        self.id_mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_mapping.is_empty()
    }

    pub fn num_images(&self) -> ImageId {
        self.id_mapping.len() as ImageId
    }

    /// The id registered for `path`, if any.
    pub fn get_id(&self, path: &Path) -> Option<ImageId> {
        self.name_mapping.get(path).copied()
    }

    /// The path registered under `id`, if any.
    pub fn get_path(&self, id: ImageId) -> Option<&Path> {
        if id < 0 {
            return None;
        }
        self.id_mapping.get(id as usize).map(PathBuf::as_path)
    }

    /// All registered paths in id order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.id_mapping.iter().map(PathBuf::as_path)
    }

    /// Registers a path and returns its new id, or `None` if the path is
    /// already registered. Paths should be absolute.
    pub fn register(&mut self, path: PathBuf) -> Option<ImageId> {
        if self.name_mapping.contains_key(&path) {
            return None;
        }
        let id = self.id_mapping.len() as ImageId;
        self.name_mapping.insert(path.clone(), id);
        self.id_mapping.push(path);
        Some(id)
    }

    /// Scans `dir` for supported images and registers them in filename
    /// order. With `recursive` sub-directories are scanned too. `filter`
    /// decides by extension (without the dot) which files qualify and
    /// defaults to jpg/jpeg/png.
    ///
    /// On an error some images may already have been registered.
    pub fn load(
        &mut self,
        dir: &Path,
        recursive: bool,
        filter: Option<fn(&str) -> bool>,
    ) -> Result<()> {
        let filter = filter.unwrap_or(supported_extension);
        let dir = fs::canonicalize(dir)?;
        self.load_dir(&dir, recursive, filter)
    }

    fn load_dir(&mut self, dir: &Path, recursive: bool, filter: fn(&str) -> bool) -> Result<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        // Directory iteration order is unspecified, ids must not be.
        entries.sort();
        for path in entries {
            if path.is_dir() {
                if recursive {
                    self.load_dir(&path, recursive, filter)?;
                }
                continue;
            }
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map(filter)
                .unwrap_or(false);
            if matches && self.register(path.clone()).is_none() {
                info!("image already registered: {}", path.display());
            }
        }
        Ok(())
    }

    /// The subset of `paths` that is not registered in this mapper, i.e.
    /// images that are gone from the database.
    pub fn gone<'a>(&self, paths: &'a [String]) -> Vec<&'a str> {
        paths
            .iter()
            .filter(|p| !self.name_mapping.contains_key(Path::new(p.as_str())))
            .map(String::as_str)
            .collect()
    }
}

/// An [`ImageStorage`] reading images from the filesystem on demand,
/// backed by an [`FsMapper`].
#[derive(Debug)]
pub struct FsImageDb<'a> {
    mapper: &'a FsMapper,
}

impl<'a> FsImageDb<'a> {
    pub fn new(mapper: &'a FsMapper) -> Self {
        FsImageDb { mapper }
    }

    fn path(&self, id: ImageId) -> Result<&Path> {
        self.mapper
            .get_path(id)
            .ok_or(TessellaError::DescriptorMissing(id))
    }
}

impl ImageStorage for FsImageDb<'_> {
    fn num_images(&self) -> ImageId {
        self.mapper.num_images()
    }

    fn load_image(&self, id: ImageId) -> Result<RgbaImage> {
        Ok(image::open(self.path(id)?)?.to_rgba8())
    }

    fn load_config(&self, id: ImageId) -> Result<ImageConfig> {
        let (width, height) = image::image_dimensions(self.path(id)?)?;
        Ok(ImageConfig { width, height })
    }
}

/// An [`ImageStorage`] over images already decoded in memory. Useful for
/// tests and for callers that produce their database programmatically.
#[derive(Debug, Default)]
pub struct MemImageStorage {
    images: Vec<RgbaImage>,
}

impl MemImageStorage {
    pub fn new(images: Vec<RgbaImage>) -> Self {
        MemImageStorage { images }
    }

    /// Adds an image and returns its id.
    pub fn push(&mut self, img: RgbaImage) -> ImageId {
        self.images.push(img);
        self.images.len() as ImageId - 1
    }
}

impl ImageStorage for MemImageStorage {
    fn num_images(&self) -> ImageId {
        self.images.len() as ImageId
    }

    fn load_image(&self, id: ImageId) -> Result<RgbaImage> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.images.get(i))
            .cloned()
            .ok_or(TessellaError::DescriptorMissing(id))
    }

    fn load_config(&self, id: ImageId) -> Result<ImageConfig> {
        let img = usize::try_from(id)
            .ok()
            .and_then(|i| self.images.get(i))
            .ok_or(TessellaError::DescriptorMissing(id))?;
        Ok(ImageConfig {
            width: img.width(),
            height: img.height(),
        })
    }
}

/// Maps image ids to histograms. Histograms are expected to be normalized.
///
/// Implementations must be safe for concurrent reads; descriptors are owned
/// by the storage and only borrowed by readers.
pub trait HistogramStorage: Sync {
    /// The histogram for a previously registered id.
    fn histogram(&self, id: ImageId) -> Result<&Histogram>;

    /// The number of sub-divisions `k` shared by all stored histograms.
    fn divisions(&self) -> u32;
}

/// A [`HistogramStorage`] keeping all histograms in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHistogramStorage {
    pub histograms: Vec<Histogram>,
    pub k: u32,
}

impl MemoryHistogramStorage {
    pub fn new(histograms: Vec<Histogram>, k: u32) -> Self {
        MemoryHistogramStorage { histograms, k }
    }
}

impl HistogramStorage for MemoryHistogramStorage {
    fn histogram(&self, id: ImageId) -> Result<&Histogram> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.histograms.get(i))
            .ok_or(TessellaError::DescriptorMissing(id))
    }

    fn divisions(&self) -> u32 {
        self.k
    }
}

/// Maps image ids to LCHs. See [`HistogramStorage`] for the sharing rules.
pub trait LchStorage: Sync {
    /// The LCH for a previously registered id.
    fn lch(&self, id: ImageId) -> Result<&Lch>;

    /// The number of sub-divisions `k` of the histograms inside every LCH.
    fn divisions(&self) -> u32;

    /// The number of histograms per LCH (4 or 5).
    fn scheme_size(&self) -> u32;
}

/// An [`LchStorage`] keeping all LCHs in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryLchStorage {
    pub lchs: Vec<Lch>,
    pub k: u32,
    pub scheme_size: u32,
}

impl MemoryLchStorage {
    pub fn new(lchs: Vec<Lch>, k: u32, scheme_size: u32) -> Self {
        MemoryLchStorage {
            lchs,
            k,
            scheme_size,
        }
    }
}

impl LchStorage for MemoryLchStorage {
    fn lch(&self, id: ImageId) -> Result<&Lch> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.lchs.get(i))
            .ok_or(TessellaError::DescriptorMissing(id))
    }

    fn divisions(&self) -> u32 {
        self.k
    }

    fn scheme_size(&self) -> u32 {
        self.scheme_size
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    #[test]
    fn mapper_assigns_dense_ids() {
        let mut mapper = FsMapper::new();
        assert_eq!(mapper.register(PathBuf::from("/a/1.png")), Some(0));
        assert_eq!(mapper.register(PathBuf::from("/a/2.png")), Some(1));
        assert_eq!(mapper.register(PathBuf::from("/a/1.png")), None);
        assert_eq!(mapper.len(), 2);
        assert_eq!(mapper.get_id(Path::new("/a/2.png")), Some(1));
        assert_eq!(mapper.get_path(0), Some(Path::new("/a/1.png")));
        assert_eq!(mapper.get_path(-1), None);
        assert_eq!(mapper.get_path(5), None);
    }

    #[test]
    fn mapper_gone_reports_unregistered_paths() {
        let mut mapper = FsMapper::new();
        mapper.register(PathBuf::from("/a/1.png"));
        let paths = vec!["/a/1.png".to_string(), "/a/old.png".to_string()];
        assert_eq!(mapper.gone(&paths), vec!["/a/old.png"]);
    }

    #[test]
    fn supported_extensions() {
        assert!(supported_extension("jpg"));
        assert!(supported_extension("JPEG"));
        assert!(supported_extension("png"));
        assert!(!supported_extension("gif"));
        assert!(!supported_extension("txt"));
    }

    #[test]
    fn mem_storage_bounds_checks() {
        let mut storage = MemImageStorage::default();
        let id = storage.push(RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 255])));
        assert_eq!(id, 0);
        assert_eq!(storage.num_images(), 1);
        let config = storage.load_config(0).unwrap();
        assert_eq!((config.width, config.height), (3, 2));
        assert!(storage.load_image(1).is_err());
        assert!(storage.load_image(-1).is_err());
    }

    #[test]
    fn histogram_storage_lookup() {
        let storage = MemoryHistogramStorage::new(vec![Histogram::new(2)], 2);
        assert!(storage.histogram(0).is_ok());
        assert!(matches!(
            storage.histogram(1),
            Err(TessellaError::DescriptorMissing(1))
        ));
        assert_eq!(storage.divisions(), 2);
    }
}
