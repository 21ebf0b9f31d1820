//! Saving and loading descriptor files.
//!
//! Descriptors are stored per image path, not per id: ids are only dense
//! within one run, while paths survive restarts. A descriptor file carries
//! the crate version at save time, the shared `k`, and one entry per image
//! with a reserved checksum slot (empty string = no checksum).
//!
//! Two encodings are recognized, chosen by file extension: a binary
//! encoding for `.gob` files and JSON for `.json` files. Both serialize the
//! same data model, so a record written in one encoding and re-written in
//! the other keeps its logical content.

use std::{
    fs::File,
    io::{
        BufReader,
        BufWriter,
    },
    path::Path,
};

use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};

use crate::{
    histogram::Histogram,
    lch::Lch,
    storage::{
        FsMapper,
        HistogramStorage,
        LchStorage,
        MemoryHistogramStorage,
        MemoryLchStorage,
    },
    ImageId,
    Result,
    TessellaError,
};

/// The version string written into descriptor files.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The proposed file name for global histograms: `gch-<k>.<ext>`.
pub fn gch_file_name(k: u32, ext: &str) -> String {
    format!("gch-{}.{}", k, ext.trim_start_matches('.'))
}

/// The proposed file name for local histograms:
/// `lch-<scheme_size>-<k>.<ext>`.
pub fn lch_file_name(scheme_size: u32, k: u32, ext: &str) -> String {
    format!(
        "lch-{}-{}.{}",
        scheme_size,
        k,
        ext.trim_start_matches('.')
    )
}

fn write_by_extension<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "json" => {
            let file = BufWriter::new(File::create(path)?);
            serde_json::to_writer(file, value)
                .map_err(|err| TessellaError::DescriptorFile(err.to_string()))
        }
        "gob" => {
            let file = BufWriter::new(File::create(path)?);
            bincode::serialize_into(file, value)
                .map_err(|err| TessellaError::DescriptorFile(err.to_string()))
        }
        _ => Err(TessellaError::BadArgument(format!(
            "unknown descriptor file extension {ext:?}, expected \"gob\" or \"json\""
        ))),
    }
}

fn read_by_extension<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "json" => {
            let file = BufReader::new(File::open(path)?);
            serde_json::from_reader(file)
                .map_err(|err| TessellaError::DescriptorFile(err.to_string()))
        }
        "gob" => {
            let file = BufReader::new(File::open(path)?);
            bincode::deserialize_from(file)
                .map_err(|err| TessellaError::DescriptorFile(err.to_string()))
        }
        _ => Err(TessellaError::BadArgument(format!(
            "unknown descriptor file extension {ext:?}, expected \"gob\" or \"json\""
        ))),
    }
}

/// One stored global histogram together with the path of its image.
///
/// The checksum slot is reserved for change detection of the underlying
/// image; an empty string means no checksum was computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GchFileEntry {
    pub path: String,
    pub histogram: Histogram,
    pub checksum: String,
}

/// The on-disk container for global color histograms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GchFile {
    pub version: String,
    pub k: u32,
    pub entries: Vec<GchFileEntry>,
}

impl GchFile {
    /// Collects the histograms of `ids` from `storage`, storing each under
    /// the path the mapper has registered for it.
    pub fn from_storage(
        ids: &[ImageId],
        mapper: &FsMapper,
        storage: &dyn HistogramStorage,
    ) -> Result<GchFile> {
        let mut entries = Vec::with_capacity(ids.len());
        for &id in ids {
            let path = mapper
                .get_path(id)
                .ok_or(TessellaError::DescriptorMissing(id))?;
            entries.push(GchFileEntry {
                path: path.display().to_string(),
                histogram: storage.histogram(id)?.clone(),
                checksum: String::new(),
            });
        }
        Ok(GchFile {
            version: VERSION.to_string(),
            k: storage.divisions(),
            entries,
        })
    }

    /// Writes the container; the encoding follows the file extension.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        write_by_extension(self, path)
    }

    /// Reads a container; the encoding follows the file extension.
    pub fn read_file(path: &Path) -> Result<GchFile> {
        read_by_extension(path)
    }

    /// Matches the stored histograms against the images currently
    /// registered in `mapper` and builds the in-memory storage.
    ///
    /// Every registered image must have an entry with a histogram of the
    /// container's `k`, otherwise an error is returned.
    pub fn into_storage(self, mapper: &FsMapper) -> Result<MemoryHistogramStorage> {
        let k = self.k;
        let mut by_path: std::collections::HashMap<String, Histogram> = self
            .entries
            .into_iter()
            .map(|e| (e.path, e.histogram))
            .collect();
        let mut histograms = Vec::with_capacity(mapper.len());
        for path in mapper.paths() {
            let key = path.display().to_string();
            let hist = by_path.remove(&key).ok_or_else(|| {
                TessellaError::DescriptorFile(format!("no histogram stored for image {key:?}"))
            })?;
            if hist.k != k || hist.entries.len() != (k * k * k) as usize {
                return Err(TessellaError::DimensionMismatch {
                    what: "histogram",
                    left: hist.k as usize,
                    right: k as usize,
                });
            }
            histograms.push(hist);
        }
        Ok(MemoryHistogramStorage::new(histograms, k))
    }
}

/// One stored LCH together with the path of its image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LchFileEntry {
    pub path: String,
    pub lch: Lch,
    pub checksum: String,
}

/// The on-disk container for local color histograms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LchFile {
    pub version: String,
    pub k: u32,
    pub scheme_size: u32,
    pub entries: Vec<LchFileEntry>,
}

impl LchFile {
    /// Collects the LCHs of `ids` from `storage`, storing each under the
    /// path the mapper has registered for it.
    pub fn from_storage(
        ids: &[ImageId],
        mapper: &FsMapper,
        storage: &dyn LchStorage,
    ) -> Result<LchFile> {
        let mut entries = Vec::with_capacity(ids.len());
        for &id in ids {
            let path = mapper
                .get_path(id)
                .ok_or(TessellaError::DescriptorMissing(id))?;
            entries.push(LchFileEntry {
                path: path.display().to_string(),
                lch: storage.lch(id)?.clone(),
                checksum: String::new(),
            });
        }
        Ok(LchFile {
            version: VERSION.to_string(),
            k: storage.divisions(),
            scheme_size: storage.scheme_size(),
            entries,
        })
    }

    /// Writes the container; the encoding follows the file extension.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        write_by_extension(self, path)
    }

    /// Reads a container; the encoding follows the file extension.
    pub fn read_file(path: &Path) -> Result<LchFile> {
        read_by_extension(path)
    }

    /// Matches the stored LCHs against the images currently registered in
    /// `mapper` and builds the in-memory storage.
    pub fn into_storage(self, mapper: &FsMapper) -> Result<MemoryLchStorage> {
        let (k, scheme_size) = (self.k, self.scheme_size);
        let mut by_path: std::collections::HashMap<String, Lch> = self
            .entries
            .into_iter()
            .map(|e| (e.path, e.lch))
            .collect();
        let mut lchs = Vec::with_capacity(mapper.len());
        for path in mapper.paths() {
            let key = path.display().to_string();
            let lch = by_path.remove(&key).ok_or_else(|| {
                TessellaError::DescriptorFile(format!("no LCH stored for image {key:?}"))
            })?;
            if lch.size() != scheme_size as usize {
                return Err(TessellaError::DimensionMismatch {
                    what: "LCH",
                    left: lch.size(),
                    right: scheme_size as usize,
                });
            }
            lchs.push(lch);
        }
        Ok(MemoryLchStorage::new(lchs, k, scheme_size))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::histogram::bin_index;

    fn sample_gch_file() -> GchFile {
        let mut hist = Histogram::new(2);
        hist.entries[bin_index(1, 0, 0, 2)] = 0.25;
        hist.entries[bin_index(0, 1, 0, 2)] = 0.75;
        GchFile {
            version: VERSION.to_string(),
            k: 2,
            entries: vec![GchFileEntry {
                path: "/images/a.png".to_string(),
                histogram: hist,
                checksum: String::new(),
            }],
        }
    }

    fn sample_lch_file() -> LchFile {
        LchFile {
            version: VERSION.to_string(),
            k: 2,
            scheme_size: 4,
            entries: vec![LchFileEntry {
                path: "/images/a.png".to_string(),
                lch: Lch::new(vec![Histogram::new(2); 4]),
                checksum: String::new(),
            }],
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tessella-{}-{}", std::process::id(), name))
    }

    #[test]
    fn default_file_names() {
        assert_eq!(gch_file_name(8, "json"), "gch-8.json");
        assert_eq!(gch_file_name(16, ".gob"), "gch-16.gob");
        assert_eq!(lch_file_name(5, 8, "json"), "lch-5-8.json");
        assert_eq!(lch_file_name(4, 16, ".gob"), "lch-4-16.gob");
    }

    #[test]
    fn binary_round_trip() {
        let file = sample_gch_file();
        let path = temp_path("gch-roundtrip.gob");
        file.write_file(&path).unwrap();
        let loaded = GchFile::read_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(file, loaded);
    }

    #[test]
    fn json_round_trip() {
        let file = sample_gch_file();
        let path = temp_path("gch-roundtrip.json");
        file.write_file(&path).unwrap();
        let loaded = GchFile::read_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(file, loaded);
    }

    #[test]
    fn encodings_carry_the_same_content() {
        let file = sample_lch_file();
        let gob = temp_path("lch-cross.gob");
        let json = temp_path("lch-cross.json");
        file.write_file(&gob).unwrap();
        file.write_file(&json).unwrap();
        let from_gob = LchFile::read_file(&gob).unwrap();
        let from_json = LchFile::read_file(&json).unwrap();
        std::fs::remove_file(&gob).ok();
        std::fs::remove_file(&json).ok();
        assert_eq!(from_gob, from_json);
        assert_eq!(from_gob, file);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let file = sample_gch_file();
        assert!(matches!(
            file.write_file(Path::new("descriptors.xml")),
            Err(TessellaError::BadArgument(_))
        ));
        assert!(matches!(
            GchFile::read_file(Path::new("descriptors.xml")),
            Err(TessellaError::BadArgument(_))
        ));
    }

    #[test]
    fn storage_round_trip_through_mapper() {
        let mut mapper = FsMapper::new();
        mapper.register(PathBuf::from("/images/a.png"));
        let storage = sample_gch_file().into_storage(&mapper).unwrap();
        assert_eq!(storage.histograms.len(), 1);
        assert_eq!(storage.divisions(), 2);

        let rebuilt = GchFile::from_storage(&[0], &mapper, &storage).unwrap();
        assert_eq!(rebuilt.entries, sample_gch_file().entries);
    }

    #[test]
    fn missing_image_entry_fails() {
        let mut mapper = FsMapper::new();
        mapper.register(PathBuf::from("/images/other.png"));
        assert!(sample_gch_file().into_storage(&mapper).is_err());
    }

    #[test]
    fn wrong_k_fails() {
        let mut file = sample_gch_file();
        file.entries[0].histogram = Histogram::new(3);
        let mut mapper = FsMapper::new();
        mapper.register(PathBuf::from("/images/a.png"));
        assert!(matches!(
            file.into_storage(&mapper),
            Err(TessellaError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn lch_storage_round_trip() {
        let mut mapper = FsMapper::new();
        mapper.register(PathBuf::from("/images/a.png"));
        let storage = sample_lch_file().into_storage(&mapper).unwrap();
        assert_eq!(storage.scheme_size(), 4);
        let rebuilt = LchFile::from_storage(&[0], &mapper, &storage).unwrap();
        assert_eq!(rebuilt.entries, sample_lch_file().entries);
    }
}
