//! The interactive command surface: a line tokenizer, the executor state
//! shared by all commands, the command set, and the REPL / script drivers.
//!
//! A command line has the form `COMMAND ARG1 ... ARGN`. Arguments may be
//! quoted (`"two words"`) and both `\` and `"` can be escaped with a
//! backslash; any other escape is a syntax error.

use std::{
    collections::BTreeMap,
    fs,
    io::{
        self,
        BufRead,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
    time::Instant,
};

use image::DynamicImage;
use strum::{
    Display,
    EnumString,
};

use crate::{
    compose::{
        compose_mosaic,
        force_resize,
        interp_name,
        FilterResizer,
    },
    divide::{
        Divider,
        FixedNumDivider,
        Rect,
        TileDivision,
    },
    histogram::build_all_histograms,
    lch::{
        build_all_lchs,
        FiveScheme,
        FourScheme,
        LchScheme,
    },
    metric::{
        get_metric,
        metric_names,
        HistogramMetric,
    },
    persist::{
        gch_file_name,
        lch_file_name,
        GchFile,
        LchFile,
    },
    select::{
        gch_selector,
        lch_selector,
        ImageSelector,
    },
    storage::{
        id_list,
        supported_extension,
        FsImageDb,
        FsMapper,
        LchStorage,
        MemoryHistogramStorage,
        MemoryLchStorage,
    },
    variety::random_heap_selector,
    default_routines,
    Progress,
    Result,
    TessellaError,
    IMAGE_CACHE_SIZE,
};

/// Splits a command line into tokens.
///
/// The tokenizer is a five-state automaton: outside any token, inside an
/// unquoted token, inside a quoted token, and the two escape states reached
/// by `\`. Quoted tokens end at the closing `"`, unquoted tokens at a
/// space. A `"` inside an unquoted token is an error, as is an unfinished
/// escape or quote at the end of the line; a trailing unquoted token is
/// accepted as is.
pub fn parse_command_line(line: &str) -> Result<Vec<String>> {
    enum State {
        Outside,
        Unquoted,
        EscapeUnquoted,
        Quoted,
        EscapeQuoted,
    }

    let syntax = |what: &str| TessellaError::Parse(format!("error parsing command line: {what}"));

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut state = State::Outside;
    for c in line.chars() {
        match state {
            State::Outside => match c {
                ' ' => {}
                '\\' => state = State::EscapeUnquoted,
                '"' => state = State::Quoted,
                _ => {
                    current.push(c);
                    state = State::Unquoted;
                }
            },
            State::Unquoted => match c {
                ' ' => {
                    tokens.push(std::mem::take(&mut current));
                    state = State::Outside;
                }
                '\\' => state = State::EscapeUnquoted,
                '"' => return Err(syntax("quote inside unquoted argument")),
                _ => current.push(c),
            },
            State::EscapeUnquoted => match c {
                '\\' | '"' => {
                    current.push(c);
                    state = State::Unquoted;
                }
                _ => return Err(syntax("invalid escape sequence")),
            },
            State::Quoted => match c {
                '"' => {
                    tokens.push(std::mem::take(&mut current));
                    state = State::Outside;
                }
                '\\' => state = State::EscapeQuoted,
                _ => current.push(c),
            },
            State::EscapeQuoted => match c {
                '\\' | '"' => {
                    current.push(c);
                    state = State::Quoted;
                }
                _ => return Err(syntax("invalid escape sequence")),
            },
        }
    }
    match state {
        State::Outside | State::Unquoted => {
            if !current.is_empty() {
                tokens.push(current);
            }
            Ok(tokens)
        }
        State::EscapeUnquoted | State::EscapeQuoted => Err(syntax("unfinished escape sequence")),
        State::Quoted => Err(syntax("unclosed quote")),
    }
}

/// How the final image per tile is chosen among the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum Variety {
    /// Always the best-scoring candidate.
    None,
    /// A random pick among the best candidates of each tile.
    Random,
}

/// The state shared by all commands of one shell or script run.
pub struct ExecutorState {
    /// The current directory, always an absolute path.
    pub working_dir: PathBuf,
    /// The registered database images.
    pub mapper: FsMapper,
    /// Global histograms; invalidated whenever the database changes.
    pub gch_storage: Option<MemoryHistogramStorage>,
    /// Local histograms; invalidated whenever the database changes.
    pub lch_storage: Option<MemoryLchStorage>,
    /// Worker count for all parallel stages, at least 1.
    pub routines: usize,
    /// Print detailed output and progress.
    pub verbose: bool,
    /// Whether the output division cuts surplus pixels instead of widening
    /// the last row / column.
    pub cut: bool,
    /// JPEG encode quality between 1 and 100.
    pub jpeg_quality: u8,
    /// Interpolation quality between 0 and 5.
    pub interp: u32,
    /// Number of scaled images cached during composition, 0 = default.
    pub cache_size: usize,
    /// Selection behaviour among the best candidates.
    pub variety: Variety,
    /// Fraction (0, 1] of the database considered per tile by the variety
    /// selectors.
    pub best_fit: f64,
}

impl ExecutorState {
    pub fn new() -> Result<Self> {
        Ok(ExecutorState {
            working_dir: std::env::current_dir()?,
            mapper: FsMapper::new(),
            gch_storage: None,
            lch_storage: None,
            routines: default_routines(),
            verbose: true,
            cut: false,
            jpeg_quality: 100,
            interp: 5,
            cache_size: IMAGE_CACHE_SIZE,
            variety: Variety::None,
            best_fit: 0.05,
        })
    }

    /// Resolves a user-entered path: `~` expands to the home directory and
    /// relative paths are joined onto the working directory.
    pub fn get_path(&self, path: &str) -> PathBuf {
        let expanded = expand_home(path);
        if expanded.is_absolute() {
            expanded
        } else {
            self.working_dir.join(expanded)
        }
    }

    /// The heap bound for the variety selectors: `best_fit` of the database
    /// size, clamped to `[1, num_images]`.
    pub fn best_fit_images(&self, num_images: usize) -> usize {
        ((num_images as f64 * self.best_fit) as usize).clamp(1, num_images.max(1))
    }
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.to_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(TessellaError::BadArgument(format!(
            "expected true or false, got {s:?}"
        ))),
    }
}

/// Parses `"AxB"` into two dimensions, both required.
pub fn parse_dimensions(s: &str) -> Result<(u32, u32)> {
    let bad = || TessellaError::BadArgument(format!("invalid dimension format {s:?}, expected \"AxB\""));
    let (first, second) = s.split_once('x').ok_or_else(bad)?;
    if second.contains('x') {
        return Err(bad());
    }
    let width = first.trim().parse().map_err(|_| bad())?;
    let height = second.trim().parse().map_err(|_| bad())?;
    Ok((width, height))
}

/// Parses `"AxB"` where either side may be empty: `"1024x"`, `"x768"` and
/// `"x"` are all valid. Empty sides come back as `None`.
pub fn parse_dimensions_empty(s: &str) -> Result<(Option<u32>, Option<u32>)> {
    let bad = || TessellaError::BadArgument(format!("invalid dimension format {s:?}, expected \"AxB\""));
    let (first, second) = s.split_once('x').ok_or_else(bad)?;
    if second.contains('x') {
        return Err(bad());
    }
    let parse_side = |side: &str| -> Result<Option<u32>> {
        let side = side.trim();
        if side.is_empty() {
            Ok(None)
        } else {
            side.parse().map(Some).map_err(|_| bad())
        }
    };
    Ok((parse_side(first)?, parse_side(second)?))
}

/// Parses a percentage, either with a `%` suffix (`"50%"` → 0.5) or as a
/// plain fraction (`"0.5"`). The result must lie in (0, 1].
pub fn parse_percent(s: &str) -> Result<f64> {
    let s = s.trim();
    let value = if let Some(number) = s.strip_suffix('%') {
        number
            .trim()
            .parse::<f64>()
            .map_err(|_| TessellaError::BadArgument(format!("invalid percent value {s:?}")))?
            / 100.0
    } else {
        s.parse::<f64>()
            .map_err(|_| TessellaError::BadArgument(format!("invalid percent value {s:?}")))?
    };
    if value <= 0.0 || value > 1.0 {
        return Err(TessellaError::BadArgument(format!(
            "percent value must be in (0, 100], got {s:?}"
        )));
    }
    Ok(value)
}

/// The height matching `width` under the aspect ratio of the original.
pub fn keep_ratio_height(original_width: u32, original_height: u32, width: u32) -> u32 {
    (original_height as f64 / original_width as f64 * width as f64) as u32
}

/// The width matching `height` under the aspect ratio of the original.
pub fn keep_ratio_width(original_width: u32, original_height: u32, height: u32) -> u32 {
    (original_width as f64 / original_height as f64 * height as f64) as u32
}

/// A named command: the function, a usage line and a description.
pub struct Command {
    pub exec: fn(&mut ExecutorState, &[String]) -> Result<()>,
    pub usage: &'static str,
    pub description: &'static str,
}

/// The built-in command set, keyed by command name.
pub fn default_commands() -> BTreeMap<&'static str, Command> {
    let mut map = BTreeMap::new();
    map.insert(
        "pwd",
        Command {
            exec: cmd_pwd,
            usage: "pwd",
            description: "Show the current working directory.",
        },
    );
    map.insert(
        "cd",
        Command {
            exec: cmd_cd,
            usage: "cd <dir>",
            description: "Change the working directory.",
        },
    );
    map.insert(
        "stats",
        Command {
            exec: cmd_stats,
            usage: "stats [var]",
            description: "Show the configuration variables (or a single one) that can be changed via set.",
        },
    );
    map.insert(
        "set",
        Command {
            exec: cmd_set,
            usage: "set <variable> <value>",
            description: "Set a configuration variable; stats lists them.",
        },
    );
    map.insert(
        "storage",
        Command {
            exec: cmd_storage,
            usage: "storage [list] or storage load [dir [recursive]]",
            description: "Manage the database images. Without arguments the number of \
                          registered images is printed, \"list\" prints every path. \
                          \"load\" replaces the database with the images found in the \
                          given directory (the working directory if omitted); previously \
                          computed histograms become invalid.",
        },
    );
    map.insert(
        "gch",
        Command {
            exec: cmd_gch,
            usage: "gch create [k] or gch save <path> or gch load <path>",
            description: "Manage global color histograms. \"create\" computes them for \
                          every database image (k between 1 and 256, default 8), \
                          \"save\" and \"load\" exchange them with descriptor files \
                          (.gob or .json).",
        },
    );
    map.insert(
        "lch",
        Command {
            exec: cmd_lch,
            usage: "lch create <k> <scheme> or lch save <path> or lch load <path>",
            description: "Manage local color histograms. \"create\" computes them for \
                          every database image; scheme is the number of regions per \
                          image, 4 or 5. \"save\" and \"load\" work as for gch.",
        },
    );
    map.insert(
        "mosaic",
        Command {
            exec: cmd_mosaic,
            usage: "mosaic <in> <out> <metric> <tilesXxtilesY> [dimension]",
            description: "Create a mosaic for the query image <in> and save it as <out>. \
                          metric selects the descriptor and distance, e.g. \"gch\", \
                          \"gch-cosine\" or \"lch-manhattan\". tiles gives the tile grid, \
                          e.g. \"30x20\". dimension sets the output size; \"1024x768\", \
                          \"1024x\", \"x768\" and \"x\" are all valid, missing values keep \
                          the aspect ratio of the query.",
        },
    );
    map
}

fn syntax_error() -> TessellaError {
    TessellaError::BadArgument("invalid command syntax".to_string())
}

fn cmd_pwd(state: &mut ExecutorState, _args: &[String]) -> Result<()> {
    println!("{}", state.working_dir.display());
    Ok(())
}

fn cmd_cd(state: &mut ExecutorState, args: &[String]) -> Result<()> {
    if args.len() != 1 {
        return Err(syntax_error());
    }
    let path = expand_home(&args[0]);
    let path = if path.is_absolute() {
        path
    } else {
        state.working_dir.join(path)
    };
    let meta = fs::metadata(&path)?;
    if !meta.is_dir() {
        return Err(TessellaError::BadArgument(format!(
            "not a directory: {}",
            path.display()
        )));
    }
    state.working_dir = fs::canonicalize(path)?;
    Ok(())
}

fn cmd_stats(state: &mut ExecutorState, args: &[String]) -> Result<()> {
    let values: BTreeMap<&str, String> = BTreeMap::from([
        ("routines", state.routines.to_string()),
        ("verbose", state.verbose.to_string()),
        ("cut", state.cut.to_string()),
        ("jpeg-quality", state.jpeg_quality.to_string()),
        (
            "interp",
            format!("{} ({})", state.interp, interp_name(state.interp)),
        ),
        ("cache", state.cache_size.to_string()),
        ("variety", state.variety.to_string()),
        ("best", format!("{:.2} %", state.best_fit * 100.0)),
    ]);
    match args {
        [] => {
            for (name, value) in &values {
                println!("{name} ==> {value}");
            }
        }
        [name] => match values.get(name.as_str()) {
            Some(value) => println!("{name} ==> {value}"),
            None => {
                return Err(TessellaError::BadArgument(format!(
                    "unknown variable {name:?}"
                )))
            }
        },
        _ => return Err(syntax_error()),
    }
    Ok(())
}

fn cmd_set(state: &mut ExecutorState, args: &[String]) -> Result<()> {
    let [name, value] = args else {
        return Err(syntax_error());
    };
    match name.as_str() {
        "routines" => {
            let parsed: usize = value.parse().map_err(|_| {
                TessellaError::BadArgument(format!("routines must be a positive int, got {value:?}"))
            })?;
            if parsed == 0 {
                return Err(TessellaError::BadArgument(
                    "routines must be a positive int".to_string(),
                ));
            }
            state.routines = parsed;
        }
        "verbose" => state.verbose = parse_bool(value)?,
        "cut" => state.cut = parse_bool(value)?,
        "jpeg-quality" => {
            let parsed: u8 = value.parse().map_err(|_| {
                TessellaError::BadArgument(format!(
                    "jpeg-quality must be an int between 1 and 100, got {value:?}"
                ))
            })?;
            if !(1..=100).contains(&parsed) {
                return Err(TessellaError::BadArgument(format!(
                    "jpeg-quality must be an int between 1 and 100, got {parsed}"
                )));
            }
            state.jpeg_quality = parsed;
        }
        "interp" => {
            let parsed: u32 = value.parse().map_err(|_| {
                TessellaError::BadArgument(format!("interp must be an int >= 0, got {value:?}"))
            })?;
            state.interp = parsed.min(5);
        }
        "cache" => {
            state.cache_size = value.parse().map_err(|_| {
                TessellaError::BadArgument(format!("cache must be an int >= 0, got {value:?}"))
            })?;
        }
        "variety" => {
            state.variety = value.parse().map_err(|_| {
                TessellaError::BadArgument(format!(
                    "variety must be \"none\" or \"random\", got {value:?}"
                ))
            })?;
        }
        "best" => state.best_fit = parse_percent(value)?,
        _ => {
            return Err(TessellaError::BadArgument(format!(
                "unknown variable {name:?}, use \"stats\" for a list"
            )))
        }
    }
    Ok(())
}

fn cmd_storage(state: &mut ExecutorState, args: &[String]) -> Result<()> {
    match args.first().map(String::as_str) {
        None => {
            println!("Number of database images: {}", state.mapper.len());
            Ok(())
        }
        Some("list") => {
            for path in state.mapper.paths() {
                println!("  {}", path.display());
            }
            println!("Total: {}", state.mapper.len());
            Ok(())
        }
        Some("load") => {
            let dir = match args.get(1) {
                Some(arg) => state.get_path(arg),
                None => state.working_dir.clone(),
            };
            let recursive = match args.get(2) {
                Some(arg) => parse_bool(arg)?,
                None => false,
            };
            println!("Loading images from {}", dir.display());
            if recursive {
                println!("Recursive mode enabled");
            }
            state.mapper.clear();
            state.gch_storage = None;
            state.lch_storage = None;
            if let Err(err) = state.mapper.load(&dir, recursive, None) {
                state.mapper.clear();
                return Err(err);
            }
            println!("Successfully read {} images", state.mapper.len());
            println!("Don't forget to (re)load precomputed data if required!");
            Ok(())
        }
        Some(_) => Err(syntax_error()),
    }
}

fn parse_k(value: &str) -> Result<u32> {
    let parsed: i64 = value
        .parse()
        .map_err(|_| TessellaError::BadArgument(format!("k must be an int, got {value:?}")))?;
    if !(1..=256).contains(&parsed) {
        return Err(TessellaError::BadArgument(format!(
            "k must be a value between 1 and 256, got {parsed}"
        )));
    }
    Ok(parsed as u32)
}

fn verbose_progress(total: usize) -> impl Fn(usize) {
    let step = (total / 10).min(100);
    move |num| {
        if step > 0 && num % step == 0 {
            let percent = (num as f64 / total as f64 * 100.0).min(100.0);
            println!("{num} of {total} ({percent:.1}%)");
        }
    }
}

fn cmd_gch(state: &mut ExecutorState, args: &[String]) -> Result<()> {
    match args.first().map(String::as_str) {
        Some("create") => {
            let k = match args.get(1) {
                Some(value) => parse_k(value)?,
                None => 8,
            };
            println!(
                "Creating histograms for all images in storage with k = {k} sub-divisions"
            );
            let db = FsImageDb::new(&state.mapper);
            let total = state.mapper.len();
            let printer = verbose_progress(total);
            let progress: Progress<'_> = if state.verbose { Some(&printer) } else { None };
            let start = Instant::now();
            let histograms = build_all_histograms(&db, true, k, state.routines, progress)?;
            println!(
                "Computed {} histograms in {:?}",
                histograms.len(),
                start.elapsed()
            );
            state.gch_storage = Some(MemoryHistogramStorage::new(histograms, k));
            Ok(())
        }
        Some("save") => {
            let storage = state
                .gch_storage
                .as_ref()
                .ok_or_else(|| TessellaError::BadArgument("no GCHs loaded yet".to_string()))?;
            let arg = args.get(1).ok_or_else(syntax_error)?;
            let mut path = state.get_path(arg);
            if path.is_dir() {
                path = path.join(gch_file_name(storage.k, "gob"));
            }
            let db = FsImageDb::new(&state.mapper);
            let file = GchFile::from_storage(&id_list(&db), &state.mapper, storage)?;
            file.write_file(&path)?;
            println!(
                "Successfully wrote {} histograms to {}",
                file.entries.len(),
                path.display()
            );
            Ok(())
        }
        Some("load") => {
            let arg = args.get(1).ok_or_else(syntax_error)?;
            let path = state.get_path(arg);
            let file = GchFile::read_file(&path)?;
            println!("Read {} histograms", file.entries.len());
            if file.entries.len() != state.mapper.len() {
                println!(
                    "Unmatched number of images in storage and loaded histograms. \
                     Have the images changed? In this case the histograms must be re-computed."
                );
            }
            state.gch_storage = Some(file.into_storage(&state.mapper)?);
            println!("Histograms have been mapped to the image storage.");
            Ok(())
        }
        _ => Err(syntax_error()),
    }
}

fn scheme_for(size: u32) -> Result<Box<dyn LchScheme>> {
    match size {
        4 => Ok(Box::new(FourScheme)),
        5 => Ok(Box::new(FiveScheme)),
        _ => Err(TessellaError::BadArgument(format!(
            "invalid scheme size {size}, supported are 4 and 5"
        ))),
    }
}

fn cmd_lch(state: &mut ExecutorState, args: &[String]) -> Result<()> {
    match args.first().map(String::as_str) {
        Some("create") => {
            let (Some(k_arg), Some(scheme_arg)) = (args.get(1), args.get(2)) else {
                return Err(syntax_error());
            };
            let k = parse_k(k_arg)?;
            let scheme_size: u32 = scheme_arg.parse().map_err(|_| {
                TessellaError::BadArgument(format!("scheme must be an int, got {scheme_arg:?}"))
            })?;
            let scheme = scheme_for(scheme_size)?;
            println!(
                "Creating LCHs for all images in storage with k = {k} sub-divisions and {scheme_size} parts"
            );
            let db = FsImageDb::new(&state.mapper);
            let total = state.mapper.len();
            let printer = verbose_progress(total);
            let progress: Progress<'_> = if state.verbose { Some(&printer) } else { None };
            let start = Instant::now();
            let lchs = build_all_lchs(scheme.as_ref(), &db, true, k, state.routines, progress)?;
            println!("Computed {} LCHs in {:?}", lchs.len(), start.elapsed());
            state.lch_storage = Some(MemoryLchStorage::new(lchs, k, scheme_size));
            Ok(())
        }
        Some("save") => {
            let storage = state
                .lch_storage
                .as_ref()
                .ok_or_else(|| TessellaError::BadArgument("no LCHs loaded yet".to_string()))?;
            let arg = args.get(1).ok_or_else(syntax_error)?;
            let mut path = state.get_path(arg);
            if path.is_dir() {
                path = path.join(lch_file_name(storage.scheme_size, storage.k, "gob"));
            }
            let db = FsImageDb::new(&state.mapper);
            let file = LchFile::from_storage(&id_list(&db), &state.mapper, storage)?;
            file.write_file(&path)?;
            println!(
                "Successfully wrote {} LCHs to {}",
                file.entries.len(),
                path.display()
            );
            Ok(())
        }
        Some("load") => {
            let arg = args.get(1).ok_or_else(syntax_error)?;
            let path = state.get_path(arg);
            let file = LchFile::read_file(&path)?;
            println!("Read {} LCHs", file.entries.len());
            if file.entries.len() != state.mapper.len() {
                println!(
                    "Unmatched number of images in storage and loaded LCHs. \
                     Have the images changed? In this case the LCHs must be re-computed."
                );
            }
            state.lch_storage = Some(file.into_storage(&state.mapper)?);
            println!("LCHs have been mapped to the image storage.");
            Ok(())
        }
        _ => Err(syntax_error()),
    }
}

/// Extracts the metric name from a tag like `gch`, `gch-cosine` or
/// `lch-manhattan`; the bare tag selects the euclidean distance.
fn parse_metric_tag(tag: &str, prefix: &str) -> Result<HistogramMetric> {
    let name = if tag == prefix {
        "euclid"
    } else {
        tag.strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('-'))
            .ok_or_else(|| {
                TessellaError::BadArgument(format!(
                    "invalid metric tag {tag:?}, expected \"{prefix}\" or \"{prefix}-<metric>\""
                ))
            })?
    };
    get_metric(name).ok_or_else(|| {
        TessellaError::BadArgument(format!(
            "unknown metric {name:?}, available: {}",
            metric_names().join(" ")
        ))
    })
}

/// Saves the image as JPEG (honoring the configured quality) or PNG,
/// decided by the file extension.
fn save_image(path: &Path, img: &image::RgbaImage, jpeg_quality: u8) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => {
            let file = io::BufWriter::new(fs::File::create(path)?);
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(file, jpeg_quality);
            let rgb = DynamicImage::ImageRgba8(img.clone()).into_rgb8();
            rgb.write_with_encoder(encoder)?;
            Ok(())
        }
        "png" => {
            img.save(path)?;
            Ok(())
        }
        _ => Err(TessellaError::BadArgument(format!(
            "unsupported output file type {ext:?}, expected .jpg or .png"
        ))),
    }
}

fn cmd_mosaic(state: &mut ExecutorState, args: &[String]) -> Result<()> {
    if state.mapper.is_empty() {
        return Err(TessellaError::BadArgument(
            "no images in storage, use \"storage load\"".to_string(),
        ));
    }
    if args.len() < 4 {
        return Err(syntax_error());
    }
    let total_start = Instant::now();
    let out_path = state.get_path(&args[1]);
    let out_supported = out_path
        .extension()
        .and_then(|e| e.to_str())
        .map(supported_extension)
        .unwrap_or(false);
    if !out_supported {
        return Err(TessellaError::BadArgument(format!(
            "supported output files are .jpg and .png, got {}",
            args[1]
        )));
    }

    let tag = args[2].as_str();
    let use_gch = match tag.split('-').next() {
        Some("gch") => true,
        Some("lch") => false,
        _ => {
            return Err(TessellaError::BadArgument(format!(
                "invalid image selector {tag:?}, expected gch or lch"
            )))
        }
    };
    if use_gch && state.gch_storage.is_none() {
        return Err(TessellaError::BadArgument(
            "no GCH data loaded, use \"gch create\" or \"gch load\"".to_string(),
        ));
    }
    if !use_gch && state.lch_storage.is_none() {
        return Err(TessellaError::BadArgument(
            "no LCH data loaded, use \"lch create\" or \"lch load\"".to_string(),
        ));
    }

    let (tiles_x, tiles_y) = parse_dimensions(&args[3])?;
    if tiles_x == 0 || tiles_y == 0 {
        return Err(TessellaError::BadArgument(format!(
            "tile dimensions are not allowed to be empty, got {}",
            args[3]
        )));
    }

    let in_path = state.get_path(&args[0]);
    if state.verbose {
        println!("Reading image {}", in_path.display());
    }
    let query = image::open(&in_path)?.to_rgba8();
    let (query_width, query_height) = query.dimensions();
    if query_width == 0 || query_height == 0 {
        return Err(TessellaError::EmptyImage("query image is empty".to_string()));
    }

    let (mosaic_width, mosaic_height) = match args.get(4) {
        Some(dim) => {
            let (width, height) = parse_dimensions_empty(dim)?;
            match (width, height) {
                (None, None) => (query_width, query_height),
                (Some(w), None) => (w, keep_ratio_height(query_width, query_height, w)),
                (None, Some(h)) => (keep_ratio_width(query_width, query_height, h), h),
                (Some(w), Some(h)) => (w, h),
            }
        }
        None => (query_width, query_height),
    };
    if mosaic_width == 0 || mosaic_height == 0 {
        return Err(TessellaError::EmptyImage(format!(
            "mosaic image would be empty, dimensions {mosaic_width}x{mosaic_height}"
        )));
    }

    let division =
        FixedNumDivider::new(tiles_x, tiles_y, true).divide(Rect::from_size(query_width, query_height));
    let num_tiles: usize = division.iter().map(Vec::len).sum();
    let printer = verbose_progress(num_tiles);
    let progress: Progress<'_> = if state.verbose { Some(&printer) } else { None };

    if state.verbose {
        println!();
        println!("Selecting database images for tiles");
    }
    let db = FsImageDb::new(&state.mapper);
    let start = Instant::now();
    let selection = run_selection(state, &db, &query, &division, tag, use_gch, progress)?;
    if state.verbose {
        println!("Selection took {:?}", start.elapsed());
        println!();
        println!("Composing mosaic");
    }

    let start = Instant::now();
    let output_division = FixedNumDivider::new(tiles_x, tiles_y, state.cut)
        .divide(Rect::from_size(mosaic_width, mosaic_height));
    let resizer = FilterResizer::from_quality(state.interp);
    let mosaic = compose_mosaic(
        &db,
        &selection,
        &output_division,
        &resizer,
        force_resize,
        state.routines,
        state.cache_size,
        progress,
    )?;
    if state.verbose {
        println!("Composition took {:?}", start.elapsed());
        println!();
        println!("Saving image");
    }
    save_image(&out_path, &mosaic, state.jpeg_quality)?;
    println!("Mosaic saved to {}", out_path.display());
    if state.verbose {
        println!();
        println!("Total creation time: {:?}", total_start.elapsed());
    }
    Ok(())
}

fn run_selection(
    state: &ExecutorState,
    db: &FsImageDb<'_>,
    query: &image::RgbaImage,
    division: &TileDivision,
    tag: &str,
    use_gch: bool,
    progress: Progress<'_>,
) -> Result<Vec<Vec<crate::ImageId>>> {
    let routines = state.routines;
    let num_images = state.mapper.len();
    if use_gch {
        let storage = state
            .gch_storage
            .as_ref()
            .ok_or_else(|| TessellaError::BadArgument("no GCH data loaded".to_string()))?;
        let metric = parse_metric_tag(tag, "gch")?;
        match state.variety {
            Variety::None => {
                let mut selector = gch_selector(storage, metric, routines);
                selector.init(db)?;
                selector.select(db, query, division, progress)
            }
            Variety::Random => {
                let tile_metric = crate::select::HistogramTileMetric::new(storage, metric, routines);
                let bound = state.best_fit_images(num_images);
                let mut selector = random_heap_selector(tile_metric, bound, routines);
                selector.init(db)?;
                selector.select(db, query, division, progress)
            }
        }
    } else {
        let storage = state
            .lch_storage
            .as_ref()
            .ok_or_else(|| TessellaError::BadArgument("no LCH data loaded".to_string()))?;
        let metric = parse_metric_tag(tag, "lch")?;
        let scheme = scheme_for(storage.scheme_size())?;
        match state.variety {
            Variety::None => {
                let mut selector = lch_selector(storage, scheme, metric, routines);
                selector.init(db)?;
                selector.select(db, query, division, progress)
            }
            Variety::Random => {
                let tile_metric =
                    crate::select::LchTileMetric::new(storage, scheme, metric, routines);
                let bound = state.best_fit_images(num_images);
                let mut selector = random_heap_selector(tile_metric, bound, routines);
                selector.init(db)?;
                selector.select(db, query, division, progress)
            }
        }
    }
}

/// Substitutes `$1` … `$N` in a script line with the given arguments.
/// Higher indices are replaced first so `$12` is never mistaken for `$1`.
pub fn parameterize(line: &str, args: &[String]) -> String {
    let mut res = line.to_string();
    for i in (1..=args.len()).rev() {
        res = res.replace(&format!("${i}"), &args[i - 1]);
    }
    res
}

/// Runs the interactive shell on stdin until end of input or `exit`.
/// Errors are printed together with the command usage, execution continues.
pub fn run_repl() -> Result<()> {
    let commands = default_commands();
    let mut state = ExecutorState::new()?;
    println!("Welcome to the tessella mosaic generator");
    println!("Type \"help\" if you don't know what to do");
    let stdin = io::stdin();
    print!(">>> ");
    io::stdout().flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        if !execute_line(&mut state, &commands, &line, true) {
            return Ok(());
        }
        print!(">>> ");
        io::stdout().flush()?;
    }
    Ok(())
}

/// Runs every line of a script, substituting `$1` … `$N` with `args`.
/// The first failing line terminates the run with its error.
pub fn run_script(source: &str, args: &[String]) -> Result<()> {
    let commands = default_commands();
    let mut state = ExecutorState::new()?;
    for line in source.lines() {
        let line = parameterize(line, args);
        if let Err(err) = execute_script_line(&mut state, &commands, &line) {
            return Err(err);
        }
    }
    Ok(())
}

/// Reads a script from a file and runs it, see [`run_script`].
pub fn run_script_file(path: &Path, args: &[String]) -> Result<()> {
    let source = fs::read_to_string(path)?;
    run_script(&source, args)
}

/// Executes one REPL line; `interactive` keeps the loop alive on errors.
/// Returns `false` when the shell should exit.
fn execute_line(
    state: &mut ExecutorState,
    commands: &BTreeMap<&'static str, Command>,
    line: &str,
    interactive: bool,
) -> bool {
    let tokens = match parse_command_line(line) {
        Ok(tokens) => tokens,
        Err(err) => {
            println!("{err}");
            return interactive;
        }
    };
    let Some((name, args)) = tokens.split_first() else {
        return true;
    };
    match name.as_str() {
        "exit" => {
            println!("Exiting tessella. Good bye!");
            return false;
        }
        "help" => {
            println!("Commands:");
            for command in commands.values() {
                println!();
                println!("Usage: {}", command.usage);
                println!("{}", command.description);
            }
            return true;
        }
        _ => {}
    }
    match commands.get(name.as_str()) {
        Some(command) => {
            if let Err(err) = (command.exec)(state, args) {
                println!("Error while executing command: {err}");
                println!("Usage: {}", command.usage);
            }
        }
        None => println!("Unknown command {name:?}"),
    }
    interactive
}

fn execute_script_line(
    state: &mut ExecutorState,
    commands: &BTreeMap<&'static str, Command>,
    line: &str,
) -> Result<()> {
    let tokens = parse_command_line(line)?;
    let Some((name, args)) = tokens.split_first() else {
        return Ok(());
    };
    let command = commands.get(name.as_str()).ok_or_else(|| {
        TessellaError::BadArgument(format!("unknown command {name:?}"))
    })?;
    if let Err(err) = (command.exec)(state, args) {
        eprintln!("Error while executing command: {err}");
        eprintln!("Usage: {}", command.usage);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(token: &str) -> String {
        let escaped = token.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    }

    #[test]
    fn tokenizer_splits_plain_arguments() {
        assert_eq!(
            parse_command_line("foo bar baz").unwrap(),
            vec!["foo", "bar", "baz"]
        );
        assert_eq!(
            parse_command_line("  foo   bar ").unwrap(),
            vec!["foo", "bar"]
        );
        assert!(parse_command_line("").unwrap().is_empty());
        assert!(parse_command_line("   ").unwrap().is_empty());
    }

    #[test]
    fn tokenizer_handles_quotes() {
        assert_eq!(
            parse_command_line("foo \"bar bar\"").unwrap(),
            vec!["foo", "bar bar"]
        );
        assert_eq!(parse_command_line("\"\" x").unwrap(), vec!["", "x"]);
        assert_eq!(parse_command_line("\"a\"b").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn tokenizer_handles_escapes() {
        assert_eq!(parse_command_line("a\\\\b").unwrap(), vec!["a\\b"]);
        assert_eq!(parse_command_line("a\\\"b").unwrap(), vec!["a\"b"]);
        assert_eq!(
            parse_command_line("\"a \\\"quoted\\\" arg\"").unwrap(),
            vec!["a \"quoted\" arg"]
        );
    }

    #[test]
    fn tokenizer_rejects_bad_input() {
        assert!(parse_command_line("foo\"bar").is_err());
        assert!(parse_command_line("foo \\x").is_err());
        assert!(parse_command_line("\"unclosed").is_err());
        assert!(parse_command_line("trailing\\").is_err());
        assert!(parse_command_line("\"esc at end\\").is_err());
    }

    #[test]
    fn tokenizer_round_trips_quoted_tokens() {
        let tokens = vec![
            "plain".to_string(),
            "with space".to_string(),
            "quo\"te".to_string(),
            "back\\slash".to_string(),
            String::new(),
        ];
        let line = tokens.iter().map(|t| quote(t)).collect::<Vec<_>>().join(" ");
        assert_eq!(parse_command_line(&line).unwrap(), tokens);
    }

    #[test]
    fn dimensions_require_both_sides() {
        assert_eq!(parse_dimensions("20x30").unwrap(), (20, 30));
        assert_eq!(parse_dimensions(" 20 x 30 ").unwrap(), (20, 30));
        assert!(parse_dimensions("20").is_err());
        assert!(parse_dimensions("20x30x40").is_err());
        assert!(parse_dimensions("-2x30").is_err());
        assert!(parse_dimensions("ax30").is_err());
    }

    #[test]
    fn empty_dimensions_are_allowed() {
        assert_eq!(
            parse_dimensions_empty("1024x768").unwrap(),
            (Some(1024), Some(768))
        );
        assert_eq!(parse_dimensions_empty("1024x").unwrap(), (Some(1024), None));
        assert_eq!(parse_dimensions_empty("x768").unwrap(), (None, Some(768)));
        assert_eq!(parse_dimensions_empty("x").unwrap(), (None, None));
        assert!(parse_dimensions_empty("no-x-here").is_err());
    }

    #[test]
    fn percent_accepts_both_forms() {
        assert!((parse_percent("50%").unwrap() - 0.5).abs() < 1e-12);
        assert!((parse_percent("50.0 %").unwrap() - 0.5).abs() < 1e-12);
        assert!((parse_percent("0.5").unwrap() - 0.5).abs() < 1e-12);
        assert!((parse_percent("1").unwrap() - 1.0).abs() < 1e-12);
        assert!(parse_percent("0").is_err());
        assert!(parse_percent("150%").is_err());
        assert!(parse_percent("1.5").is_err());
        assert!(parse_percent("abc").is_err());
    }

    #[test]
    fn keep_ratio_math() {
        assert_eq!(keep_ratio_height(200, 100, 100), 50);
        assert_eq!(keep_ratio_width(200, 100, 50), 100);
    }

    #[test]
    fn variety_parses_case_insensitively() {
        assert_eq!("none".parse::<Variety>().unwrap(), Variety::None);
        assert_eq!("Random".parse::<Variety>().unwrap(), Variety::Random);
        assert!("weird".parse::<Variety>().is_err());
        assert_eq!(Variety::Random.to_string(), "random");
    }

    #[test]
    fn metric_tags() {
        assert!(parse_metric_tag("gch", "gch").is_ok());
        assert!(parse_metric_tag("gch-cosine", "gch").is_ok());
        assert!(parse_metric_tag("lch-manhattan", "lch").is_ok());
        assert!(parse_metric_tag("gch-unknown", "gch").is_err());
        assert!(parse_metric_tag("gchcosine", "gch").is_err());
    }

    #[test]
    fn parameterize_replaces_high_indices_first() {
        let args: Vec<String> = (1..=12).map(|i| format!("a{i}")).collect();
        assert_eq!(parameterize("$1 $2 $12", &args), "a1 a2 a12");
        assert_eq!(parameterize("no placeholders", &args), "no placeholders");
    }

    #[test]
    fn best_fit_is_clamped() {
        let mut state = ExecutorState::new().unwrap();
        state.best_fit = 0.05;
        assert_eq!(state.best_fit_images(1000), 50);
        assert_eq!(state.best_fit_images(3), 1);
        state.best_fit = 1.0;
        assert_eq!(state.best_fit_images(10), 10);
    }

    #[test]
    fn set_validates_values() {
        let mut state = ExecutorState::new().unwrap();
        let set = |state: &mut ExecutorState, name: &str, value: &str| {
            cmd_set(state, &[name.to_string(), value.to_string()])
        };
        assert!(set(&mut state, "routines", "3").is_ok());
        assert_eq!(state.routines, 3);
        assert!(set(&mut state, "routines", "0").is_err());
        assert!(set(&mut state, "jpeg-quality", "80").is_ok());
        assert!(set(&mut state, "jpeg-quality", "0").is_err());
        assert!(set(&mut state, "jpeg-quality", "101").is_err());
        assert!(set(&mut state, "interp", "9").is_ok());
        assert_eq!(state.interp, 5);
        assert!(set(&mut state, "cut", "true").is_ok());
        assert!(state.cut);
        assert!(set(&mut state, "variety", "random").is_ok());
        assert_eq!(state.variety, Variety::Random);
        assert!(set(&mut state, "best", "10%").is_ok());
        assert!((state.best_fit - 0.1).abs() < 1e-12);
        assert!(set(&mut state, "nope", "1").is_err());
    }
}
