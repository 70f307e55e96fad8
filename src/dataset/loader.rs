//! Image loading for fog-density sites
//!
//! A site is a weather station: one metadata CSV plus a directory tree of
//! images. Every metadata basename must resolve to exactly one file in that
//! tree. Images are decoded in parallel, resized to a square resolution and
//! stored as CHW `f32` in `[0, 1]`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::ImageReader;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::dataset::metadata::read_metadata;
use crate::dataset::{one_hot, CLASS_NAMES};
use crate::utils::error::{FogError, Result};
use crate::NUM_CLASSES;

/// Where a site's data lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteSource {
    /// Site tag attached to every record from this source
    pub name: String,
    /// Metadata CSV (`image_id`, `vis_class`, `basename`)
    pub metadata_csv: PathBuf,
    /// Root of the site's image tree, searched recursively
    pub image_dir: PathBuf,
}

impl SiteSource {
    pub fn new(name: &str, metadata_csv: impl Into<PathBuf>, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            metadata_csv: metadata_csv.into(),
            image_dir: image_dir.into(),
        }
    }
}

/// A decoded, labelled image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FogRecord {
    pub image_id: String,
    pub basename: String,
    pub path: PathBuf,
    /// Site of origin
    pub site: String,
    /// Fog-density class index
    pub label: usize,
    /// CHW pixels in `[0, 1]`, length `3 * size * size`
    pub pixels: Vec<f32>,
}

impl FogRecord {
    /// One-hot encoded label
    pub fn one_hot(&self) -> Result<Vec<f32>> {
        one_hot(self.label)
    }
}

/// All records of one site, in metadata order
#[derive(Debug, Clone)]
pub struct SiteData {
    pub name: String,
    pub records: Vec<FogRecord>,
}

impl SiteData {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Basename -> matching paths for a directory tree
#[derive(Debug, Clone)]
pub struct BasenameIndex {
    root: PathBuf,
    entries: HashMap<String, Vec<PathBuf>>,
}

impl BasenameIndex {
    /// Walk `root` recursively and index every regular file by its name
    pub fn build(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(FogError::PathNotFound(root.to_path_buf()));
        }

        let mut entries: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for entry in WalkDir::new(root).follow_links(true) {
            // An unreadable subtree could hide the only copy of an image
            let entry = entry.map_err(|e| {
                FogError::Dataset(format!("failed to scan image directory {:?}: {}", root, e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            entries.entry(name).or_default().push(entry.into_path());
        }

        debug!("Indexed {} distinct file names under {:?}", entries.len(), root);
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    /// Resolve a basename to its single matching file
    pub fn resolve(&self, basename: &str) -> Result<PathBuf> {
        match self.entries.get(basename).map(|paths| paths.as_slice()) {
            None | Some([]) => Err(FogError::MissingImage {
                basename: basename.to_string(),
                dir: self.root.clone(),
            }),
            Some([path]) => Ok(path.clone()),
            Some(paths) => Err(FogError::AmbiguousImage {
                basename: basename.to_string(),
                dir: self.root.clone(),
                count: paths.len(),
            }),
        }
    }
}

/// Decode an image, resize it to `size x size` and convert to CHW `[0, 1]`
pub fn load_image(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = ImageReader::open(path)
        .map_err(|e| FogError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .with_guessed_format()
        .map_err(|e| FogError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| FogError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();

    let plane = size * size;
    let mut pixels = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = y as usize * size + x as usize;
        pixels[offset] = pixel[0] as f32 / 255.0;
        pixels[plane + offset] = pixel[1] as f32 / 255.0;
        pixels[2 * plane + offset] = pixel[2] as f32 / 255.0;
    }

    Ok(pixels)
}

fn progress_bar(len: usize, site: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("  {spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(site.to_string());
    pb
}

/// Load every record of a site
///
/// All basenames are resolved before any image is decoded, so a bad
/// metadata row fails fast.
pub fn load_site(source: &SiteSource, image_size: usize) -> Result<SiteData> {
    let rows = read_metadata(&source.metadata_csv)?;
    let index = BasenameIndex::build(&source.image_dir)?;

    let resolved = rows
        .into_iter()
        .map(|row| {
            let path = index.resolve(&row.basename)?;
            let label = row.label()?;
            Ok((row, label, path))
        })
        .collect::<Result<Vec<_>>>()?;

    let pb = progress_bar(resolved.len(), &source.name);
    let records = resolved
        .par_iter()
        .map(|(row, label, path)| {
            let pixels = load_image(path, image_size)?;
            pb.inc(1);
            Ok(FogRecord {
                image_id: row.image_id.clone(),
                basename: row.basename.clone(),
                path: path.clone(),
                site: source.name.clone(),
                label: *label,
                pixels,
            })
        })
        .collect::<Result<Vec<_>>>();
    pb.finish_and_clear();
    let records = records?;

    info!("Loaded {} images for site '{}'", records.len(), source.name);
    Ok(SiteData {
        name: source.name.clone(),
        records,
    })
}

/// Load every configured site, in order
pub fn load_sites(sources: &[SiteSource], image_size: usize) -> Result<Vec<SiteData>> {
    if sources.is_empty() {
        return Err(FogError::Config("no sites configured".to_string()));
    }
    sources.iter().map(|s| load_site(s, image_size)).collect()
}

/// Per-site, per-class record counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStats {
    /// (site name, class counts)
    pub sites: Vec<(String, [usize; NUM_CLASSES])>,
}

impl DatasetStats {
    /// Count labels from the metadata alone, without decoding any image
    pub fn from_metadata(sources: &[SiteSource]) -> Result<Self> {
        let mut sites = Vec::with_capacity(sources.len());
        for source in sources {
            let mut counts = [0usize; NUM_CLASSES];
            for row in read_metadata(&source.metadata_csv)? {
                counts[row.label()?] += 1;
            }
            sites.push((source.name.clone(), counts));
        }
        Ok(Self { sites })
    }

    pub fn from_sites(sites: &[SiteData]) -> Self {
        let sites = sites
            .iter()
            .map(|site| {
                let mut counts = [0usize; NUM_CLASSES];
                for record in &site.records {
                    counts[record.label] += 1;
                }
                (site.name.clone(), counts)
            })
            .collect();
        Self { sites }
    }

    pub fn total(&self) -> usize {
        self.sites.iter().map(|(_, c)| c.iter().sum::<usize>()).sum()
    }

    /// Class counts summed over all sites
    pub fn class_totals(&self) -> [usize; NUM_CLASSES] {
        let mut totals = [0usize; NUM_CLASSES];
        for (_, counts) in &self.sites {
            for (total, count) in totals.iter_mut().zip(counts) {
                *total += count;
            }
        }
        totals
    }
}

impl std::fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<16}", "site")?;
        for name in CLASS_NAMES {
            write!(f, "{:>14}", name)?;
        }
        writeln!(f, "{:>10}", "total")?;

        for (site, counts) in &self.sites {
            write!(f, "{:<16}", site)?;
            for count in counts {
                write!(f, "{:>14}", count)?;
            }
            writeln!(f, "{:>10}", counts.iter().sum::<usize>())?;
        }

        write!(f, "{:<16}", "all")?;
        for count in self.class_totals() {
            write!(f, "{:>14}", count)?;
        }
        writeln!(f, "{:>10}", self.total())
    }
}
