//! Loader repository and version selection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use super::image::{LoaderImage, parse_loader_file};
use crate::error::ParseError;
use crate::protocol::LEGACY_HW_CODE;

const LOADER_NAME_MARKERS: [&str; 2] = ["MTK_AllInOne_DA", "MTK_DA"];

/// DA images grouped by chip hardware code.
#[derive(Debug, Default, Clone)]
pub struct LoaderRepository {
    images: BTreeMap<u16, Vec<LoaderImage>>,
    root: Option<PathBuf>,
}

impl LoaderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository seeded with the images of a single loader file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ParseError> {
        let mut repo = Self::new();
        repo.add_file(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Using custom loader");
        Ok(repo)
    }

    /// Scan `dir` recursively for loader files.
    pub fn scan_dir<P: AsRef<Path>>(dir: P) -> Result<Self, ParseError> {
        let mut repo = Self {
            root: Some(dir.as_ref().to_path_buf()),
            ..Self::default()
        };
        repo.rescan()?;
        Ok(repo)
    }

    /// Rebuild from the scanned directory. Files that fail to parse are
    /// logged and skipped.
    pub fn rescan(&mut self) -> Result<(), ParseError> {
        let Some(root) = self.root.clone() else {
            return Ok(());
        };
        self.images.clear();

        let mut files = Vec::new();
        collect_loader_files(&root, &mut files)?;
        files.sort();
        files.reverse();

        for file in &files {
            if let Err(e) = self.add_file(file) {
                error!(path = %file.display(), error = %e, "Couldn't open loader");
            }
        }
        debug!(files = files.len(), chips = self.images.len(), "Loader directory scanned");
        Ok(())
    }

    /// Parse one loader file and merge its images.
    pub fn add_file(&mut self, path: &Path) -> Result<usize, ParseError> {
        let images = parse_loader_file(path)?;
        let mut added = 0;
        for image in images {
            if self.insert(image) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Insert unless an image with the same `(hw_version, sw_version,
    /// hw_sub_code)` is already known for the chip.
    pub fn insert(&mut self, image: LoaderImage) -> bool {
        if image.hw_code == 0 {
            return false;
        }
        let entry = self.images.entry(image.hw_code).or_default();
        let duplicate = entry.iter().any(|known| {
            known.hw_version == image.hw_version
                && known.sw_version == image.sw_version
                && known.hw_sub_code == image.hw_sub_code
        });
        if duplicate {
            return false;
        }
        entry.push(image);
        true
    }

    /// Best image for a device: the greatest `(hw_version, sw_version)`
    /// with neither component above the device's. Earlier images win ties.
    pub fn select(&self, hw_code: u16, hw_version: u16, sw_version: u16) -> Option<&LoaderImage> {
        let mut best: Option<&LoaderImage> = None;
        for image in self.images.get(&hw_code).into_iter().flatten() {
            if image.hw_version > hw_version || image.sw_version > sw_version {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => (image.hw_version, image.sw_version) > (b.hw_version, b.sw_version),
            };
            if better {
                best = Some(image);
            }
        }

        match best {
            Some(image) => {
                info!(%image, path = %image.path.display(), "Selected loader");
            }
            None if hw_code == LEGACY_HW_CODE => {
                debug!(hw_code = %format!("0x{hw_code:04X}"), "No loader, using legacy path");
            }
            None => {
                error!(hw_code = %format!("0x{hw_code:04X}"), "No da_loader config set up");
            }
        }
        best
    }

    pub fn get(&self, hw_code: u16) -> &[LoaderImage] {
        self.images.get(&hw_code).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.images.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoaderImage> {
        self.images.values().flatten()
    }
}

fn collect_loader_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ParseError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_loader_files(&path, out)?;
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            warn!(path = %path.display(), "Skipping non UTF-8 file name");
            continue;
        };
        if LOADER_NAME_MARKERS.iter().any(|m| name.contains(m)) {
            out.push(path);
        }
    }
    Ok(())
}
