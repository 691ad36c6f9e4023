//! Patch module - signature-based rewriting of DA images.
//!
//! A [`PatchTable`] lists independent targets, each with alternative
//! byte patterns. [`apply_patches`] is pure: every search runs against
//! the original buffer, then all planned edits are applied in table order.

pub mod extension;
pub mod stages;
pub mod vbmeta;

pub use extension::{ExtensionBlob, ExtensionSymbols, build_extension, resolve_symbols};
pub use stages::{first_stage_table, patch_first_stage, patch_second_stage, second_stage_table};
pub use vbmeta::{VbmetaFlags, apply_vbmeta_flags, patch_vbmeta, slot_suffix};

use std::fmt;

use tracing::{debug, info, warn};

/// Byte pattern where `None` matches any byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern(Vec<Option<u8>>);

impl Pattern {
    pub fn exact(bytes: &[u8]) -> Self {
        Self(bytes.iter().copied().map(Some).collect())
    }

    /// Exact pattern with wildcards at the given positions.
    pub fn masked(bytes: &[u8], wildcards: &[usize]) -> Self {
        let mut pattern = Self::exact(bytes);
        for &i in wildcards {
            if let Some(slot) = pattern.0.get_mut(i) {
                *slot = None;
            }
        }
        pattern
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches_at(&self, data: &[u8], offset: usize) -> bool {
        match data.get(offset..offset + self.0.len()) {
            Some(window) => self
                .0
                .iter()
                .zip(window)
                .all(|(p, b)| p.is_none_or(|p| p == *b)),
            None => false,
        }
    }

    pub fn find(&self, data: &[u8]) -> Option<usize> {
        self.find_from(data, 0)
    }

    pub fn find_from(&self, data: &[u8], start: usize) -> Option<usize> {
        if self.0.is_empty() || data.len() < self.0.len() {
            return None;
        }
        (start..=data.len() - self.0.len()).find(|&i| self.matches_at(data, i))
    }

    /// Every match offset, overlapping matches included.
    pub fn find_all(&self, data: &[u8]) -> Vec<usize> {
        let mut found = Vec::new();
        let mut start = 0;
        while let Some(i) = self.find_from(data, start) {
            found.push(i);
            start = i + 1;
        }
        found
    }
}

/// Rewrite applied at a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Overwrite `bytes` at `match + offset`.
    Replace { offset: usize, bytes: Vec<u8> },
    /// Follow the little-endian pointer stored just before the match into
    /// the image; when the word there equals `expect`, set its low byte.
    FlagPointer { expect: u32, value: u8 },
}

impl Edit {
    pub fn replace(bytes: &[u8]) -> Self {
        Edit::Replace {
            offset: 0,
            bytes: bytes.to_vec(),
        }
    }

    pub fn replace_at(offset: usize, bytes: &[u8]) -> Self {
        Edit::Replace {
            offset,
            bytes: bytes.to_vec(),
        }
    }
}

/// One alternative way to locate and patch a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub pattern: Pattern,
    pub edit: Edit,
    /// Patch every occurrence rather than the first.
    pub all_matches: bool,
    /// Extra pattern/edit pairs applied to every occurrence when this
    /// candidate is chosen.
    pub companions: Vec<(Pattern, Edit)>,
}

impl Candidate {
    pub fn new(pattern: Pattern, edit: Edit) -> Self {
        Self {
            pattern,
            edit,
            all_matches: false,
            companions: Vec::new(),
        }
    }

    pub fn all(mut self) -> Self {
        self.all_matches = true;
        self
    }

    pub fn with_companion(mut self, pattern: Pattern, edit: Edit) -> Self {
        self.companions.push((pattern, edit));
        self
    }
}

/// A check to neutralise. The first candidate that matches wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
    pub name: &'static str,
    pub candidates: Vec<Candidate>,
    /// Only attempted when the image contains one of these markers.
    pub markers: Vec<&'static [u8]>,
}

impl PatchTarget {
    pub fn new(name: &'static str, candidates: Vec<Candidate>) -> Self {
        Self {
            name,
            candidates,
            markers: Vec::new(),
        }
    }

    pub fn when_marked(mut self, markers: &[&'static [u8]]) -> Self {
        self.markers = markers.to_vec();
        self
    }
}

/// Ordered targets plus the address the image runs at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTable {
    pub targets: Vec<PatchTarget>,
    pub load_address: u32,
}

/// Per-target result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Patched { offsets: Vec<usize> },
    NotFound,
    Skipped(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub results: Vec<(&'static str, TargetOutcome)>,
}

impl PatchReport {
    pub fn patched(&self) -> Vec<&'static str> {
        self.results
            .iter()
            .filter(|(_, o)| matches!(o, TargetOutcome::Patched { .. }))
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn missing(&self) -> Vec<&'static str> {
        self.results
            .iter()
            .filter(|(_, o)| matches!(o, TargetOutcome::NotFound))
            .map(|(n, _)| *n)
            .collect()
    }

    pub fn outcome(&self, name: &str) -> Option<&TargetOutcome> {
        self.results.iter().find(|(n, _)| *n == name).map(|(_, o)| o)
    }
}

impl fmt::Display for PatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, outcome) in &self.results {
            match outcome {
                TargetOutcome::Patched { offsets } => {
                    let offsets: Vec<String> = offsets.iter().map(|o| format!("0x{o:X}")).collect();
                    writeln!(f, "{name:<24} patched at {}", offsets.join(", "))?
                }
                TargetOutcome::NotFound => writeln!(f, "{name:<24} not found")?,
                TargetOutcome::Skipped(reason) => writeln!(f, "{name:<24} skipped: {reason}")?,
            }
        }
        Ok(())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

type Planned = Vec<(usize, Vec<u8>)>;

fn plan_edit(
    original: &[u8],
    at: usize,
    edit: &Edit,
    load_address: u32,
) -> Result<(usize, Vec<u8>), String> {
    match edit {
        Edit::Replace { offset, bytes } => Ok((at + offset, bytes.clone())),
        Edit::FlagPointer { expect, value } => {
            let ptr = at
                .checked_sub(4)
                .and_then(|p| read_u32(original, p))
                .ok_or("pointer before match out of range")?;
            let target = ptr
                .checked_sub(load_address)
                .ok_or_else(|| format!("pointer 0x{ptr:08X} below load address"))?
                as usize;
            match read_u32(original, target) {
                Some(v) if v == *expect => Ok((target, vec![*value])),
                Some(v) => Err(format!("flag at 0x{target:X} is {v}, expected {expect}")),
                None => Err(format!("flag pointer 0x{ptr:08X} outside image")),
            }
        }
    }
}

fn plan_target(original: &[u8], target: &PatchTarget, load_address: u32) -> (TargetOutcome, Planned) {
    if !target.markers.is_empty() && !target.markers.iter().any(|m| contains(original, m)) {
        return (TargetOutcome::Skipped("marker not present".into()), Vec::new());
    }

    for candidate in &target.candidates {
        let matches = if candidate.all_matches {
            candidate.pattern.find_all(original)
        } else {
            candidate.pattern.find(original).into_iter().collect()
        };
        if matches.is_empty() {
            continue;
        }

        let mut planned = Vec::new();
        for &at in &matches {
            match plan_edit(original, at, &candidate.edit, load_address) {
                Ok(edit) => planned.push(edit),
                Err(reason) => return (TargetOutcome::Skipped(reason), Vec::new()),
            }
        }
        for (pattern, edit) in &candidate.companions {
            for at in pattern.find_all(original) {
                if let Ok(edit) = plan_edit(original, at, edit, load_address) {
                    planned.push(edit);
                }
            }
        }
        let offsets = planned.iter().map(|(o, _)| *o).collect();
        return (TargetOutcome::Patched { offsets }, planned);
    }
    (TargetOutcome::NotFound, Vec::new())
}

/// Apply `table` to `image`, returning the patched copy and a report.
///
/// Missing targets are logged and reported, never fatal.
pub fn apply_patches(image: &[u8], table: &PatchTable) -> (Vec<u8>, PatchReport) {
    let mut plans = Vec::with_capacity(table.targets.len());
    let mut report = PatchReport::default();
    for target in &table.targets {
        let (outcome, planned) = plan_target(image, target, table.load_address);
        match &outcome {
            TargetOutcome::Patched { offsets } => {
                info!(target = target.name, count = offsets.len(), "Patched");
            }
            TargetOutcome::NotFound => {
                warn!(target = target.name, "Patch target not found");
            }
            TargetOutcome::Skipped(reason) => {
                debug!(target = target.name, %reason, "Patch target skipped");
            }
        }
        plans.push(planned);
        report.results.push((target.name, outcome));
    }

    let mut out = image.to_vec();
    for (offset, bytes) in plans.into_iter().flatten() {
        match out.get_mut(offset..offset + bytes.len()) {
            Some(window) => window.copy_from_slice(&bytes),
            None => warn!(offset = %format!("0x{offset:X}"), "Patch edit outside image, dropped"),
        }
    }
    (out, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_find() {
        let pattern = Pattern::masked(&[0x0A, 0x00, 0x00, 0xE0, 0x00, 0x00, 0x00, 0xE0], &[4]);
        let data = [0x11, 0x0A, 0x00, 0x00, 0xE0, 0x7F, 0x00, 0x00, 0xE0];
        assert_eq!(pattern.find(&data), Some(1));
        assert_eq!(Pattern::exact(&[0x00, 0x00]).find_all(&[0, 0, 0]), vec![0, 1]);
        assert_eq!(Pattern::exact(&[1, 2, 3]).find(&[1, 2]), None);
    }

    #[test]
    fn test_searches_use_original_buffer() {
        // Target A's replacement creates B's pattern; B must not fire.
        let table = PatchTable {
            targets: vec![
                PatchTarget::new(
                    "a",
                    vec![Candidate::new(Pattern::exact(&[0xAA, 0xAA]), Edit::replace(&[0xBB, 0xBB]))],
                ),
                PatchTarget::new(
                    "b",
                    vec![Candidate::new(Pattern::exact(&[0xBB, 0xBB]), Edit::replace(&[0xCC, 0xCC]))],
                ),
            ],
            load_address: 0,
        };
        let (out, report) = apply_patches(&[0x00, 0xAA, 0xAA, 0x00], &table);
        assert_eq!(out, vec![0x00, 0xBB, 0xBB, 0x00]);
        assert_eq!(report.patched(), vec!["a"]);
        assert_eq!(report.missing(), vec!["b"]);
    }

    #[test]
    fn test_alternatives_and_markers() {
        let table = PatchTable {
            targets: vec![
                PatchTarget::new(
                    "alt",
                    vec![
                        Candidate::new(Pattern::exact(&[0x01, 0x02]), Edit::replace(&[0, 0])),
                        Candidate::new(Pattern::exact(&[0x03, 0x04]), Edit::replace_at(1, &[0xFF])),
                    ],
                ),
                PatchTarget::new(
                    "vendor",
                    vec![Candidate::new(Pattern::exact(&[0x03]), Edit::replace(&[0x09]))],
                )
                .when_marked(&[b"[oplus]"]),
            ],
            load_address: 0,
        };
        let (out, report) = apply_patches(&[0x03, 0x04, 0x05], &table);
        assert_eq!(out, vec![0x03, 0xFF, 0x05]);
        assert!(matches!(report.outcome("vendor"), Some(TargetOutcome::Skipped(_))));
    }

    #[test]
    fn test_flag_pointer() {
        let load = 0x4000_0000u32;
        let mut image = vec![0u8; 0x40];
        image[0x20..0x24].copy_from_slice(&3u32.to_le_bytes());
        image[0x08..0x0C].copy_from_slice(&(load + 0x20).to_le_bytes());
        image[0x0C..0x10].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let table = PatchTable {
            targets: vec![PatchTarget::new(
                "flag",
                vec![Candidate::new(
                    Pattern::exact(&[0xDE, 0xAD, 0xBE, 0xEF]),
                    Edit::FlagPointer { expect: 3, value: 1 },
                )],
            )],
            load_address: load,
        };
        let (out, report) = apply_patches(&image, &table);
        assert_eq!(read_u32(&out, 0x20), Some(1));
        assert_eq!(report.patched(), vec!["flag"]);

        // Flag already 1: nothing to do.
        let (again, report) = apply_patches(&out, &table);
        assert_eq!(again, out);
        assert!(matches!(report.outcome("flag"), Some(TargetOutcome::Skipped(_))));
    }
}
