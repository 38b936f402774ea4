//! Multi-part ("split") model file names: `<stem>-00001-of-00003.<ext>`.

use crate::error::{DepotError, Result};

/// A parsed part name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitName {
    pub stem: String,
    pub index: u32,
    pub total: u32,
    pub width: usize,
    pub extension: String,
}

impl SplitName {
    /// Recognize `stem-NNNNN-of-MMMMM.ext` (equal-width zero-padded numbers)
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let (base, extension) = match name.rfind('.') {
            Some(dot) if dot > 0 => (&name[..dot], &name[dot + 1..]),
            _ => (name, ""),
        };
        let (front, total) = base.rsplit_once("-of-")?;
        let (stem, index) = front.rsplit_once('-')?;
        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if stem.is_empty() || !all_digits(index) || !all_digits(total) || index.len() != total.len() {
            return None;
        }
        Some(Self {
            stem: stem.to_string(),
            index: index.parse().ok()?,
            total: total.parse().ok()?,
            width: index.len(),
            extension: extension.to_string(),
        })
    }

    /// File name of part `index`
    #[must_use]
    pub fn part(&self, index: u32) -> String {
        let width = self.width;
        let mut name = format!("{}-{index:0width$}-of-{:0width$}", self.stem, self.total);
        if !self.extension.is_empty() {
            name.push('.');
            name.push_str(&self.extension);
        }
        name
    }

    /// All part names, 1..=total, in numeric order
    pub fn parts(&self) -> Result<Vec<String>> {
        if self.total == 0 || self.index == 0 || self.index > self.total {
            return Err(DepotError::AmbiguousSplitModel(format!(
                "part {} of {} is not a valid position",
                self.index, self.total
            )));
        }
        Ok((1..=self.total).map(|i| self.part(i)).collect())
    }
}

/// Expand a file name into its full ordered part list; non-split names map to themselves
pub fn expand(name: &str) -> Result<Vec<String>> {
    match SplitName::parse(name) {
        Some(split) => split.parts(),
        None => Ok(vec![name.to_string()]),
    }
}

/// Check that a registry-provided list of split parts is exactly 1..=M, once each.
///
/// Names that are not split parts are ignored.
pub fn validate_parts<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen: Vec<SplitName> = names.into_iter().filter_map(SplitName::parse).collect();
    if seen.is_empty() {
        return Ok(());
    }
    seen.sort_by(|a, b| (&a.stem, a.index).cmp(&(&b.stem, b.index)));

    let mut groups: Vec<&[SplitName]> = Vec::new();
    let mut start = 0;
    for i in 1..=seen.len() {
        if i == seen.len() || seen[i].stem != seen[start].stem {
            groups.push(&seen[start..i]);
            start = i;
        }
    }

    if groups.len() > 1 {
        return Err(DepotError::AmbiguousSplitModel(format!(
            "{} distinct split models in one snapshot",
            groups.len()
        )));
    }
    let parts = groups[0];
    let total = parts[0].total;
    let contiguous = parts
        .iter()
        .enumerate()
        .all(|(i, p)| p.total == total && p.index as usize == i + 1);
    if !contiguous || parts.len() != total as usize {
        let have: Vec<u32> = parts.iter().map(|p| p.index).collect();
        return Err(DepotError::AmbiguousSplitModel(format!(
            "{}: expected parts 1..={total}, found {have:?}",
            parts[0].stem
        )));
    }
    Ok(())
}
