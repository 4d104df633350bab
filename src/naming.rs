use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{MetacleanError, Result};
use crate::models::BookRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameOutcome {
    /// The file already carries its canonical name (possibly suffixed).
    Unchanged(PathBuf),
    Renamed(PathBuf),
}

impl RenameOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Unchanged(path) | Self::Renamed(path) => path,
        }
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|ch| *ch != ':')
        .map(|ch| match ch {
            '\\' | '/' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            _ => ch,
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .trim()
        .to_string()
}

/// `1.0` prints as `1`, `1.5` as `1.5`.
pub fn format_series_index(index: f64) -> String {
    if index.fract() == 0.0 {
        format!("{}", index as i64)
    } else {
        format!("{}", index)
    }
}

/// `Title (Series, #N) - First Author - Second Author.epub`
pub fn canonical_file_name(record: &BookRecord) -> String {
    let mut name = record.display_title();
    if let Some(series) = record.series.as_deref().filter(|value| !value.trim().is_empty()) {
        match record.series_index {
            Some(index) => name.push_str(&format!(" ({}, #{})", series.trim(), format_series_index(index))),
            None => name.push_str(&format!(" ({})", series.trim())),
        }
    }
    if let Some(author) = record.author.as_deref().filter(|value| !value.trim().is_empty()) {
        name.push_str(" - ");
        name.push_str(&author.replace(", ", " - "));
    }
    let name = sanitize(&name);
    let name = if name.is_empty() { "Untitled".to_string() } else { name };
    format!("{}.epub", name)
}

fn split_name(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(dot) if dot > 0 => (&file_name[..dot], &file_name[dot..]),
        _ => (file_name, ""),
    }
}

/// True when `current` equals `target` or is `target` with a ` (N)` suffix
/// left by an earlier collision.
pub fn is_already_named(current: &str, target: &str) -> bool {
    if current == target {
        return true;
    }
    let (stem, ext) = split_name(target);
    let Some(rest) = current.strip_prefix(stem).and_then(|rest| rest.strip_suffix(ext)) else {
        return false;
    };
    rest.strip_prefix(" (")
        .and_then(|rest| rest.strip_suffix(')'))
        .map(|digits| !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()))
        .unwrap_or(false)
}

fn numbered(dir: &Path, file_name: &str, index: usize) -> PathBuf {
    if index == 0 {
        return dir.join(file_name);
    }
    let (stem, ext) = split_name(file_name);
    dir.join(format!("{} ({}){}", stem, index, ext))
}

/// Lowest unused ` (N)` variant of `file_name` in `dir`.
pub fn resolve_collision(dir: &Path, file_name: &str) -> PathBuf {
    (0..)
        .map(|index| numbered(dir, file_name, index))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| dir.join(file_name))
}

/// Like [`resolve_collision`], but claims the name by creating an empty
/// file there, so concurrent writers never pick the same path.
pub fn reserve_unique(dir: &Path, file_name: &str) -> Result<PathBuf> {
    for index in 0.. {
        let candidate = numbered(dir, file_name, index);
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(MetacleanError::io(&candidate, err)),
        }
    }
    Err(MetacleanError::FileConflict(dir.join(file_name)))
}

/// Moves `current` to `file_name` within its directory. An existing different
/// file at the target is overwritten only when `confirm_overwrite` agrees;
/// otherwise the lowest free ` (N)` suffix is used.
pub fn rename_to(
    current: &Path,
    file_name: &str,
    confirm_overwrite: &dyn Fn(&Path) -> bool,
) -> Result<RenameOutcome> {
    let current_name = current
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    if is_already_named(&current_name, file_name) {
        return Ok(RenameOutcome::Unchanged(current.to_path_buf()));
    }
    if !current.exists() {
        return Err(MetacleanError::unrecoverable(current, "file no longer exists"));
    }

    let dir = current.parent().unwrap_or_else(|| Path::new("."));
    let mut target = dir.join(file_name);
    if target.exists() && !confirm_overwrite(&target) {
        target = resolve_collision(dir, file_name);
    }
    std::fs::rename(current, &target).map_err(|err| MetacleanError::io(current, err))?;
    log::info!("renamed {} -> {}", current.display(), target.display());
    Ok(RenameOutcome::Renamed(target))
}
