//! Parsers for the remote listings used to find block devices and mounts.
//!
//! Grammars:
//! * `dmsetup ls`: either the single line `No devices found`, or lines of
//!   `<name> (<major>:<minor>)` / `<name>\t(<major>, <minor>)`.
//! * `/proc/partitions`: a `major minor #blocks name` header, an optional blank
//!   line, then rows of four whitespace-separated fields.
//! * `mount`: `<device> on <mount point> type <fs> (<options>)`.

use std::collections::BTreeSet;
use stratus_common::CpiError;

fn bad(line: usize, reason: impl Into<String>) -> CpiError {
    CpiError::DeviceList {
        line,
        reason: reason.into(),
    }
}

/// Multipath device names, partition mappings (`-part1`) excluded.
pub fn parse_dmsetup_ls(output: &str) -> Result<Vec<String>, CpiError> {
    if output.contains("No devices found") {
        return Ok(vec![]);
    }
    let mut names = Vec::new();
    for (idx, raw) in output.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let (name, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| bad(idx + 1, format!("expected '<name> (<major>:<minor>)', got '{}'", line)))?;
        let rest = rest.trim();
        if !(rest.starts_with('(') && rest.ends_with(')')) {
            return Err(bad(idx + 1, format!("device numbers missing in '{}'", line)));
        }
        let numbers = &rest[1..rest.len() - 1];
        let valid = numbers
            .split(|c| c == ':' || c == ',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .all(|p| p.chars().all(|c| c.is_ascii_digit()));
        if !valid {
            return Err(bad(idx + 1, format!("malformed device numbers '{}'", rest)));
        }
        if !name.contains("-part1") {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Whole SCSI disks (`sd` followed by letters) listed in `/proc/partitions`.
pub fn parse_proc_partitions(output: &str) -> Result<Vec<String>, CpiError> {
    let mut names = Vec::new();
    let mut seen_header = false;
    for (idx, raw) in output.lines().enumerate() {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if !seen_header {
            if fields.first() != Some(&"major") {
                return Err(bad(idx + 1, format!("expected header, got '{}'", raw.trim())));
            }
            seen_header = true;
            continue;
        }
        if fields.len() != 4 {
            return Err(bad(idx + 1, format!("expected 4 fields, got {}", fields.len())));
        }
        if !fields[..3].iter().all(|f| f.chars().all(|c| c.is_ascii_digit())) {
            return Err(bad(idx + 1, format!("non-numeric field in '{}'", raw.trim())));
        }
        let name = fields[3];
        if is_scsi_disk(name) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn is_scsi_disk(name: &str) -> bool {
    name.strip_prefix("sd")
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_lowercase()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
}

pub fn parse_mounts(output: &str) -> Result<Vec<MountEntry>, CpiError> {
    let mut mounts = Vec::new();
    for (idx, raw) in output.lines().enumerate() {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 5 || fields[1] != "on" || fields[3] != "type" {
            return Err(bad(idx + 1, format!("unexpected mount line '{}'", raw.trim())));
        }
        mounts.push(MountEntry {
            device: fields[0].to_string(),
            mount_point: fields[2].to_string(),
            fs_type: fields[4].to_string(),
        });
    }
    Ok(mounts)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceProbe {
    /// Nothing new yet.
    None,
    Found(String),
    /// More than one new device against a non-empty baseline.
    Ambiguous(Vec<String>),
}

/// Compares device lists taken before and after an iSCSI login.
///
/// With an empty baseline the first listed device is the new one. Otherwise
/// exactly one name must be present in `new` and absent from `old` (compared
/// case-insensitively).
pub fn detect_new_device(old: &[String], new: &[String]) -> DeviceProbe {
    if old.is_empty() {
        return match new.first() {
            Some(first) => DeviceProbe::Found(first.clone()),
            None => DeviceProbe::None,
        };
    }
    let before: BTreeSet<String> = old.iter().map(|d| d.to_lowercase()).collect();
    let mut added: Vec<String> = Vec::new();
    for name in new {
        if !before.contains(&name.to_lowercase()) && !added.contains(name) {
            added.push(name.clone());
        }
    }
    match added.len() {
        0 => DeviceProbe::None,
        1 => DeviceProbe::Found(added.remove(0)),
        _ => DeviceProbe::Ambiguous(added),
    }
}
