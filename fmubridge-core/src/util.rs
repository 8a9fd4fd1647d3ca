//! Contains a collection of useful utility functions.

use std::ffi::OsStr;
use std::fs::{read, read_dir, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::Result;

pub fn read_text_file(path: &Path) -> Result<String> {
    debug!("reading text file: {:?}", path);
    let mut fd = File::open(path)?;
    let mut content = String::new();
    fd.read_to_string(&mut content)?;
    Ok(content)
}

/// Create a static deser object from a toml file at the given path.
pub fn deser_struct_from_path<T>(file_path: &Path) -> Result<T>
where
    for<'de> T: serde::Deserialize<'de>,
{
    let bytes = read(file_path)?;
    let d: T = toml::from_slice(&bytes)?;
    Ok(d)
}

/// Get paths to files with any of the given extensions in the provided
/// directory. Results are sorted.
pub fn find_files_with_extension(dir: &Path, extensions: &[&str], recursive: bool) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();
    if dir.is_dir() {
        let dir_entry = match read_dir(dir) {
            Ok(d) => d,
            _ => {
                error!("couldn't read directory at path: {}", dir.to_string_lossy());
                return Vec::new();
            }
        };
        for entry in dir_entry {
            let path = match entry {
                Ok(p) => p.path(),
                _ => continue,
            };
            if path.is_dir() && recursive {
                paths.extend(find_files_with_extension(&path, extensions, recursive));
            } else if path.is_file() {
                let ext = path
                    .extension()
                    .unwrap_or(OsStr::new(""))
                    .to_str()
                    .unwrap_or("");
                if extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)) {
                    paths.push(path.clone());
                }
            }
        }
    };
    paths.sort();
    paths
}

/// Canonicalizes the path without the windows UNC prefix, falling back to
/// the input if the path can't be resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Parses an integer literal with the radix picked from its prefix: `0x`
/// for hexadecimal, a leading `0` for octal, decimal otherwise. An optional
/// sign is accepted.
pub fn parse_auto_radix(s: &str) -> Result<i64> {
    let s = s.trim();
    let (negative, digits) = split_sign(s);
    let value = if let Some(hex) = strip_hex_prefix(digits) {
        i64::from_str_radix(hex, 16)?
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8)?
    } else {
        digits.parse::<i64>()?
    };
    Ok(if negative { -value } else { value })
}

/// Parses a decimal or `0x`-prefixed hexadecimal integer literal.
pub fn parse_dec_or_hex(s: &str) -> Result<i64> {
    let (negative, digits) = split_sign(s.trim());
    let value = match strip_hex_prefix(digits) {
        Some(hex) => i64::from_str_radix(hex, 16)?,
        None => digits.parse::<i64>()?,
    };
    Ok(if negative { -value } else { value })
}

fn split_sign(s: &str) -> (bool, &str) {
    if let Some(rest) = s.strip_prefix('-') {
        (true, rest)
    } else if let Some(rest) = s.strip_prefix('+') {
        (false, rest)
    } else {
        (false, s)
    }
}

fn strip_hex_prefix(s: &str) -> Option<&str> {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
}

/// Returns the known name most similar to `name`, if any is reasonably
/// close.
pub fn closest_match<'a, I>(name: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    candidates
        .into_iter()
        .map(|c| (c, strsim::jaro_winkler(name, c)))
        .filter(|(_, score)| *score > 0.8)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(c, _)| c)
}

pub(crate) fn invalid_literal(field: &str, text: &str, e: Error) -> String {
    format!("invalid value `{}` for {}: {}", text, field, e)
}
