//! Symbolic address resolution.
//!
//! Address documents (`.adx`) describe where each symbol of the worker
//! process lives in memory. [`AddressResolver`] loads them into a lookup
//! table keyed by symbol name.
//!
//! Array elements are not listed in the documents. A name such as
//! `foo[2]` is resolved by locating the base entry `foo`, checking the
//! index against its element count and deriving a new entry shifted by
//! `index * element_size`. Derived entries are stored in the table so that
//! later lookups of the same name are plain hits.
//!
//! Nested and multi-dimensional arrays are looked up through their first
//! element: resolving `m[2][1]` requires both `m` and `m[0]` to be present,
//! and takes the final layout from `m[0][0]`.
//!
//! # Multiple documents
//!
//! When more than one document is loaded, names are namespaced by the
//! originating file stem, e.g. `engine_rpm` for symbol `rpm` in
//! `engine.adx`.

use std::convert::TryFrom;
use std::path::Path;
use std::sync::Arc;

use fnv::FnvHashMap;

use crate::error::{Error, Result};
use crate::util;

mod document;
pub mod index;

pub use index::IndexPath;

/// Address document file extension.
pub const ADDRESS_FILE_EXTENSION: &str = "adx";

/// Single resolvable memory location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressEntry {
    /// Lookup key
    pub name: String,
    /// Absolute address in the worker's memory
    pub address: i64,
    /// Offset from the owning root structure
    pub offset: u32,
    /// Size in bytes
    pub size: u64,
    /// Number of elements, if this is an array
    pub element_count: u32,
    /// Size of a single array element in bytes
    pub element_size: u32,
    pub is_array: bool,
    /// Stem of the document this entry came from
    pub source: String,
}

/// Name to location lookup table built from address documents.
#[derive(Debug, Default)]
pub struct AddressResolver {
    entries: FnvHashMap<String, Arc<AddressEntry>>,
    multiple: bool,
}

impl AddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables namespacing of keys by document stem. Only affects
    /// documents loaded afterwards.
    pub fn set_multiple(&mut self, multiple: bool) {
        self.multiple = multiple;
    }

    pub fn is_multiple(&self) -> bool {
        self.multiple
    }

    /// Loads the address document at `path`.
    ///
    /// Either all entries of the document are added or, on error, none.
    /// Returns the number of newly added entries.
    pub fn load(&mut self, path: &Path) -> Result<usize> {
        let text = util::read_text_file(path).map_err(|e| Error::AddressDocument {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let source = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        self.load_str(path, &source, &text)
    }

    /// Loads an address document that's already in memory. `path` is only
    /// used for error reporting.
    pub fn load_str(&mut self, path: &Path, source: &str, text: &str) -> Result<usize> {
        let parsed = document::parse(path, source, text, self.multiple)?;
        let total = parsed.len();
        let mut added = 0;
        for entry in parsed {
            if self.entries.contains_key(&entry.name) {
                warn!(
                    "duplicate address entry `{}` in {:?}, keeping the first one",
                    entry.name, path
                );
                continue;
            }
            self.entries.insert(entry.name.clone(), Arc::new(entry));
            added += 1;
        }
        info!(
            "loaded {} address entries from {:?} ({} skipped)",
            added,
            path,
            total - added
        );
        Ok(added)
    }

    /// Loads every address document found in `dir`.
    ///
    /// Multiple mode is switched on when more than one document is found.
    /// Returns the number of loaded documents.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let paths = util::find_files_with_extension(dir, &[ADDRESS_FILE_EXTENSION], false);
        if paths.is_empty() {
            return Err(Error::NoAddressDocuments(dir.to_path_buf()));
        }
        if paths.len() > 1 {
            debug!("found {} address documents, namespacing keys", paths.len());
            self.multiple = true;
        }
        for path in &paths {
            self.load(path)?;
        }
        Ok(paths.len())
    }

    /// Returns the entry stored under exactly `name`.
    pub fn get(&self, name: &str) -> Option<Arc<AddressEntry>> {
        self.entries.get(name).cloned()
    }

    /// Looks up `name`, deriving and memoizing array element entries as
    /// needed. Repeated lookups return the same shared entry.
    pub fn resolve(&mut self, name: &str) -> Option<Arc<AddressEntry>> {
        if let Some(entry) = self.entries.get(name) {
            return Some(entry.clone());
        }
        let entry = Arc::new(self.derive_element(name)?);
        trace!(
            "derived `{}` at address {:#x}, offset {}",
            name,
            entry.address,
            entry.offset
        );
        self.entries.insert(name.to_string(), entry.clone());
        Some(entry)
    }

    fn derive_element(&self, name: &str) -> Option<AddressEntry> {
        let path = IndexPath::parse(name)?;

        let mut assembled = String::with_capacity(name.len() + 2 * path.segments.len());
        let mut shift: i64 = 0;
        let mut innermost = None;
        for (segment, index) in &path.segments {
            assembled.push_str(segment);
            let base = match self.entries.get(&assembled) {
                Some(b) => b,
                None => {
                    debug!("`{}`: no array base named `{}`", name, assembled);
                    return None;
                }
            };
            if *index >= base.element_count as usize {
                warn!(
                    "`{}`: index {} out of range, `{}` has {} elements",
                    name, index, assembled, base.element_count
                );
                return None;
            }
            shift = shift.checked_add((*index as i64).checked_mul(base.element_size as i64)?)?;
            innermost = Some(base);
            assembled.push_str("[0]");
        }
        assembled.push_str(path.suffix);

        let mut entry = match self.entries.get(&assembled) {
            Some(template) => (**template).clone(),
            None if path.suffix.is_empty() => {
                // element layout follows from the innermost base itself
                let mut e = (**innermost?).clone();
                if e.element_size != 0 {
                    e.size = e.element_size as u64;
                }
                e.element_count = 0;
                e.element_size = 0;
                e.is_array = false;
                e
            }
            None => {
                debug!("`{}`: no element layout named `{}`", name, assembled);
                return None;
            }
        };
        entry.name = name.to_string();
        entry.offset = entry.offset.checked_add(u32::try_from(shift).ok()?)?;
        entry.address = entry.address.checked_add(shift)?;
        Some(entry)
    }

    /// Returns the known name closest to `name`.
    pub fn suggest(&self, name: &str) -> Option<&str> {
        util::closest_match(name, self.entries.keys().map(|k| k.as_str()))
    }

    pub fn entries(&self) -> impl Iterator<Item = &AddressEntry> {
        self.entries.values().map(|e| e.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
