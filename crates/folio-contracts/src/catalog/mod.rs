//! The image catalog: which images a project has, which category each one
//! belongs to, and the print order of the pages.
//!
//! Entries live in a single arena keyed by id. Each category keeps an ordered
//! list of ids into that arena; for pages the list position is the print
//! order. Every mutation rewrites `catalog.json` in full through
//! [`write_json_atomic`], and the in-memory state is rolled back when that
//! rewrite fails, so memory and disk never disagree.

mod entry;
mod manifest;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::atomic::{read_json, write_json_atomic};
use crate::error::{StoreError, StoreResult};
use manifest::{ManifestDocument, ManifestRow};

pub use entry::{normalize_relative, Category, ImageEntry};
pub use manifest::MANIFEST_SCHEMA_VERSION;

pub const MANIFEST_FILE: &str = "catalog.json";

/// File operations the catalog delegates to whoever owns the artifacts.
pub trait BackingStore {
    /// Copies an artifact (and its derived files) into `category` and returns
    /// the new project-relative path. The source is left in place.
    fn copy_to_category(&self, relative_path: &str, category: Category)
        -> std::io::Result<String>;

    /// Removes an artifact and its derived files. Missing files are not an error.
    fn remove(&self, relative_path: &str) -> std::io::Result<()>;
}

/// A catalog row that could not be honoured when the manifest was loaded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InconsistentState {
    #[error("catalog entry {id} references missing file {relative_path}")]
    MissingFile { id: String, relative_path: String },

    #[error("catalog entry {id} points outside the project: {relative_path}")]
    OutsideProject { id: String, relative_path: String },

    #[error("catalog entry {id} appears more than once")]
    DuplicateId { id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub inconsistencies: Vec<InconsistentState>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.inconsistencies.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
    manifest_path: PathBuf,
    entries: IndexMap<String, ImageEntry>,
    index: BTreeMap<Category, Vec<String>>,
}

impl Catalog {
    /// Loads `catalog.json` under `root`. A missing manifest yields an empty
    /// catalog; rows whose file is gone are dropped and reported.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<(Self, LoadReport)> {
        let root = root.into();
        let manifest_path = root.join(MANIFEST_FILE);
        let document = read_json::<ManifestDocument>(&manifest_path)?
            .unwrap_or_else(ManifestDocument::empty);

        let mut catalog = Self {
            root,
            manifest_path,
            entries: IndexMap::new(),
            index: BTreeMap::new(),
        };
        let mut report = LoadReport::default();

        for category in Category::ALL {
            let mut rows = document.rows(category).to_vec();
            if category == Category::Page {
                rows.sort_by_key(|row| row.order.unwrap_or(u32::MAX));
            }
            for row in rows {
                let entry = row.into_entry(category);
                if let Some(issue) = catalog.check_loaded(&entry) {
                    warn!(%issue, "dropping catalog entry from the listing");
                    report.inconsistencies.push(issue);
                    continue;
                }
                catalog
                    .index
                    .entry(category)
                    .or_default()
                    .push(entry.id.clone());
                catalog.entries.insert(entry.id.clone(), entry);
            }
        }
        catalog.repack_pages();

        debug!(
            entries = catalog.entries.len(),
            dropped = report.inconsistencies.len(),
            manifest = %catalog.manifest_path.display(),
            "catalog loaded"
        );
        Ok((catalog, report))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ImageEntry> {
        self.entries.get(id)
    }

    /// Looks an entry up by file path, absolute (under the root) or relative.
    pub fn find_by_path(&self, path: &Path) -> Option<&ImageEntry> {
        let relative = self.relative_path_of(path)?;
        self.entries
            .values()
            .find(|entry| entry.relative_path == relative)
    }

    pub fn relative_path_of(&self, path: &Path) -> Option<String> {
        let relative = match path.strip_prefix(&self.root) {
            Ok(inner) => inner,
            Err(_) if path.is_absolute() => return None,
            Err(_) => path,
        };
        relative.to_str().map(normalize_relative)
    }

    pub fn absolute_path(&self, entry: &ImageEntry) -> PathBuf {
        self.root.join(&entry.relative_path)
    }

    /// Entries of one category; pages come back in print order.
    pub fn list(&self, category: Category) -> Vec<ImageEntry> {
        self.index
            .get(&category)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.entries.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn page_ids(&self) -> Vec<String> {
        self.index.get(&Category::Page).cloned().unwrap_or_default()
    }

    /// Registers a new entry. Pages are appended after the current last page;
    /// any `order` carried by the caller is ignored.
    pub fn add(&mut self, entry: ImageEntry) -> StoreResult<ImageEntry> {
        if entry.id.trim().is_empty() {
            return Err(StoreError::Validation("image id must not be empty".to_string()));
        }
        if self.entries.contains_key(&entry.id) {
            return Err(StoreError::Validation(format!(
                "image id {} is already cataloged",
                entry.id
            )));
        }
        if !is_contained(&entry.relative_path) {
            return Err(StoreError::Validation(format!(
                "image path {} is not inside the project",
                entry.relative_path
            )));
        }
        if self
            .entries
            .values()
            .any(|existing| existing.relative_path == entry.relative_path)
        {
            return Err(StoreError::Validation(format!(
                "image path {} is already cataloged",
                entry.relative_path
            )));
        }

        let added = self.mutate(move |catalog| {
            let mut entry = entry;
            entry.order = None;
            let id = entry.id.clone();
            catalog
                .index
                .entry(entry.category)
                .or_default()
                .push(id.clone());
            catalog.entries.insert(id.clone(), entry);
            catalog.repack_pages();
            catalog.cloned(&id)
        })?;
        info!(
            id = %added.id,
            category = %added.category,
            path = %added.relative_path,
            order = ?added.order,
            "image cataloged"
        );
        Ok(added)
    }

    /// Moves an entry to another category. The artifact is copied first, the
    /// manifest rewritten, and only then the old copy removed.
    pub fn move_category(
        &mut self,
        id: &str,
        target: Category,
        store: &dyn BackingStore,
    ) -> StoreResult<ImageEntry> {
        let current = self
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownImage(id.to_string()))?;
        if current.category == target {
            return Ok(current);
        }

        let moved_path = store
            .copy_to_category(&current.relative_path, target)
            .map_err(|source| StoreError::io(self.root.join(&current.relative_path), source))?;
        let moved_path = normalize_relative(&moved_path);

        let outcome = self.mutate(|catalog| {
            if let Some(ids) = catalog.index.get_mut(&current.category) {
                ids.retain(|existing| existing != id);
            }
            catalog
                .index
                .entry(target)
                .or_default()
                .push(id.to_string());
            if let Some(entry) = catalog.entries.get_mut(id) {
                entry.category = target;
                entry.relative_path = moved_path.clone();
                entry.order = None;
            }
            catalog.repack_pages();
            catalog.cloned(id)
        });

        match outcome {
            Ok(moved) => {
                if let Err(err) = store.remove(&current.relative_path) {
                    warn!(
                        path = %current.relative_path,
                        error = %err,
                        "moved image left an orphaned source file"
                    );
                }
                info!(
                    id,
                    from = %current.category,
                    to = %target,
                    path = %moved.relative_path,
                    "image moved"
                );
                Ok(moved)
            }
            Err(err) => {
                if let Err(cleanup) = store.remove(&moved_path) {
                    warn!(path = %moved_path, error = %cleanup, "failed to discard copied image");
                }
                Err(err)
            }
        }
    }

    /// Removes an entry and then its files. Unknown ids are a no-op.
    pub fn delete(
        &mut self,
        id: &str,
        store: &dyn BackingStore,
    ) -> StoreResult<Option<ImageEntry>> {
        let Some(existing) = self.get(id).cloned() else {
            debug!(id, "delete of unknown image ignored");
            return Ok(None);
        };

        self.mutate(|catalog| {
            catalog.entries.shift_remove(id);
            if let Some(ids) = catalog.index.get_mut(&existing.category) {
                ids.retain(|candidate| candidate != id);
            }
            catalog.repack_pages();
            Ok(())
        })?;

        if let Err(err) = store.remove(&existing.relative_path) {
            warn!(
                path = %existing.relative_path,
                error = %err,
                "deleted image left an orphaned file"
            );
        }
        info!(id, path = %existing.relative_path, "image deleted");
        Ok(Some(existing))
    }

    /// Replaces the page order. `new_order` must contain every current page id
    /// exactly once.
    pub fn reorder_pages(&mut self, new_order: &[String]) -> StoreResult<()> {
        validate_permutation(&self.page_ids(), new_order)?;
        self.mutate(|catalog| {
            catalog.index.insert(Category::Page, new_order.to_vec());
            catalog.repack_pages();
            Ok(())
        })?;
        info!(pages = new_order.len(), "pages reordered");
        Ok(())
    }

    pub fn save(&self) -> StoreResult<()> {
        let mut document = ManifestDocument::empty();
        for category in Category::ALL {
            let rows = document.rows_mut(category);
            for id in self.index.get(&category).into_iter().flatten() {
                if let Some(entry) = self.entries.get(id) {
                    rows.push(ManifestRow::from_entry(entry));
                }
            }
        }
        write_json_atomic(&self.manifest_path, &document)
    }

    /// Applies `change` and persists it, restoring the previous in-memory
    /// state if either step fails.
    fn mutate<T>(
        &mut self,
        change: impl FnOnce(&mut Self) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let entries = self.entries.clone();
        let index = self.index.clone();
        let outcome = change(self).and_then(|value| self.save().map(|()| value));
        if outcome.is_err() {
            self.entries = entries;
            self.index = index;
        }
        outcome
    }

    fn cloned(&self, id: &str) -> StoreResult<ImageEntry> {
        self.get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownImage(id.to_string()))
    }

    fn repack_pages(&mut self) {
        if let Some(ids) = self.index.get(&Category::Page) {
            for (position, id) in ids.iter().enumerate() {
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.order = Some(position as u32 + 1);
                }
            }
        }
    }

    fn check_loaded(&self, entry: &ImageEntry) -> Option<InconsistentState> {
        if self.entries.contains_key(&entry.id) {
            return Some(InconsistentState::DuplicateId {
                id: entry.id.clone(),
            });
        }
        if !is_contained(&entry.relative_path) {
            return Some(InconsistentState::OutsideProject {
                id: entry.id.clone(),
                relative_path: entry.relative_path.clone(),
            });
        }
        if !self.root.join(&entry.relative_path).is_file() {
            return Some(InconsistentState::MissingFile {
                id: entry.id.clone(),
                relative_path: entry.relative_path.clone(),
            });
        }
        None
    }
}

fn validate_permutation(current: &[String], proposed: &[String]) -> StoreResult<()> {
    let known: BTreeSet<&str> = current.iter().map(String::as_str).collect();
    let mut seen = BTreeSet::new();
    for id in proposed {
        if !known.contains(id.as_str()) {
            return Err(StoreError::Validation(format!("{id} is not a page")));
        }
        if !seen.insert(id.as_str()) {
            return Err(StoreError::Validation(format!(
                "page {id} appears more than once in the new order"
            )));
        }
    }
    let missing: Vec<&str> = known.difference(&seen).copied().collect();
    if !missing.is_empty() {
        return Err(StoreError::Validation(format!(
            "new page order is missing {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

fn is_contained(relative_path: &str) -> bool {
    let path = Path::new(relative_path);
    !relative_path.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
