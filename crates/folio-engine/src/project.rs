//! A project folder opened for editing: the shared state every operation
//! goes through.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use folio_contracts::activity::{Activity, ActivityLog};
use folio_contracts::catalog::{Catalog, Category, ImageEntry, LoadReport};
use folio_contracts::prompts::PromptSource;
use folio_contracts::settings::{Settings, SettingsStore};
use folio_contracts::usage::{TokenUsage, UsageLedger};
use folio_contracts::{StoreError, StoreResult};
use tracing::{info, warn};

use crate::assets::AssetWriter;

pub struct Project {
    root: PathBuf,
    catalog: Mutex<Catalog>,
    settings: Mutex<SettingsStore>,
    assets: AssetWriter,
    activity: ActivityLog,
    prompts: PromptSource,
}

impl Project {
    /// Creates the category directories and an empty catalog if missing.
    pub fn init(root: &Path) -> Result<()> {
        for category in Category::ALL {
            let dir = root.join(category.dir_name());
            fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let (catalog, _) = Catalog::open(root)?;
        if !catalog.manifest_path().exists() {
            catalog.save()?;
        }
        info!(root = %root.display(), "project initialised");
        Ok(())
    }

    /// Loads the catalog and settings. Entries whose thumbnail vanished get a
    /// new one; entries whose file vanished are reported in the load report.
    pub fn open(
        root: impl Into<PathBuf>,
        settings_path: impl Into<PathBuf>,
        prompts: PromptSource,
    ) -> StoreResult<(Self, LoadReport)> {
        let root = root.into();
        let (catalog, report) = Catalog::open(&root)?;
        let settings = SettingsStore::load(settings_path)?;
        let assets = AssetWriter::new(&root);

        for category in Category::ALL {
            for entry in catalog.list(category) {
                if let Err(err) = assets.ensure_thumbnail(&entry.relative_path) {
                    warn!(id = %entry.id, path = %entry.relative_path, error = %format!("{err:#}"), "thumbnail could not be regenerated");
                }
            }
        }

        let project = Self {
            activity: ActivityLog::for_project(&root),
            root,
            catalog: Mutex::new(catalog),
            settings: Mutex::new(settings),
            assets,
            prompts,
        };
        Ok((project, report))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn assets(&self) -> &AssetWriter {
        &self.assets
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn prompts(&self) -> &PromptSource {
        &self.prompts
    }

    pub fn list(&self, category: Category) -> StoreResult<Vec<ImageEntry>> {
        Ok(self.catalog()?.list(category))
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<ImageEntry>> {
        Ok(self.catalog()?.get(id).cloned())
    }

    pub fn find_by_path(&self, path: &Path) -> StoreResult<Option<ImageEntry>> {
        Ok(self.catalog()?.find_by_path(path).cloned())
    }

    pub fn page_ids(&self) -> StoreResult<Vec<String>> {
        Ok(self.catalog()?.page_ids())
    }

    /// Registers an artifact that already exists on disk.
    pub fn add_entry(&self, entry: ImageEntry) -> StoreResult<ImageEntry> {
        self.catalog()?.add(entry)
    }

    /// Copies an outside image into the project and catalogs it.
    pub fn import(&self, source: &Path, category: Category) -> Result<ImageEntry> {
        let asset = self.assets.import(source, category)?;
        let added = match self.add_entry(ImageEntry::new(&asset.relative_path, category)) {
            Ok(entry) => entry,
            Err(err) => {
                if let Err(cleanup) = self.assets.remove(&asset.relative_path) {
                    warn!(path = %asset.relative_path, error = %format!("{cleanup:#}"), "failed to discard imported image");
                }
                return Err(err.into());
            }
        };
        self.note(Activity::ImageAdded {
            image_id: added.id.clone(),
            category,
            path: added.relative_path.clone(),
        });
        Ok(added)
    }

    pub fn move_image(&self, id: &str, category: Category) -> StoreResult<ImageEntry> {
        let (from, moved) = {
            let mut catalog = self.catalog()?;
            let from = catalog
                .get(id)
                .map(|entry| entry.category)
                .ok_or_else(|| StoreError::UnknownImage(id.to_string()))?;
            (from, catalog.move_category(id, category, &self.assets)?)
        };
        if from != category {
            self.note(Activity::ImageMoved {
                image_id: moved.id.clone(),
                from,
                to: category,
                path: moved.relative_path.clone(),
            });
        }
        Ok(moved)
    }

    pub fn delete_image(&self, id: &str) -> StoreResult<Option<ImageEntry>> {
        let removed = self.catalog()?.delete(id, &self.assets)?;
        if let Some(entry) = &removed {
            self.note(Activity::ImageDeleted {
                image_id: entry.id.clone(),
                path: entry.relative_path.clone(),
            });
        }
        Ok(removed)
    }

    pub fn reorder_pages(&self, order: &[String]) -> StoreResult<()> {
        self.catalog()?.reorder_pages(order)?;
        self.note(Activity::PagesReordered {
            order: order.to_vec(),
        });
        Ok(())
    }

    pub fn settings(&self) -> StoreResult<Settings> {
        Ok(self.settings_store()?.settings().clone())
    }

    pub fn settings_path(&self) -> StoreResult<PathBuf> {
        Ok(self.settings_store()?.path().to_path_buf())
    }

    pub fn assign_setting(&self, key: &str, value: &str) -> StoreResult<Settings> {
        let mut store = self.settings_store()?;
        store.assign(key, value)?;
        Ok(store.settings().clone())
    }

    pub fn usage(&self) -> StoreResult<UsageLedger> {
        Ok(self.settings_store()?.usage().snapshot())
    }

    pub fn record_usage(&self, model: &str, usage: TokenUsage) -> StoreResult<()> {
        self.settings_store()?.record_usage(model, usage)
    }

    /// Zeroes the usage ledger; returns what it held.
    pub fn reset_usage(&self) -> StoreResult<UsageLedger> {
        let previous = self.settings_store()?.reset_usage()?;
        self.note(Activity::UsageReset {
            previous_total_tokens: previous.totals().total_tokens,
        });
        Ok(previous)
    }

    /// Appends to the activity log; a failed write is logged and otherwise
    /// ignored.
    pub(crate) fn note(&self, activity: Activity) {
        if let Err(err) = self.activity.record(&activity) {
            warn!(error = %err, "activity log write failed");
        }
    }

    fn catalog(&self) -> StoreResult<MutexGuard<'_, Catalog>> {
        self.catalog
            .lock()
            .map_err(|_| StoreError::Poisoned("catalog"))
    }

    fn settings_store(&self) -> StoreResult<MutexGuard<'_, SettingsStore>> {
        self.settings
            .lock()
            .map_err(|_| StoreError::Poisoned("settings"))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use folio_contracts::catalog::Category;
    use folio_contracts::prompts::{PromptSource, PromptTable};
    use folio_contracts::usage::TokenUsage;
    use folio_contracts::StoreError;
    use serde_json::Value;

    use super::Project;
    use crate::dryrun::render_solid_png;

    fn open(root: &std::path::Path) -> anyhow::Result<Project> {
        Project::init(root)?;
        let (project, report) = Project::open(
            root,
            root.join("settings.json"),
            PromptSource::Fixed(PromptTable::new("test-model")),
        )?;
        assert!(report.is_clean());
        Ok(project)
    }

    #[test]
    fn init_lays_out_category_directories() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        open(temp.path())?;
        for dir in ["references", "characters", "pages"] {
            assert!(temp.path().join(dir).is_dir());
        }
        assert!(temp.path().join("catalog.json").is_file());
        Ok(())
    }

    #[test]
    fn import_move_delete_are_logged() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let outside = tempfile::tempdir()?;
        let source = outside.path().join("sketch.png");
        fs::write(&source, render_solid_png(64, 32, (5, 5, 5))?)?;
        let project = open(temp.path())?;

        let imported = project.import(&source, Category::Reference)?;
        let moved = project.move_image(&imported.id, Category::Page)?;
        assert_eq!(moved.order, Some(1));
        assert_eq!(moved.relative_path, "pages/sketch.png");
        assert!(!temp.path().join("references/sketch.png").exists());
        assert!(temp.path().join(".thumbnails/pages/sketch.png").is_file());

        assert!(project.delete_image(&imported.id)?.is_some());
        assert!(project.delete_image(&imported.id)?.is_none());
        assert!(project.list(Category::Page)?.is_empty());

        let log = fs::read_to_string(project.activity().path())?;
        let kinds: Vec<String> = log
            .lines()
            .map(|line| serde_json::from_str::<Value>(line))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|value| value["type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(kinds, vec!["image_added", "image_moved", "image_deleted"]);
        Ok(())
    }

    #[test]
    fn reopening_heals_missing_thumbnails() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let outside = tempfile::tempdir()?;
        let source = outside.path().join("hero.png");
        fs::write(&source, render_solid_png(32, 32, (1, 1, 1))?)?;
        {
            let project = open(temp.path())?;
            project.import(&source, Category::Character)?;
        }
        let thumbnail = temp.path().join(".thumbnails/characters/hero.png");
        fs::remove_file(&thumbnail)?;

        open(temp.path())?;
        assert!(thumbnail.is_file());
        Ok(())
    }

    #[test]
    fn usage_reset_is_persisted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let project = open(temp.path())?;
        project.record_usage("m", TokenUsage::new(3, 4, 7))?;
        let previous = project.reset_usage()?;
        assert_eq!(previous.totals().total_tokens, 7);
        drop(project);

        let reopened = open(temp.path())?;
        assert!(reopened.usage()?.totals().is_zero());
        Ok(())
    }

    #[test]
    fn moving_unknown_image_is_reported() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let project = open(temp.path())?;
        assert!(matches!(
            project.move_image("ghost", Category::Page),
            Err(StoreError::UnknownImage(_))
        ));
        Ok(())
    }
}
