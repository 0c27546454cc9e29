use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{Category, ImageEntry};

pub const MANIFEST_SCHEMA_VERSION: u64 = 1;

/// On-disk shape of `catalog.json`: one list of rows per category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ManifestDocument {
    #[serde(default = "default_schema_version")]
    pub schema_version: u64,
    #[serde(default)]
    pub references: Vec<ManifestRow>,
    #[serde(default)]
    pub characters: Vec<ManifestRow>,
    #[serde(default)]
    pub pages: Vec<ManifestRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ManifestRow {
    pub id: String,
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ManifestDocument {
    pub fn empty() -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            references: Vec::new(),
            characters: Vec::new(),
            pages: Vec::new(),
        }
    }

    pub fn rows(&self, category: Category) -> &[ManifestRow] {
        match category {
            Category::Reference => &self.references,
            Category::Character => &self.characters,
            Category::Page => &self.pages,
        }
    }

    pub fn rows_mut(&mut self, category: Category) -> &mut Vec<ManifestRow> {
        match category {
            Category::Reference => &mut self.references,
            Category::Character => &mut self.characters,
            Category::Page => &mut self.pages,
        }
    }
}

impl ManifestRow {
    pub fn from_entry(entry: &ImageEntry) -> Self {
        Self {
            id: entry.id.clone(),
            relative_path: entry.relative_path.clone(),
            order: entry.order,
            created_at: Some(entry.created_at),
        }
    }

    pub fn into_entry(self, category: Category) -> ImageEntry {
        ImageEntry {
            id: self.id,
            relative_path: super::entry::normalize_relative(&self.relative_path),
            category,
            order: if category == Category::Page {
                self.order
            } else {
                None
            },
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

fn default_schema_version() -> u64 {
    MANIFEST_SCHEMA_VERSION
}
