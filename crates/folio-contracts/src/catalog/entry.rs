use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Reference,
    Character,
    Page,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Reference, Category::Character, Category::Page];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Reference => "reference",
            Category::Character => "character",
            Category::Page => "page",
        }
    }

    /// Directory under the project root holding this category's artifacts.
    pub fn dir_name(self) -> &'static str {
        match self {
            Category::Reference => "references",
            Category::Character => "characters",
            Category::Page => "pages",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reference" | "references" => Ok(Category::Reference),
            "character" | "characters" => Ok(Category::Character),
            "page" | "pages" => Ok(Category::Page),
            other => Err(StoreError::Validation(format!(
                "unknown category '{other}' (expected reference, character or page)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub id: String,
    pub relative_path: String,
    pub category: Category,
    /// Print position, only set for pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl ImageEntry {
    pub fn new(relative_path: impl Into<String>, category: Category) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            relative_path: normalize_relative(&relative_path.into()),
            category,
            order: None,
            created_at: Utc::now(),
        }
    }

    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(self.relative_path.as_str())
    }

    pub fn stem(&self) -> &str {
        Path::new(self.file_name())
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_else(|| self.file_name())
    }
}

/// Forward-slash form of a project-relative path.
pub fn normalize_relative(raw: &str) -> String {
    raw.trim()
        .replace('\\', "/")
        .trim_start_matches("./")
        .to_string()
}
