//! The prompt/model table that lives outside the code (`ai_config.json`).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::atomic::read_json;
use crate::error::{StoreError, StoreResult};

pub const AI_CONFIG_FILE: &str = "ai_config.json";
pub const AI_CONFIG_ENV: &str = "FOLIO_AI_CONFIG";

pub const DEFAULT_STYLE_PREFIX: &str = "Style: {style_prompt}";
pub const DEFAULT_REWORK_INSTRUCTION: &str =
    "Original image is provided as the first reference. Requested changes: {prompt}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKey {
    CharacterSheet,
    Page,
    ReworkCharacter,
    ReworkPage,
}

impl PromptKey {
    pub const ALL: [PromptKey; 4] = [
        PromptKey::CharacterSheet,
        PromptKey::Page,
        PromptKey::ReworkCharacter,
        PromptKey::ReworkPage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PromptKey::CharacterSheet => "character_sheet",
            PromptKey::Page => "page",
            PromptKey::ReworkCharacter => "rework_character",
            PromptKey::ReworkPage => "rework_page",
        }
    }
}

impl fmt::Display for PromptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptKey {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim();
        PromptKey::ALL
            .into_iter()
            .find(|key| key.as_str() == wanted)
            .ok_or_else(|| StoreError::Validation(format!("unknown system prompt key '{wanted}'")))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawTable {
    #[serde(default)]
    models: BTreeMap<String, String>,
    #[serde(default)]
    system_prompts: BTreeMap<String, String>,
    #[serde(default)]
    templates: RawTemplates,
}

#[derive(Debug, Default, Deserialize)]
struct RawTemplates {
    style_prefix: Option<String>,
    rework_instruction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTable {
    image_model: String,
    system_prompts: BTreeMap<PromptKey, String>,
    style_prefix: String,
    rework_instruction: String,
}

impl PromptTable {
    pub fn new(image_model: impl Into<String>) -> Self {
        Self {
            image_model: image_model.into(),
            system_prompts: BTreeMap::new(),
            style_prefix: DEFAULT_STYLE_PREFIX.to_string(),
            rework_instruction: DEFAULT_REWORK_INSTRUCTION.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, key: PromptKey, text: impl Into<String>) -> Self {
        self.system_prompts.insert(key, text.into());
        self
    }

    /// Explicit path, then `FOLIO_AI_CONFIG`, then `<project>/ai_config.json`.
    pub fn resolve_path(explicit: Option<&Path>, project_root: &Path) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var(AI_CONFIG_ENV) {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
            _ => project_root.join(AI_CONFIG_FILE),
        }
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let raw: RawTable = read_json(path)?.ok_or_else(|| {
            StoreError::Config(format!("prompt table not found at {}", path.display()))
        })?;

        let image_model = raw
            .models
            .get("image_generation")
            .map(|model| model.trim())
            .filter(|model| !model.is_empty())
            .ok_or_else(|| {
                StoreError::Config(format!(
                    "{} does not name models.image_generation",
                    path.display()
                ))
            })?;

        let mut table = PromptTable::new(image_model);
        for (name, text) in raw.system_prompts {
            match name.parse::<PromptKey>() {
                Ok(key) => {
                    table.system_prompts.insert(key, text);
                }
                Err(_) => warn!(key = %name, path = %path.display(), "ignoring unknown system prompt"),
            }
        }
        if let Some(template) = raw.templates.style_prefix.filter(|t| !t.trim().is_empty()) {
            table.style_prefix = template;
        }
        if let Some(template) = raw
            .templates
            .rework_instruction
            .filter(|t| !t.trim().is_empty())
        {
            table.rework_instruction = template;
        }
        Ok(table)
    }

    pub fn image_model(&self) -> &str {
        &self.image_model
    }

    /// A non-empty project override wins over the table entry.
    pub fn system_prompt(
        &self,
        key: PromptKey,
        overrides: &BTreeMap<String, String>,
    ) -> Option<String> {
        overrides
            .get(key.as_str())
            .or_else(|| self.system_prompts.get(&key))
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }

    pub fn style_prefix(&self, style_prompt: &str) -> Option<String> {
        let style = style_prompt.trim();
        if style.is_empty() {
            return None;
        }
        Some(self.style_prefix.replace("{style_prompt}", style))
    }

    pub fn rework_instruction(&self, prompt: &str) -> String {
        self.rework_instruction.replace("{prompt}", prompt.trim())
    }
}

/// Where the orchestrator gets its prompt table from on each call.
#[derive(Debug, Clone)]
pub enum PromptSource {
    File(PathBuf),
    Fixed(PromptTable),
}

impl PromptSource {
    pub fn resolve(&self) -> StoreResult<PromptTable> {
        match self {
            PromptSource::File(path) => PromptTable::load(path),
            PromptSource::Fixed(table) => Ok(table.clone()),
        }
    }
}
