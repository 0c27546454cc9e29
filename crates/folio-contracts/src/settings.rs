use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::atomic::{read_json, write_json_atomic};
use crate::error::{StoreError, StoreResult};
use crate::prompts::PromptKey;
use crate::usage::{TokenUsage, UsageLedger};

pub const SETTINGS_FILE: &str = "settings.json";

pub const DEFAULT_TOP_P: f32 = 0.95;
pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[default]
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "16:9")]
    Wide,
    #[serde(rename = "9:16")]
    Tall,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        AspectRatio::Square,
        AspectRatio::Portrait,
        AspectRatio::Landscape,
        AspectRatio::Wide,
        AspectRatio::Tall,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait => "3:4",
            AspectRatio::Landscape => "4:3",
            AspectRatio::Wide => "16:9",
            AspectRatio::Tall => "9:16",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim();
        AspectRatio::ALL
            .into_iter()
            .find(|ratio| ratio.as_str() == wanted)
            .ok_or_else(|| {
                StoreError::Validation(format!(
                    "unsupported aspect ratio '{wanted}' (expected one of 1:1, 3:4, 4:3, 16:9, 9:16)"
                ))
            })
    }
}

/// Output resolution hint passed to the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageSize {
    #[serde(rename = "1K")]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[default]
    #[serde(rename = "4K")]
    FourK,
}

impl ImageSize {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageSize::OneK => "1K",
            ImageSize::TwoK => "2K",
            ImageSize::FourK => "4K",
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageSize {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "1K" => Ok(ImageSize::OneK),
            "2K" => Ok(ImageSize::TwoK),
            "4K" => Ok(ImageSize::FourK),
            other => Err(StoreError::Validation(format!(
                "unsupported image size '{other}' (expected 1K, 2K or 4K)"
            ))),
        }
    }
}

/// Non-secret user settings plus the usage ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_folder: Option<PathBuf>,
    pub aspect_ratio: AspectRatio,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_sheet_aspect_ratio: Option<AspectRatio>,
    pub style_prompt: String,
    pub image_size: ImageSize,
    pub top_p: f32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
    pub system_prompt_overrides: BTreeMap<String, String>,
    pub usage: UsageLedger,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            working_folder: None,
            aspect_ratio: AspectRatio::default(),
            character_sheet_aspect_ratio: None,
            style_prompt: String::new(),
            image_size: ImageSize::default(),
            top_p: DEFAULT_TOP_P,
            temperature: DEFAULT_TEMPERATURE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            system_prompt_overrides: BTreeMap::new(),
            usage: UsageLedger::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> StoreResult<()> {
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(StoreError::Validation(format!(
                "top_p must be between 0 and 1, got {}",
                self.top_p
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(StoreError::Validation(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(StoreError::Validation(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        for key in self.system_prompt_overrides.keys() {
            key.parse::<PromptKey>()?;
        }
        Ok(())
    }

    /// Aspect ratio for a character sheet, falling back to the general one.
    pub fn character_sheet_ratio(&self) -> AspectRatio {
        self.character_sheet_aspect_ratio
            .unwrap_or(self.aspect_ratio)
    }

    /// Applies a `key=value` style assignment. `system_prompt.<key>` sets an
    /// override; an empty value clears optional fields.
    pub fn assign(&mut self, key: &str, value: &str) -> StoreResult<()> {
        let value = value.trim();
        match key.trim() {
            "working_folder" => {
                self.working_folder = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "aspect_ratio" => self.aspect_ratio = value.parse()?,
            "character_sheet_aspect_ratio" => {
                self.character_sheet_aspect_ratio = if value.is_empty() {
                    None
                } else {
                    Some(value.parse()?)
                };
            }
            "style_prompt" => self.style_prompt = value.to_string(),
            "image_size" => self.image_size = value.parse()?,
            "top_p" => self.top_p = parse_number(key, value)?,
            "temperature" => self.temperature = parse_number(key, value)?,
            "request_timeout_secs" => self.request_timeout_secs = parse_number(key, value)?,
            other => {
                let Some(prompt) = other.strip_prefix("system_prompt.") else {
                    return Err(StoreError::Validation(format!("unknown setting '{other}'")));
                };
                let prompt_key = prompt.parse::<PromptKey>()?;
                if value.is_empty() {
                    self.system_prompt_overrides.remove(prompt_key.as_str());
                } else {
                    self.system_prompt_overrides
                        .insert(prompt_key.as_str().to_string(), value.to_string());
                }
            }
        }
        self.validate()
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> StoreResult<T> {
    value
        .parse()
        .map_err(|_| StoreError::Validation(format!("{key} expects a number, got '{value}'")))
}

/// `settings.json` on disk plus its loaded contents.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl SettingsStore {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "folio").map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
    }

    /// Loads settings, starting from defaults when the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let settings = read_json::<Settings>(&path)?.unwrap_or_default();
        settings.validate()?;
        Ok(Self { path, settings })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn usage(&self) -> &UsageLedger {
        &self.settings.usage
    }

    pub fn save(&self) -> StoreResult<()> {
        write_json_atomic(&self.path, &self.settings)
    }

    /// Applies `change`, validates and saves; the in-memory settings are left
    /// untouched if any step fails.
    pub fn update(&mut self, change: impl FnOnce(&mut Settings) -> StoreResult<()>) -> StoreResult<()> {
        let mut next = self.settings.clone();
        change(&mut next)?;
        next.validate()?;
        write_json_atomic(&self.path, &next)?;
        self.settings = next;
        Ok(())
    }

    pub fn assign(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.update(|settings| settings.assign(key, value))?;
        info!(key, "setting updated");
        Ok(())
    }

    pub fn record_usage(&mut self, model: &str, usage: TokenUsage) -> StoreResult<()> {
        self.update(|settings| {
            settings.usage.record(model, usage);
            Ok(())
        })
    }

    /// Zeroes the ledger and returns what it held before.
    pub fn reset_usage(&mut self) -> StoreResult<UsageLedger> {
        let previous = self.settings.usage.snapshot();
        self.update(|settings| {
            settings.usage.reset();
            Ok(())
        })?;
        info!(since = %self.settings.usage.since(), "usage ledger reset");
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{AspectRatio, ImageSize, Settings, SettingsStore};
    use crate::usage::TokenUsage;
    use crate::StoreError;

    #[test]
    fn defaults_follow_the_application() {
        let settings = Settings::default();
        assert_eq!(settings.aspect_ratio, AspectRatio::Portrait);
        assert_eq!(settings.image_size, ImageSize::FourK);
        assert_eq!(settings.top_p, 0.95);
        assert_eq!(settings.temperature, 1.0);
        assert_eq!(settings.request_timeout_secs, 180);
        assert_eq!(settings.character_sheet_ratio(), AspectRatio::Portrait);
    }

    #[test]
    fn aspect_ratios_parse_and_render() -> anyhow::Result<()> {
        assert_eq!("16:9".parse::<AspectRatio>()?, AspectRatio::Wide);
        assert!("2:3".parse::<AspectRatio>().is_err());
        assert_eq!(serde_json::to_string(&AspectRatio::Tall)?, "\"9:16\"");
        assert_eq!("2k".parse::<ImageSize>()?, ImageSize::TwoK);
        Ok(())
    }

    #[test]
    fn assign_validates_ranges_and_keys() -> anyhow::Result<()> {
        let mut settings = Settings::default();
        settings.assign("temperature", "1.5")?;
        assert_eq!(settings.temperature, 1.5);
        assert!(matches!(
            settings.assign("top_p", "1.5"),
            Err(StoreError::Validation(_))
        ));
        assert!(settings.assign("top_p", "lots").is_err());
        assert!(settings.assign("colour", "red").is_err());

        settings.assign("system_prompt.page", "Soft pencil shading.")?;
        assert_eq!(
            settings.system_prompt_overrides.get("page").map(String::as_str),
            Some("Soft pencil shading.")
        );
        settings.assign("system_prompt.page", "")?;
        assert!(settings.system_prompt_overrides.is_empty());
        assert!(settings.assign("system_prompt.cover", "x").is_err());

        settings.assign("character_sheet_aspect_ratio", "1:1")?;
        assert_eq!(settings.character_sheet_ratio(), AspectRatio::Square);
        Ok(())
    }

    #[test]
    fn store_persists_and_rejects_invalid_updates() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("settings.json");
        let mut store = SettingsStore::load(&path)?;
        store.assign("style_prompt", "loose ink and watercolor")?;
        store.record_usage("gemini-3-pro-image-preview", TokenUsage::new(10, 20, 30))?;

        assert!(store.assign("temperature", "3").is_err());
        assert_eq!(store.settings().temperature, 1.0);

        let reloaded = SettingsStore::load(&path)?;
        assert_eq!(reloaded.settings().style_prompt, "loose ink and watercolor");
        assert_eq!(reloaded.usage().totals(), TokenUsage::new(10, 20, 30));
        Ok(())
    }

    #[test]
    fn reset_usage_returns_previous_snapshot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = SettingsStore::load(temp.path().join("settings.json"))?;
        store.record_usage("m", TokenUsage::new(1, 2, 3))?;
        let previous = store.reset_usage()?;
        assert_eq!(previous.totals(), TokenUsage::new(1, 2, 3));
        assert!(store.usage().totals().is_zero());
        Ok(())
    }

    #[test]
    fn malformed_settings_are_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("settings.json");
        fs::write(&path, "{\"top_p\": \"high\"}")?;
        assert!(matches!(SettingsStore::load(&path), Err(StoreError::Json { .. })));
        Ok(())
    }

    #[test]
    fn partial_documents_fill_in_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("settings.json");
        fs::write(&path, "{\"aspect_ratio\": \"4:3\"}")?;
        let store = SettingsStore::load(&path)?;
        assert_eq!(store.settings().aspect_ratio, AspectRatio::Landscape);
        assert_eq!(store.settings().image_size, ImageSize::FourK);
        Ok(())
    }
}
