use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use folio_contracts::catalog::Category;
use folio_contracts::prompts::PromptKey;
use folio_contracts::settings::{AspectRatio, ImageSize};

use crate::error::GenerationError;

pub const MAX_PROMPT_CHARS: usize = 8000;
pub const MAX_REFERENCE_IMAGES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Create,
    Rework,
}

impl GenerationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationMode::Create => "create",
            GenerationMode::Rework => "rework",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    CharacterSheet,
    Page,
}

impl Subject {
    pub fn as_str(self) -> &'static str {
        match self {
            Subject::CharacterSheet => "character_sheet",
            Subject::Page => "page",
        }
    }

    /// Where a freshly generated image of this kind lands by default.
    pub fn default_category(self) -> Category {
        match self {
            Subject::CharacterSheet => Category::Character,
            Subject::Page => Category::Page,
        }
    }

    pub fn prompt_key(self) -> PromptKey {
        match self {
            Subject::CharacterSheet => PromptKey::CharacterSheet,
            Subject::Page => PromptKey::Page,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = GenerationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "character_sheet" | "character" => Ok(Subject::CharacterSheet),
            "page" => Ok(Subject::Page),
            other => Err(GenerationError::Validation(format!(
                "unknown subject '{other}' (expected character_sheet or page)"
            ))),
        }
    }
}

/// The system prompt a rework uses depends on where its result will live.
pub fn rework_prompt_key(category: Category) -> PromptKey {
    match category {
        Category::Page => PromptKey::ReworkPage,
        Category::Reference | Category::Character => PromptKey::ReworkCharacter,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub mode: GenerationMode,
    pub subject: Subject,
    pub prompt: String,
    pub reference_image_paths: Vec<PathBuf>,
    pub sketch_path: Option<PathBuf>,
    pub style_prompt: String,
    pub aspect_ratio: AspectRatio,
    /// Falls back to the project setting when unset.
    pub image_size: Option<ImageSize>,
    pub source_image_path: Option<PathBuf>,
    pub target_category: Option<Category>,
}

impl GenerationRequest {
    pub fn create(subject: Subject, prompt: impl Into<String>) -> Self {
        Self {
            mode: GenerationMode::Create,
            subject,
            prompt: prompt.into(),
            reference_image_paths: Vec::new(),
            sketch_path: None,
            style_prompt: String::new(),
            aspect_ratio: AspectRatio::default(),
            image_size: None,
            source_image_path: None,
            target_category: None,
        }
    }

    pub fn rework(source_image_path: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            mode: GenerationMode::Rework,
            source_image_path: Some(source_image_path.into()),
            ..Self::create(Subject::Page, prompt)
        }
    }

    pub fn with_references(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.reference_image_paths = paths.into_iter().collect();
        self
    }

    pub fn with_sketch(mut self, path: impl Into<PathBuf>) -> Self {
        self.sketch_path = Some(path.into());
        self
    }

    pub fn with_style(mut self, style_prompt: impl Into<String>) -> Self {
        self.style_prompt = style_prompt.into();
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: AspectRatio) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    pub fn with_image_size(mut self, image_size: ImageSize) -> Self {
        self.image_size = Some(image_size);
        self
    }

    pub fn with_target_category(mut self, category: Category) -> Self {
        self.target_category = Some(category);
        self
    }

    pub fn prompt_text(&self) -> &str {
        self.prompt.trim()
    }

    /// Checks everything that can be checked without touching the provider.
    /// The source image of a rework is resolved against the project later.
    pub fn validate(&self) -> Result<(), GenerationError> {
        let prompt = self.prompt_text();
        if prompt.is_empty() {
            return Err(invalid("prompt must not be empty"));
        }
        let chars = prompt.chars().count();
        if chars > MAX_PROMPT_CHARS {
            return Err(invalid(format!(
                "prompt is {chars} characters; the limit is {MAX_PROMPT_CHARS}"
            )));
        }

        match (self.mode, &self.source_image_path) {
            (GenerationMode::Create, Some(_)) => {
                return Err(invalid("a source image is only allowed when reworking"))
            }
            (GenerationMode::Rework, None) => {
                return Err(invalid("rework needs a source image"))
            }
            _ => {}
        }

        if self.reference_image_paths.len() > MAX_REFERENCE_IMAGES {
            return Err(invalid(format!(
                "{} reference images given; the limit is {MAX_REFERENCE_IMAGES}",
                self.reference_image_paths.len()
            )));
        }
        for path in &self.reference_image_paths {
            require_file(path, "reference image")?;
        }
        if let Some(sketch) = &self.sketch_path {
            require_file(sketch, "sketch")?;
        }
        Ok(())
    }
}

fn require_file(path: &Path, what: &str) -> Result<(), GenerationError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(invalid(format!("{what} {} is not a file", path.display()))),
        Err(err) => Err(invalid(format!(
            "{what} {} is not readable: {err}",
            path.display()
        ))),
    }
}

fn invalid(message: impl Into<String>) -> GenerationError {
    GenerationError::Validation(message.into())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use folio_contracts::catalog::Category;
    use folio_contracts::prompts::PromptKey;

    use super::{rework_prompt_key, GenerationRequest, Subject, MAX_PROMPT_CHARS};
    use crate::error::GenerationError;

    fn is_validation(result: Result<(), GenerationError>) -> bool {
        matches!(result, Err(GenerationError::Validation(_)))
    }

    #[test]
    fn prompt_must_have_content_within_limit() {
        assert!(is_validation(
            GenerationRequest::create(Subject::Page, "   ").validate()
        ));
        let long = "x".repeat(MAX_PROMPT_CHARS + 1);
        assert!(is_validation(
            GenerationRequest::create(Subject::Page, long).validate()
        ));
        let exact = "x".repeat(MAX_PROMPT_CHARS);
        assert!(GenerationRequest::create(Subject::Page, exact)
            .validate()
            .is_ok());
    }

    #[test]
    fn references_must_exist_and_stay_under_the_cap() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let reference = temp.path().join("fox.png");
        fs::write(&reference, b"png")?;

        let ok = GenerationRequest::create(Subject::Page, "a fox in a forest")
            .with_references(vec![reference.clone()]);
        assert!(ok.validate().is_ok());

        let missing = GenerationRequest::create(Subject::Page, "a fox")
            .with_references(vec![temp.path().join("nope.png")]);
        assert!(is_validation(missing.validate()));

        let too_many = GenerationRequest::create(Subject::Page, "a fox")
            .with_references(vec![reference; 17]);
        assert!(is_validation(too_many.validate()));

        let sketch = GenerationRequest::create(Subject::Page, "a fox")
            .with_sketch(temp.path().join("sketch.png"));
        assert!(is_validation(sketch.validate()));
        Ok(())
    }

    #[test]
    fn source_image_only_with_rework() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("page_003.png");
        fs::write(&source, b"png")?;

        assert!(GenerationRequest::rework(&source, "pinker sky")
            .validate()
            .is_ok());
        assert!(GenerationRequest::rework("pages/page_003.png", "pinker sky")
            .validate()
            .is_ok());
        let mut create = GenerationRequest::create(Subject::Page, "pinker sky");
        create.source_image_path = Some(source);
        assert!(is_validation(create.validate()));
        Ok(())
    }

    #[test]
    fn subjects_map_to_categories_and_prompts() -> anyhow::Result<()> {
        assert_eq!(Subject::CharacterSheet.default_category(), Category::Character);
        assert_eq!(Subject::Page.default_category(), Category::Page);
        assert_eq!("character-sheet".parse::<Subject>()?, Subject::CharacterSheet);
        assert_eq!(rework_prompt_key(Category::Page), PromptKey::ReworkPage);
        assert_eq!(rework_prompt_key(Category::Reference), PromptKey::ReworkCharacter);
        Ok(())
    }
}
