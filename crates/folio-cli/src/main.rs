mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use folio_contracts::catalog::{Category, ImageEntry};
use folio_contracts::prompts::{PromptSource, PromptTable};
use folio_contracts::settings::{AspectRatio, ImageSize, SettingsStore, SETTINGS_FILE};
use folio_engine::{
    DryrunProvider, GeminiProvider, GenerationError, GenerationMode, GenerationOutcome,
    GenerationRequest, ImageProvider, Orchestrator, Project, Subject,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::logging::{init_logging, LogFormat};

/// How many times a generated image whose storage failed is offered back to
/// the store before giving up.
const PERSIST_RETRIES: usize = 2;

#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Illustrated book workspace: catalog, generate and rework images")]
struct Cli {
    /// Project folder holding references/, characters/ and pages/.
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,
    /// Settings file. Defaults to the platform config directory, else the
    /// project folder.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// AI prompt config. Defaults to FOLIO_AI_CONFIG, then the project folder.
    #[arg(long, global = true)]
    ai_config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = ProviderKind::Gemini)]
    provider: ProviderKind,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    Gemini,
    Dryrun,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the project layout and an empty catalog.
    Init,
    Import(ImportArgs),
    Generate(GenerateArgs),
    Rework(ReworkArgs),
    List(ListArgs),
    Move(MoveArgs),
    Delete(DeleteArgs),
    Reorder(ReorderArgs),
    Usage(UsageArgs),
    Settings(SettingsArgs),
}

#[derive(Debug, Parser)]
struct ImportArgs {
    source: PathBuf,
    #[arg(long, default_value = "reference")]
    category: Category,
}

#[derive(Debug, Parser)]
struct StyleArgs {
    /// Reference image; repeat for several.
    #[arg(long = "reference")]
    references: Vec<PathBuf>,
    #[arg(long)]
    sketch: Option<PathBuf>,
    /// Overrides the style prompt from settings.
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    aspect_ratio: Option<AspectRatio>,
    #[arg(long)]
    image_size: Option<ImageSize>,
    /// Category the result is filed under.
    #[arg(long)]
    category: Option<Category>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    prompt: String,
    #[arg(long, default_value = "page")]
    subject: Subject,
    #[command(flatten)]
    style: StyleArgs,
}

#[derive(Debug, Parser)]
struct ReworkArgs {
    /// Image id or path of a cataloged image.
    source: String,
    prompt: String,
    #[command(flatten)]
    style: StyleArgs,
}

#[derive(Debug, Parser)]
struct ListArgs {
    #[arg(long)]
    category: Option<Category>,
}

#[derive(Debug, Parser)]
struct MoveArgs {
    id: String,
    category: Category,
}

#[derive(Debug, Parser)]
struct DeleteArgs {
    id: String,
}

#[derive(Debug, Parser)]
struct ReorderArgs {
    /// Every page id, in the new order.
    ids: Vec<String>,
}

#[derive(Debug, Parser)]
struct UsageArgs {
    #[arg(long)]
    reset: bool,
}

#[derive(Debug, Parser)]
struct SettingsArgs {
    #[command(subcommand)]
    action: SettingsAction,
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    Show,
    /// Set one key, e.g. `aspect_ratio 4:3` or `system_prompt.page "..."`.
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("folio error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let is_init = matches!(cli.command, Command::Init);
    let log_root = (is_init || cli.project.is_dir()).then_some(cli.project.as_path());
    init_logging(log_root, cli.log_format, cli.verbose)?;

    if is_init {
        Project::init(&cli.project)?;
        print_json(&json!({ "root": cli.project }))?;
        return Ok(0);
    }

    let project = Arc::new(open_project(&cli)?);
    match cli.command {
        Command::Init => {}
        Command::Import(args) => {
            let entry = project.import(&args.source, args.category)?;
            print_json(&serde_json::to_value(&entry)?)?;
        }
        Command::Generate(args) => {
            let orchestrator = Orchestrator::new(project.clone(), provider_for(cli.provider)?);
            let request = create_request(&project, args)?;
            let outcome = generate_with_retry(&orchestrator, request).await?;
            print_json(&outcome_json(&outcome))?;
        }
        Command::Rework(args) => {
            let orchestrator = Orchestrator::new(project.clone(), provider_for(cli.provider)?);
            let request = rework_request(&project, args)?;
            let outcome = generate_with_retry(&orchestrator, request).await?;
            print_json(&outcome_json(&outcome))?;
        }
        Command::List(args) => {
            let categories = match args.category {
                Some(category) => vec![category],
                None => Category::ALL.to_vec(),
            };
            let mut listing = serde_json::Map::new();
            for category in categories {
                let entries = project.list(category)?;
                listing.insert(category.dir_name().to_string(), serde_json::to_value(entries)?);
            }
            print_json(&Value::Object(listing))?;
        }
        Command::Move(args) => {
            let entry = project.move_image(&args.id, args.category)?;
            print_json(&serde_json::to_value(&entry)?)?;
        }
        Command::Delete(args) => {
            let removed = project.delete_image(&args.id)?;
            if removed.is_none() {
                info!(id = %args.id, "nothing to delete");
            }
            print_json(&json!({ "deleted": removed }))?;
        }
        Command::Reorder(args) => {
            project.reorder_pages(&args.ids)?;
            print_json(&serde_json::to_value(project.list(Category::Page)?)?)?;
        }
        Command::Usage(args) => {
            let ledger = if args.reset {
                let previous = project.reset_usage()?;
                let current = project.usage()?;
                json!({ "previous": previous, "current": current })
            } else {
                serde_json::to_value(project.usage()?)?
            };
            print_json(&ledger)?;
        }
        Command::Settings(args) => {
            let settings = match args.action {
                SettingsAction::Show => project.settings()?,
                SettingsAction::Set { key, value } => project.assign_setting(&key, &value)?,
            };
            let path = project.settings_path()?;
            print_json(&json!({ "path": path, "settings": settings }))?;
        }
    }
    Ok(0)
}

fn open_project(cli: &Cli) -> Result<Project> {
    let root = cli.project.as_path();
    if !root.is_dir() {
        bail!(
            "project folder {} does not exist (run `folio init` first)",
            root.display()
        );
    }
    let settings_path = cli
        .settings
        .clone()
        .or_else(SettingsStore::default_path)
        .unwrap_or_else(|| root.join(SETTINGS_FILE));
    let prompts = PromptSource::File(PromptTable::resolve_path(cli.ai_config.as_deref(), root));

    let (project, report) = Project::open(root, &settings_path, prompts)
        .with_context(|| format!("failed to open project {}", root.display()))?;
    for problem in &report.inconsistencies {
        warn!(%problem, "catalog entry skipped");
    }
    Ok(project)
}

fn provider_for(kind: ProviderKind) -> Result<Arc<dyn ImageProvider>> {
    let provider: Arc<dyn ImageProvider> = match kind {
        ProviderKind::Gemini => Arc::new(GeminiProvider::from_env()?),
        ProviderKind::Dryrun => Arc::new(DryrunProvider),
    };
    Ok(provider)
}

fn create_request(project: &Project, args: GenerateArgs) -> Result<GenerationRequest> {
    let settings = project.settings()?;
    let default_ratio = match args.subject {
        Subject::CharacterSheet => settings.character_sheet_ratio(),
        Subject::Page => settings.aspect_ratio,
    };
    let request = GenerationRequest::create(args.subject, args.prompt);
    Ok(apply_style(request, args.style, default_ratio, &settings.style_prompt))
}

fn rework_request(project: &Project, args: ReworkArgs) -> Result<GenerationRequest> {
    let settings = project.settings()?;
    let source = resolve_source(project, &args.source)?;
    let default_ratio = match source.category {
        Category::Character => settings.character_sheet_ratio(),
        Category::Reference | Category::Page => settings.aspect_ratio,
    };
    let request = GenerationRequest::rework(project.root().join(&source.relative_path), args.prompt);
    Ok(apply_style(request, args.style, default_ratio, &settings.style_prompt))
}

fn apply_style(
    mut request: GenerationRequest,
    style: StyleArgs,
    default_ratio: AspectRatio,
    default_style: &str,
) -> GenerationRequest {
    request = request
        .with_references(style.references)
        .with_style(style.style.unwrap_or_else(|| default_style.to_string()))
        .with_aspect_ratio(style.aspect_ratio.unwrap_or(default_ratio));
    if let Some(sketch) = style.sketch {
        request = request.with_sketch(sketch);
    }
    if let Some(size) = style.image_size {
        request = request.with_image_size(size);
    }
    if let Some(category) = style.category {
        request = request.with_target_category(category);
    }
    request
}

/// Accepts either a catalog id or a path to a cataloged file.
fn resolve_source(project: &Project, source: &str) -> Result<ImageEntry> {
    if let Some(entry) = project.get(source)? {
        return Ok(entry);
    }
    match project.find_by_path(Path::new(source))? {
        Some(entry) => Ok(entry),
        None => bail!("{source} is neither an image id nor a cataloged image path"),
    }
}

async fn generate_with_retry(
    orchestrator: &Orchestrator,
    request: GenerationRequest,
) -> Result<GenerationOutcome> {
    let mut attempt = match request.mode {
        GenerationMode::Create => orchestrator.generate(request).await,
        GenerationMode::Rework => orchestrator.rework(request).await,
    };
    for retry in 1..=PERSIST_RETRIES {
        match attempt {
            Err(GenerationError::Persistence { reason, pending }) => {
                warn!(retry, %reason, "retrying storage of generated image");
                attempt = orchestrator.retry_persistence(*pending).await;
            }
            other => return other.map_err(anyhow::Error::from),
        }
    }
    attempt.map_err(anyhow::Error::from)
}

fn outcome_json(outcome: &GenerationOutcome) -> Value {
    json!({
        "entry": outcome.entry,
        "full_res_path": outcome.full_res_path,
        "thumbnail_path": outcome.thumbnail_path,
        "model": outcome.model,
        "usage": outcome.usage,
        "receipt_path": outcome.receipt_path,
        "notes": outcome.notes,
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use folio_contracts::catalog::Category;
    use folio_contracts::settings::AspectRatio;

    use super::{Cli, Command, ProviderKind};

    #[test]
    fn generate_arguments_parse() {
        let cli = Cli::try_parse_from([
            "folio",
            "--project",
            "book",
            "--provider",
            "dryrun",
            "generate",
            "a fox in a forest",
            "--aspect-ratio",
            "3:4",
            "--reference",
            "a.png",
            "--reference",
            "b.png",
        ])
        .expect("parse");
        assert_eq!(cli.provider, ProviderKind::Dryrun);
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.prompt, "a fox in a forest");
        assert_eq!(args.style.aspect_ratio, Some(AspectRatio::Portrait));
        assert_eq!(args.style.references.len(), 2);
    }

    #[test]
    fn move_takes_category_names() {
        let cli = Cli::try_parse_from(["folio", "move", "abc", "page"]).expect("parse");
        let Command::Move(args) = cli.command else {
            panic!("expected move");
        };
        assert_eq!(args.category, Category::Page);
        assert!(Cli::try_parse_from(["folio", "move", "abc", "poster"]).is_err());
    }
}
