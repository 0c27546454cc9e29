//! End-to-end runs against a temporary project using the offline provider.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use folio_contracts::catalog::{Category, ImageEntry};
use folio_contracts::prompts::{PromptSource, PromptTable};
use folio_contracts::settings::AspectRatio;
use folio_contracts::StoreError;
use folio_engine::assets::THUMBNAIL_MAX_EDGE;
use folio_engine::{DryrunProvider, GenerationRequest, Orchestrator, Project, Subject};
use image::{GenericImageView, Rgb, RgbImage};

const MODEL: &str = "gemini-3-pro-image-preview";

fn open_project(root: &Path) -> Result<Arc<Project>> {
    Project::init(root)?;
    let (project, report) = Project::open(
        root,
        root.join("settings.json"),
        PromptSource::Fixed(PromptTable::new(MODEL)),
    )?;
    assert!(report.is_clean());
    Ok(Arc::new(project))
}

fn write_png(path: &Path, width: u32, height: u32) -> Result<()> {
    RgbImage::from_pixel(width, height, Rgb([200, 120, 40])).save(path)?;
    Ok(())
}

fn import_page(project: &Project, scratch: &Path, name: &str) -> Result<ImageEntry> {
    let source = scratch.join(name);
    write_png(&source, 40, 30)?;
    Ok(project.import(&source, Category::Page)?)
}

#[tokio::test]
async fn generated_page_lands_after_existing_pages() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let scratch = tempfile::tempdir()?;
    let project = open_project(temp.path())?;
    import_page(&project, scratch.path(), "page_001.png")?;
    import_page(&project, scratch.path(), "page_002.png")?;

    let orchestrator = Orchestrator::new(project.clone(), Arc::new(DryrunProvider));
    let outcome = orchestrator
        .generate(
            GenerationRequest::create(Subject::Page, "a fox in a forest")
                .with_aspect_ratio(AspectRatio::Portrait),
        )
        .await?;

    assert_eq!(outcome.entry.category, Category::Page);
    assert_eq!(outcome.entry.order, Some(3));
    assert!(outcome.entry.relative_path.starts_with("pages/generated_"));
    assert!(outcome.full_res_path.is_file());

    let full = image::open(&outcome.full_res_path)?;
    assert!(full.height() > full.width());
    let thumbnail = image::open(&outcome.thumbnail_path)?;
    let (width, height) = thumbnail.dimensions();
    assert!(width.max(height) <= THUMBNAIL_MAX_EDGE);

    let usage = project.usage()?;
    assert!(usage.model(MODEL).is_some_and(|usage| usage.total_tokens > 0));
    assert_eq!(project.page_ids()?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn rework_keeps_the_source_untouched() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let scratch = tempfile::tempdir()?;
    let project = open_project(temp.path())?;
    let source = import_page(&project, scratch.path(), "page_003.png")?;
    assert_eq!(source.relative_path, "pages/page_003.png");
    let source_path = temp.path().join(&source.relative_path);
    let before = fs::read(&source_path)?;

    let orchestrator = Orchestrator::new(project.clone(), Arc::new(DryrunProvider));
    let outcome = orchestrator
        .rework(GenerationRequest::rework(&source_path, "make the sky pink"))
        .await?;
    let second = orchestrator
        .rework(GenerationRequest::rework(&source.relative_path, "make the sky orange"))
        .await?;
    assert_ne!(second.entry.id, outcome.entry.id);
    assert!(second.entry.file_name().starts_with("rework_"));
    assert!(second.entry.file_name().contains("_page_003"));

    let name = outcome.entry.file_name();
    assert!(name.starts_with("rework_"), "{name}");
    assert!(name.ends_with("_page_003.png"), "{name}");
    assert_eq!(outcome.entry.category, Category::Page);
    assert_eq!(fs::read(&source_path)?, before);
    assert_eq!(project.list(Category::Page)?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn deleting_twice_is_harmless() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let scratch = tempfile::tempdir()?;
    let project = open_project(temp.path())?;
    let page = import_page(&project, scratch.path(), "page.png")?;

    let removed = project.delete_image(&page.id)?;
    assert_eq!(removed.map(|entry| entry.id), Some(page.id.clone()));
    assert!(!temp.path().join(&page.relative_path).exists());
    assert!(!temp.path().join(".thumbnails/pages/page.png").exists());

    assert!(project.delete_image(&page.id)?.is_none());
    Ok(())
}

#[tokio::test]
async fn reorder_missing_a_page_changes_nothing() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let scratch = tempfile::tempdir()?;
    let project = open_project(temp.path())?;
    let first = import_page(&project, scratch.path(), "one.png")?;
    let second = import_page(&project, scratch.path(), "two.png")?;
    let third = import_page(&project, scratch.path(), "three.png")?;

    let partial = vec![third.id.clone(), first.id.clone()];
    assert!(matches!(
        project.reorder_pages(&partial),
        Err(StoreError::Validation(_))
    ));
    assert_eq!(
        project.page_ids()?,
        vec![first.id.clone(), second.id.clone(), third.id.clone()]
    );

    let reversed = vec![third.id.clone(), second.id.clone(), first.id.clone()];
    project.reorder_pages(&reversed)?;
    assert_eq!(project.page_ids()?, reversed);

    let orders: Vec<Option<u32>> = project
        .list(Category::Page)?
        .into_iter()
        .map(|entry| entry.order)
        .collect();
    assert_eq!(orders, vec![Some(1), Some(2), Some(3)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_generations_all_land_with_distinct_orders() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let project = open_project(temp.path())?;
    let orchestrator = Orchestrator::new(project.clone(), Arc::new(DryrunProvider));

    let tasks: Vec<_> = (0..6)
        .map(|index| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .generate(GenerationRequest::create(
                        Subject::Page,
                        format!("page number {index}"),
                    ))
                    .await
            })
        })
        .collect();

    let mut orders = Vec::new();
    for task in tasks {
        let outcome = task.await??;
        assert!(outcome.full_res_path.is_file());
        orders.push(outcome.entry.order);
    }
    orders.sort();
    assert_eq!(orders, (1..=6).map(Some).collect::<Vec<_>>());

    let paths: std::collections::BTreeSet<String> = project
        .list(Category::Page)?
        .into_iter()
        .map(|entry| entry.relative_path)
        .collect();
    assert_eq!(paths.len(), 6);
    assert!(!orchestrator.status().in_flight);
    Ok(())
}

#[tokio::test]
async fn character_sheet_is_filed_with_characters() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let project = open_project(temp.path())?;
    let orchestrator = Orchestrator::new(project.clone(), Arc::new(DryrunProvider));

    let outcome = orchestrator
        .generate(
            GenerationRequest::create(Subject::CharacterSheet, "a red fox, front and side")
                .with_aspect_ratio(AspectRatio::Landscape),
        )
        .await?;

    assert_eq!(outcome.entry.category, Category::Character);
    assert_eq!(outcome.entry.order, None);
    assert!(outcome.entry.relative_path.starts_with("characters/"));
    assert!(project.page_ids()?.is_empty());
    Ok(())
}
