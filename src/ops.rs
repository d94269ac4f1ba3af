//! The fixed set of operations reachable from the menu, and the context
//! object threaded through each of them.
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::bulk::{self, ErrorLog};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::credential::{ClientSecretProvider, CredentialCache, FileCredentialStore};
use crate::dispatcher::RateLimitedDispatcher;
use crate::graph::{GraphClient, ListService};
use crate::sync::{DeltaSchema, DeltaSyncEngine, FileWatermarkStore};
use crate::tabular::{self, CsvSink};
use crate::upload::{self, UploadJob, CHUNK_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ListLists,
    ExtractDelta,
    DeleteItem { item_id: String },
    DriveId,
    PrintToken,
    BulkUpdate,
    UploadFiles,
    DeleteAllItems,
    Quit,
}

#[derive(Debug, Clone, Copy)]
pub struct MenuEntry {
    pub choice: u8,
    pub title: &'static str,
    /// Shown in the printed menu; hidden entries are still accepted.
    pub visible: bool,
}

pub const MENU: [MenuEntry; 9] = [
    MenuEntry { choice: 1, title: "Extraction: list available lists", visible: false },
    MenuEntry { choice: 2, title: "Extraction: completed rows since last run", visible: true },
    MenuEntry { choice: 3, title: "Extraction: delete one item", visible: false },
    MenuEntry { choice: 4, title: "Extraction: get the drive id", visible: false },
    MenuEntry { choice: 5, title: "Extraction: get a token", visible: false },
    MenuEntry { choice: 6, title: "Load: update the list from add/remove files", visible: true },
    MenuEntry { choice: 7, title: "Load: upload output files", visible: true },
    MenuEntry { choice: 8, title: "Delete every item", visible: false },
    MenuEntry { choice: 0, title: "Quit", visible: true },
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChoiceError {
    #[error("invalid choice: {0}")]
    Unknown(u8),
    #[error("an item id is required")]
    MissingItemId,
}

impl Operation {
    pub fn needs_item_id(choice: u8) -> bool {
        choice == 3
    }

    pub fn from_choice(choice: u8, item_id: Option<String>) -> Result<Self, ChoiceError> {
        Ok(match choice {
            1 => Operation::ListLists,
            2 => Operation::ExtractDelta,
            3 => {
                let item_id = item_id
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .ok_or(ChoiceError::MissingItemId)?;
                Operation::DeleteItem { item_id }
            }
            4 => Operation::DriveId,
            5 => Operation::PrintToken,
            6 => Operation::BulkUpdate,
            7 => Operation::UploadFiles,
            8 => Operation::DeleteAllItems,
            0 => Operation::Quit,
            other => return Err(ChoiceError::Unknown(other)),
        })
    }
}

/// Everything an operation needs: configuration, credential cache, remote
/// client and clock.
pub struct AppContext {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub credentials: Arc<CredentialCache>,
    pub lists: Arc<dyn ListService>,
}

impl AppContext {
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        credentials: Arc<CredentialCache>,
        lists: Arc<dyn ListService>,
    ) -> Self {
        Self {
            config,
            clock,
            credentials,
            lists,
        }
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider = ClientSecretProvider::from_config(&config, clock.clone())?;
        let credentials = Arc::new(CredentialCache::new(
            Arc::new(provider),
            Arc::new(FileCredentialStore::new(&config.app.token_file)),
            clock.clone(),
        ));
        let lists = GraphClient::from_config(&config, credentials.clone())?;
        Ok(Self::new(config, clock, credentials, Arc::new(lists)))
    }

    pub fn dispatcher(&self) -> RateLimitedDispatcher {
        RateLimitedDispatcher::new(self.config.bulk.n_requests, self.config.cooldown())
    }
}

#[instrument(skip(ctx))]
pub async fn execute(ctx: &AppContext, op: Operation) -> Result<()> {
    match op {
        Operation::ListLists => list_lists(ctx).await,
        Operation::ExtractDelta => extract_delta(ctx).await,
        Operation::DeleteItem { item_id } => delete_one(ctx, &item_id).await,
        Operation::DriveId => drive_ids(ctx).await,
        Operation::PrintToken => {
            let token = ctx.credentials.get_token().await?;
            println!("{token}");
            Ok(())
        }
        Operation::BulkUpdate => bulk_update(ctx).await,
        Operation::UploadFiles => upload_files(ctx).await,
        Operation::DeleteAllItems => delete_all(ctx).await,
        Operation::Quit => Ok(()),
    }
}

async fn list_lists(ctx: &AppContext) -> Result<()> {
    let lists = ctx.lists.lists().await.context("failed to list lists")?;
    for list in lists {
        println!("{} : {}", list.display_name, list.id);
    }
    Ok(())
}

async fn drive_ids(ctx: &AppContext) -> Result<()> {
    let drives = ctx.lists.drives().await.context("failed to list drives")?;
    for drive in drives {
        println!(
            "{} : {} ({})",
            drive.name.as_deref().unwrap_or("-"),
            drive.id,
            drive.drive_type.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

async fn delete_one(ctx: &AppContext, item_id: &str) -> Result<()> {
    info!(item_id, "deleting item");
    ctx.lists
        .delete_item(&ctx.config.azure.list_id, item_id)
        .await
        .with_context(|| format!("failed to delete item {item_id}"))?;
    println!("Deleted item {item_id}");
    Ok(())
}

async fn extract_delta(ctx: &AppContext) -> Result<()> {
    let cfg = &ctx.config.sync;
    let mut sink = CsvSink::open(&cfg.output_file, &cfg.columns)
        .with_context(|| format!("cannot open {}", cfg.output_file))?;
    if cfg.targets.is_empty() {
        warn!("no sync targets configured");
    }

    let engine = DeltaSyncEngine::new(
        ctx.lists.clone(),
        Arc::new(FileWatermarkStore::new(&cfg.watermark_file)),
        ctx.clock.clone(),
        DeltaSchema::from_config(cfg),
    );
    let report = engine.sync(&cfg.targets, &mut sink).await?;
    for (name, rows) in &report.targets {
        println!("{name}: {rows} rows since {}", report.since);
    }
    Ok(())
}

/// Create the rows of the add file, then delete the items matching the keys
/// of the remove file.
async fn bulk_update(ctx: &AppContext) -> Result<()> {
    let cfg = &ctx.config.bulk;
    let list_id = &ctx.config.azure.list_id;
    let dispatcher = ctx.dispatcher();

    let rows = tabular::read_records(Path::new(&cfg.add_file))?;
    ctx.credentials.get_token().await?;
    let errors = ErrorLog::open(Path::new(&cfg.error_log), ctx.clock.clone())
        .await
        .with_context(|| format!("cannot open {}", cfg.error_log))?;
    let created =
        bulk::create_items(ctx.lists.as_ref(), &dispatcher, list_id, rows, &errors).await?;
    println!(
        "Created {} items ({} failed, see {})",
        created.succeeded(),
        created.failed(),
        cfg.error_log
    );

    let keys = tabular::read_column(Path::new(&cfg.remove_file), &cfg.remove_key_column)?;
    if keys.is_empty() {
        println!("Nothing to remove");
        return Ok(());
    }
    let removal =
        bulk::delete_matching(ctx.lists.as_ref(), &dispatcher, list_id, &cfg.match_field, keys)
            .await?;
    for miss in &removal.unmatched {
        println!("{}", capitalize(&miss.to_string()));
    }
    for err in removal.deletes.errors() {
        println!("Error deleting {}: {}", err.item, err.source);
    }
    println!(
        "Deleted {} items ({} failed, {} lookups failed)",
        removal.deletes.succeeded(),
        removal.deletes.failed(),
        removal.lookup_failures
    );
    Ok(())
}

async fn upload_files(ctx: &AppContext) -> Result<()> {
    let jobs = UploadJob::from_config(&ctx.config.upload);
    let results = upload::upload_all(ctx.lists.as_ref(), &jobs, CHUNK_SIZE).await;
    for (job, result) in jobs.iter().zip(results) {
        match result {
            Ok(chunks) => println!("Upload finished for {} ({chunks} chunks)", job.remote_path),
            Err(err) => println!("Error: {err}"),
        }
    }
    Ok(())
}

async fn delete_all(ctx: &AppContext) -> Result<()> {
    let list_id = &ctx.config.azure.list_id;
    ctx.credentials.get_token().await?;
    let report = bulk::delete_all(ctx.lists.as_ref(), &ctx.dispatcher(), list_id).await?;
    println!(
        "Deleted {} items ({} failed)",
        report.succeeded(),
        report.failed()
    );
    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
