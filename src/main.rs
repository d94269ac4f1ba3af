use anyhow::{anyhow, Result};
use clap::Parser;
use listsync::config;
use listsync::ops::{self, AppContext, Operation, MENU};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Operation number; the menu is shown when omitted
    #[arg(long)]
    op: Option<u8>,

    /// Item id for the single-delete operation
    #[arg(long)]
    item_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let choice = match args.op {
        Some(choice) => choice,
        None => prompt_choice()?,
    };
    let item_id = match args.item_id {
        Some(id) => Some(id),
        None if Operation::needs_item_id(choice) => Some(prompt("Item id: ")?),
        None => None,
    };
    let op = Operation::from_choice(choice, item_id)?;
    if op == Operation::Quit {
        return Ok(());
    }

    let ctx = AppContext::from_config(cfg)?;
    info!(?op, "running operation");
    if let Err(err) = ops::execute(&ctx, op).await {
        error!(?err, "operation failed");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn prompt_choice() -> Result<u8> {
    for entry in MENU.iter().filter(|e| e.visible) {
        println!("{}. {}", entry.choice, entry.title);
    }
    let raw = prompt("Choice: ")?;
    raw.trim()
        .parse()
        .map_err(|_| anyhow!("invalid choice: {}", raw.trim()))
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
