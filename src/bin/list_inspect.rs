use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use listsync::config;
use listsync::graph::GraphClient;
use listsync::ops::AppContext;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// List ID to inspect; defaults to the configured list
    #[arg(long)]
    list_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = config::load(Some(&args.config))?;
    let list_id = args.list_id.unwrap_or_else(|| cfg.azure.list_id.clone());
    let ctx = AppContext::from_config(cfg)?;
    let client = GraphClient::from_config(&ctx.config, ctx.credentials.clone())?;

    let columns = client.columns(&list_id).await?;
    println!("List ID: {list_id}");
    println!("Columns:");
    for col in columns {
        println!(
            "  {} -> {{ display: {}, indexed: {}, read_only: {} }}",
            col.name,
            col.display_name.as_deref().unwrap_or("-"),
            col.indexed,
            col.read_only
        );
    }
    Ok(())
}
