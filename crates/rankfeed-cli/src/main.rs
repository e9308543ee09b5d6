use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rankfeed_adapters::FixturePageSource;
use rankfeed_storage::StaticSession;
use rankfeed_sync::{
    BulkRequest, CharacterStore, MemoryCharacterStore, PgCharacterStore, ScrapeConfig, ScrapeService,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "rankfeed-cli")]
#[command(about = "Ranking feed scrape-and-ingest tool")]
struct Cli {
    /// Keep scraped records in memory instead of Postgres.
    #[arg(long, global = true)]
    dry_run: bool,
    /// Read `page-<n>.json` files from this directory instead of the live feed.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape pages `[0, max-pages)` and ingest them.
    ScrapeAll {
        #[arg(long)]
        max_pages: Option<usize>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        job_id: Option<String>,
    },
    ScrapeCharacter {
        name: String,
    },
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rankfeed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ScrapeConfig::from_env();
    config.validate().context("invalid RANKFEED_* configuration")?;
    let service = build_service(&cli, &config)?;

    let command = cli.command.unwrap_or(Commands::ScrapeAll {
        max_pages: None,
        concurrency: None,
        job_id: None,
    });
    match command {
        Commands::ScrapeAll {
            max_pages,
            concurrency,
            job_id,
        } => {
            let job_id = job_id.unwrap_or_else(|| format!("cli-{}", Uuid::new_v4()));
            let handle = service.spawn_bulk(BulkRequest {
                job_id: job_id.clone(),
                max_pages,
                concurrency,
            })?;

            let interrupt = {
                let service = service.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!(job_id = %job_id, "interrupted; finishing in-flight pages");
                        service.shutdown().await;
                    }
                })
            };
            let summary = handle.await.context("bulk run task panicked")??;
            interrupt.abort();
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ScrapeCharacter { name } => match service.scrape_character(&name).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => {
                eprintln!("character {name} not found on the ranking");
                std::process::exit(2);
            }
        },
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(rankfeed_web::web_port_from_env);
            rankfeed_web::serve(service, &config, port).await?;
        }
    }

    Ok(())
}

fn build_service(cli: &Cli, config: &ScrapeConfig) -> Result<Arc<ScrapeService>> {
    let store: Arc<dyn CharacterStore> = if cli.dry_run {
        info!("dry run: records stay in memory");
        Arc::new(MemoryCharacterStore::new())
    } else {
        Arc::new(PgCharacterStore::connect_lazy(&config.database_url).context("configuring character store")?)
    };

    let service = match &cli.fixtures {
        Some(dir) => {
            info!(dir = %dir.display(), "scraping from fixture pages");
            ScrapeService::new(
                Arc::new(StaticSession::default()),
                Arc::new(FixturePageSource::new(dir.clone())),
                store,
                config.service_settings(),
            )?
        }
        None => ScrapeService::from_config(config, store)?,
    };
    Ok(Arc::new(service))
}
