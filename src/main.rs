mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Commands};
use reshelf::config::Config;
use reshelf::source::SourceKind;
use reshelf::types::{Episode, RemoteEpisode};
use reshelf::Library;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading config")?;
    if let Some(url) = cli.database.clone() {
        config.database_url = Some(url);
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let lib = Library::connect(config).await.context("opening library")?;

    match cli.command {
        Commands::AddWork { source, url, title, favorite } => {
            let work = lib.add_work(source, &url, &title, favorite).await?;
            println!("{}", work.id);
        }
        Commands::Works { favorites } => {
            for w in lib.list_works(favorites).await? {
                let star = if w.favorite { "*" } else { " " };
                println!("{star} {:>5}  [{}] {}  {}", w.id, w.source_id, w.title, w.url);
            }
        }
        Commands::Episodes { work } => print_episodes(&lib.episodes(work).await?),
        Commands::Sync { work, input, manual, offline } => {
            let text = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let remote: Vec<RemoteEpisode> =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", input.display()))?;
            let source = if offline { SourceKind::Offline } else { SourceKind::http() };
            let fresh = lib.sync_episodes(work, remote, &source, manual).await?;
            println!("{} new episode(s)", fresh.len());
            print_episodes(&fresh);
        }
        Commands::Merge { work } => {
            let target = lib.work(work).await?;
            let episodes = lib.episodes(work).await?;
            let outcome = lib.resolve_chains(target.source_id, &episodes).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "accepted": outcome.accepted.work.id,
                "discarded": outcome.discarded.iter().map(|c| c.work.id).collect::<Vec<_>>(),
                "new_episodes": outcome.new_episodes.len(),
            }))?);
        }
        Commands::Link { container, work, priority } => {
            lib.link_work(container, work, priority).await?;
        }
        Commands::Mode { container, mode } => {
            lib.set_dedupe_mode(container, mode).await?;
        }
        Commands::View { container } => print_episodes(&lib.merged_episodes(container).await?),
    }
    Ok(())
}

fn print_episodes(episodes: &[Episode]) {
    for e in episodes {
        let number = e.number.map_or_else(|| "?".to_string(), |n| n.to_string());
        let mark = if e.read { "x" } else { " " };
        println!("[{mark}] {:>4} {:>6}  {}  {}", e.source_order, number, e.name, e.url);
    }
}
