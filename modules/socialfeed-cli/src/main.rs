use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use socialfeed_common::{Config, FetchQuery, Post, PostTypeFilter, Provider};
use socialfeed_core::resolver::load_query_defaults;
use socialfeed_core::{ConfigStore, FeedAggregator, FeedRequest, JsonFileConfigStore, Origin};

#[derive(Parser)]
#[command(name = "socialfeed", about = "Aggregate recent social media posts")]
struct Cli {
    /// Config store file (overrides SOCIALFEED_CONFIG_PATH)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch posts for one provider and print them as JSON
    Fetch {
        /// facebook, instagram or twitter
        provider: Provider,

        /// Number of posts (defaults to the stored feed setting)
        #[arg(long)]
        count: Option<u32>,

        /// Only keep Graph posts with this status_type
        #[arg(long)]
        post_type: Option<String>,

        /// Cache lifetime in seconds
        #[arg(long)]
        ttl: Option<u64>,

        /// Print the last cached copy when the provider is rate limited
        #[arg(long)]
        serve_stale: bool,
    },
    /// Exchange an Instagram authorization code for a long-lived token
    Authorize {
        #[arg(long)]
        code: String,
    },
}

#[derive(Serialize)]
struct Printed<'a> {
    provider: Provider,
    origin: Origin,
    stale: bool,
    error: Option<String>,
    posts: &'a [Post],
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("socialfeed=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let mut config = Config::from_env();
    if let Some(path) = cli.config {
        config.config_path = path;
    }
    config.log_redacted();

    let store = JsonFileConfigStore::open(&config.config_path)
        .await
        .with_context(|| format!("Failed to open {}", config.config_path.display()))?;
    let store: Arc<dyn ConfigStore> = Arc::new(store);
    let feed = FeedAggregator::from_config(&config, store.clone())?;

    match cli.command {
        Command::Fetch {
            provider,
            count,
            post_type,
            ttl,
            serve_stale,
        } => {
            let mut query = load_query_defaults(store.as_ref(), provider).await?;
            if let Some(count) = count {
                query.count = count;
            }
            if let Some(post_type) = post_type {
                query = query.post_type(PostTypeFilter::Only(post_type));
            }
            if let Some(secs) = ttl {
                query = query.cache_ttl(Duration::from_secs(secs));
            }

            fetch(&feed, query, serve_stale).await?;
        }
        Command::Authorize { code } => {
            let state = feed.tokens().authorize_media(&code).await?;
            info!(expires_at = %state.expires_at(), "Instagram access token saved");
        }
    }

    Ok(())
}

async fn fetch(feed: &FeedAggregator, query: FetchQuery, serve_stale: bool) -> Result<()> {
    let provider = query.provider;
    let outcome = feed.fetch(&FeedRequest::new(provider).with_query(query)).await?;

    let stale = if serve_stale && outcome.is_rate_limited() {
        feed.stale(&outcome.cache_key).await
    } else {
        None
    };
    if let Some(err) = &outcome.error {
        warn!(provider = %provider, error = %err, "Feed returned with an error");
    }

    let posts = stale.as_ref().unwrap_or(&outcome.posts);
    let printed = Printed {
        provider,
        origin: outcome.origin,
        stale: stale.is_some(),
        error: outcome.error.as_ref().map(ToString::to_string),
        posts: posts.as_slice(),
    };
    println!("{}", serde_json::to_string_pretty(&printed)?);
    Ok(())
}
