use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewindow::config::{LoggingConfig, RatewindowConfig};
use ratewindow::ratelimit::{CallContext, Rate, WindowCounter, WindowState};
use ratewindow::store::RedisStore;

/// Drive fixed-window rate limit counters stored in Redis.
#[derive(Debug, Parser)]
#[command(name = "ratewindow", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Redis URL, overrides the configuration
    #[arg(long)]
    redis_url: Option<String>,

    /// Key prefix, overrides the configuration
    #[arg(long)]
    prefix: Option<String>,

    /// Give up after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print the window state as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record an event and print the window state
    Get { identifier: String, rate: Rate },
    /// Print the window state without recording an event
    Peek { identifier: String, rate: Rate },
    /// Clear the window
    Reset { identifier: String, rate: Rate },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RatewindowConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.redis_url {
        config.redis.url = url;
    }
    if let Some(prefix) = cli.prefix {
        config.counter.prefix = prefix;
    }

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting ratewindow");

    let options = config.counter.validate()?;
    let store = RedisStore::connect(&config.redis).await?;
    let counter = WindowCounter::with_options(store, options);

    let mut ctx = CallContext::background();
    if let Some(ms) = cli.timeout_ms {
        ctx = ctx.with_timeout(Duration::from_millis(ms));
    }
    let (ctx, cancel) = ctx.cancellable();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling");
            cancel.cancel();
        }
    });

    let (identifier, rate, state) = match &cli.command {
        Command::Get { identifier, rate } => {
            (identifier, rate, counter.get(&ctx, identifier, rate).await?)
        }
        Command::Peek { identifier, rate } => {
            (identifier, rate, counter.peek(&ctx, identifier, rate).await?)
        }
        Command::Reset { identifier, rate } => {
            (identifier, rate, counter.reset(&ctx, identifier, rate).await?)
        }
    };

    let key = counter.window_key(identifier);
    if cli.json {
        println!("{}", render_json(key.as_str(), rate, &state)?);
    } else {
        println!("key:        {}", key);
        println!("count:      {}", state.count);
        println!("limit:      {}", rate.limit);
        println!("remaining:  {}", state.remaining(rate));
        println!("exceeded:   {}", state.is_exceeded(rate));
        println!("reset in:   {:?}", state.reset_in());
        println!("expires at: {}", state.expires_at.to_rfc3339());
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn render_json(key: &str, rate: &Rate, state: &WindowState) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&serde_json::json!({
        "key": key,
        "rate": rate,
        "state": state,
        "remaining": state.remaining(rate),
        "exceeded": state.is_exceeded(rate),
        "reset_in_ms": state.reset_in().as_millis() as u64,
    }))
}
