//! CLI commands implementation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;

use crate::config::GatewayConfig;
use crate::gateway::{CallOptions, Gateway};
use crate::upstream::{HttpUpstream, UpstreamClient};

#[derive(Parser)]
#[command(name = "llmgate")]
#[command(about = "Rate-limited gateway for session-oriented upstream AI services")]
#[command(version)]
pub struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Send one chat message through the gateway and print the reply
    Chat {
        /// Message content
        message: String,
        /// User scope for rate limiting
        #[arg(short, long)]
        user: Option<String>,
        /// Guild scope for rate limiting
        #[arg(short, long)]
        guild: Option<String>,
        /// Bypass the response cache for this call
        #[arg(long)]
        no_cache: bool,
        /// Upstream attempts before giving up (0 = configured default)
        #[arg(short, long, default_value = "0")]
        attempts: u32,
    },

    /// Show effective configuration and upstream reachability
    Status,

    /// Show configured rate-limit buckets
    Buckets {
        /// Include a guild scope
        #[arg(short, long)]
        guild: Option<String>,
        /// Include a user scope
        #[arg(short, long)]
        user: Option<String>,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Chat {
            message,
            user,
            guild,
            no_cache,
            attempts,
        } => cmd_chat(config, &message, user, guild, no_cache, attempts).await,
        Commands::Status => cmd_status(config).await,
        Commands::Buckets { guild, user } => cmd_buckets(config, guild, user).await,
    }
}

async fn cmd_chat(
    config: GatewayConfig,
    message: &str,
    user: Option<String>,
    guild: Option<String>,
    no_cache: bool,
    attempts: u32,
) -> anyhow::Result<()> {
    let client = HttpUpstream::new(&config.upstream)?;
    let gateway = Gateway::new(config, client);

    let options = CallOptions {
        no_cache,
        guild_id: guild,
        user_id: user,
        attempt_budget: attempts,
        ..Default::default()
    };
    let result = gateway.chat(message, options).await;

    match &result.outcome {
        Ok(reply) => {
            println!("{}", reply.content);
            let origin = if result.from_cache { "cache" } else { "upstream" };
            eprintln!(
                "{}",
                style(format!(
                    "[{} | waited {}ms | {} attempt(s)]",
                    origin, result.queue_wait_ms, result.attempt_count
                ))
                .dim()
            );
            Ok(())
        }
        Err(error) => {
            eprintln!("{} {}", style("✗").red(), error.message);
            std::process::exit(1);
        }
    }
}

async fn cmd_status(config: GatewayConfig) -> anyhow::Result<()> {
    println!("\n{}", style("Gateway Status").bold());
    println!("{}", "-".repeat(40));
    println!("{:<20} {}", "Upstream:", config.upstream.base_url);
    println!("{:<20} {}", "API version:", config.upstream.api_version);
    println!("{:<20} {}", "Agent slug:", config.session.agent_slug);
    println!("{:<20} {}", "Model:", config.session.model);
    println!("{:<20} {}", "Queue capacity:", config.queue.max_len);
    println!("{:<20} {}s", "Cache TTL:", config.cache.ttl_secs);
    println!(
        "{:<20} {}",
        "Attempt budget:", config.retry.default_attempt_budget
    );

    let client = HttpUpstream::new(&config.upstream)?;
    match client.get_user(&config.session.user_id).await {
        Ok(Some(_)) => println!(
            "{:<20} {} (service account exists)",
            "Reachability:",
            style("✓").green()
        ),
        Ok(None) => println!(
            "{:<20} {} (service account not yet provisioned)",
            "Reachability:",
            style("✓").green()
        ),
        Err(e) => println!(
            "{:<20} {} {}",
            "Reachability:",
            style("✗").red(),
            e.message
        ),
    }

    Ok(())
}

async fn cmd_buckets(
    config: GatewayConfig,
    guild: Option<String>,
    user: Option<String>,
) -> anyhow::Result<()> {
    let client = HttpUpstream::new(&config.upstream)?;
    let gateway = Gateway::new(config, client);
    let buckets = gateway
        .bucket_status(guild.as_deref(), user.as_deref())
        .await;

    println!("\n{}", style("Rate Limit Buckets").bold());
    println!("{}", "-".repeat(40));
    println!(
        "{:<24} {:>10} {:>10} {:>10}",
        "Scope", "Remaining", "Capacity", "Reset"
    );
    for bucket in buckets {
        let reset = if bucket.reset_eta_ms == 0 {
            "ready".to_string()
        } else {
            format!("{}ms", bucket.reset_eta_ms)
        };
        println!(
            "{:<24} {:>10.1} {:>10.1} {:>10}",
            bucket.scope, bucket.remaining, bucket.capacity, reset
        );
    }

    Ok(())
}
