use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewindow::config::RateWindowConfig;
use ratewindow::error::Result;
use ratewindow::ratelimit::{or_fail_open, RateLimiter, RuleSet, WindowStatus};
use ratewindow::store::{MemoryStore, RedisProvider, StoreProvider};

/// Exit code reported when the checked subject is over its limit.
const EXIT_EXCEEDED: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "ratewindow")]
#[command(version, about = "Distributed sliding-window rate limiter")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured Redis URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Backing store to use
    #[arg(long, value_enum, default_value_t = Backend::Redis)]
    backend: Backend,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Redis,
    /// Process-local store, state is lost on exit
    Memory,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record one event for a subject and report whether it is over limit
    Check {
        /// The rate limited subject, e.g. a client identity
        #[arg(long, required_unless_present = "key", conflicts_with = "key")]
        subject: Option<String>,

        /// Exact store key, used without the configured prefix
        #[arg(long, requires_all = ["limit", "window_ms"])]
        key: Option<String>,

        /// Named rule to check against
        #[arg(long, conflicts_with_all = ["limit", "window_ms", "key"])]
        rule: Option<String>,

        /// Ad hoc limit (requires --window-ms)
        #[arg(long, requires = "window_ms")]
        limit: Option<u64>,

        /// Ad hoc window in milliseconds (requires --limit)
        #[arg(long, requires = "limit")]
        window_ms: Option<u64>,

        /// Report "not exceeded" instead of failing when the store is down
        #[arg(long)]
        fail_open: bool,
    },
    /// Print the effective rule set
    Rules,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = match &cli.config {
        Some(path) => RateWindowConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => RateWindowConfig::default(),
    };
    if let Some(url) = &cli.redis_url {
        config.store.url = url.clone();
    }
    let rules = config.load_rules()?;
    info!(rules = rules.len(), key_prefix = %config.store.key_prefix, "Configuration loaded");

    match cli.command {
        Command::Rules => {
            print!("{}", serde_yaml::to_string(&rules)?);
            Ok(())
        }
        Command::Check {
            subject,
            key,
            rule,
            limit,
            window_ms,
            fail_open,
        } => {
            let target = match (subject, key, rule, limit, window_ms) {
                (Some(subject), None, Some(rule), _, _) => Target::Rule { rule, subject },
                (Some(subject), None, None, Some(limit), Some(window_ms)) => Target::AdHoc {
                    subject,
                    window: Duration::from_millis(window_ms),
                    limit,
                },
                (None, Some(key), None, Some(limit), Some(window_ms)) => Target::RawKey {
                    key,
                    window: Duration::from_millis(window_ms),
                    limit,
                },
                _ => bail!(
                    "use --subject with --rule or with --limit and --window-ms, \
                     or --key with --limit and --window-ms"
                ),
            };

            let status = match cli.backend {
                Backend::Redis => {
                    let provider = RedisProvider::connect(&config.store.url)
                        .await
                        .context("failed to connect to Redis")?;
                    let limiter = build_limiter(provider, &config, rules);
                    run_check(&limiter, &target, fail_open).await?
                }
                Backend::Memory => {
                    let limiter = build_limiter(MemoryStore::new(), &config, rules);
                    run_check(&limiter, &target, fail_open).await?
                }
            };

            println!("{}", serde_json::to_string(&status)?);
            if status.exceeded {
                std::process::exit(EXIT_EXCEEDED);
            }
            Ok(())
        }
    }
}

enum Target {
    Rule {
        rule: String,
        subject: String,
    },
    AdHoc {
        subject: String,
        window: Duration,
        limit: u64,
    },
    RawKey {
        key: String,
        window: Duration,
        limit: u64,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_limiter<P: StoreProvider>(
    provider: P,
    config: &RateWindowConfig,
    rules: RuleSet,
) -> RateLimiter<P> {
    let limiter = RateLimiter::new(provider)
        .with_rules(rules)
        .with_key_prefix(&config.store.key_prefix);

    match config.store.timeout() {
        Some(timeout) => limiter.with_timeout(timeout),
        None => limiter,
    }
}

async fn run_check<P: StoreProvider>(
    limiter: &RateLimiter<P>,
    target: &Target,
    fail_open: bool,
) -> Result<WindowStatus> {
    let result = match target {
        Target::Rule { rule, subject } => limiter.check(rule, subject).await,
        Target::AdHoc {
            subject,
            window,
            limit,
        } => limiter.check_with(subject, *window, *limit).await,
        Target::RawKey { key, window, limit } => {
            limiter.check_raw_key(key, *window, *limit).await
        }
    };

    if fail_open {
        or_fail_open(result)
    } else {
        result
    }
}
