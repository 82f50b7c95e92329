use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pmoconfig::Config;
use pmoepg::{GuideCache, GuideConfigExt, GuideQuery, GuideSync, SdApi, SelectedStation};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pmoguide")]
#[command(about = "Schedules Direct guide synchronisation", long_about = None)]
struct Cli {
    /// Configuration directory (defaults to $PMOGUIDE_CONFIG or ~/.pmoguide)
    #[arg(long, env = "PMOGUIDE_CONFIG", default_value = "")]
    config_dir: String,

    /// Log filter, overrides host.logger.min_level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synchronise the cache with Schedules Direct (default)
    Sync,
    /// Store the Schedules Direct account (the password is kept hashed)
    Account {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// Add a station to the selection
    Select {
        station_id: String,
        #[arg(long)]
        lineup: Option<String>,
    },
    /// List the lineups subscribed by the account
    Lineups,
    /// Drop a cached program so the next sync fetches it again
    Refresh { program_id: String },
    /// List cached channels
    Channels,
    /// Print the programmes of a station as JSON
    Guide { station_id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load_config(&cli.config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            std::process::exit(2);
        }
    };
    init_logging(&config, cli.log_level.as_deref());

    if let Err(e) = run(cli.command.unwrap_or(Commands::Sync), &config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(config: &Config, override_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match override_level {
            Some(level) => level.to_string(),
            None => config.get_log_min_level().unwrap_or_else(|_| "info".to_string()),
        };
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let subscriber = Registry::default().with(filter);
    if config.get_log_enable_console().unwrap_or(true) {
        subscriber
            .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
            .init();
    } else {
        subscriber.init();
    }
}

async fn run(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Sync => sync(config).await,
        Commands::Account { username, password } => {
            config.set_sd_username(&username)?;
            config.set_sd_password(&password)?;
            info!("✅ Account saved in {}", config.path().display());
            Ok(())
        }
        Commands::Select { station_id, lineup } => {
            let mut stations = config.get_selected_stations()?;
            if stations.iter().any(|s| s.id == station_id && s.lineup == lineup) {
                warn!(station = %station_id, "Station already selected");
                return Ok(());
            }
            stations.push(SelectedStation {
                id: station_id,
                name: String::new(),
                lineup,
            });
            config.set_selected_stations(&stations)?;
            info!("✅ {} station(s) selected", stations.len());
            Ok(())
        }
        Commands::Lineups => {
            let api = SdApi::new()?;
            let credentials = config.get_sd_credentials()?;
            let cancel = CancellationToken::new();
            api.login(&credentials.username, &credentials.password, &cancel)
                .await?;
            for lineup in api.lineups(&cancel).await? {
                let state = if lineup.is_deleted { " (deleted)" } else { "" };
                println!("{:<20} {}{}", lineup.lineup, lineup.name, state);
            }
            Ok(())
        }
        Commands::Refresh { program_id } => {
            let cache = GuideCache::open(config.get_cache_file()?, config.get_cache_ttl()?)
                .context("Failed to open the guide cache")?;
            if cache.invalidate_program(&program_id) {
                cache.snapshot()?;
                info!(program = %program_id, "✅ Program will be fetched on next sync");
            } else {
                warn!(program = %program_id, "Program not in cache");
            }
            Ok(())
        }
        Commands::Channels => {
            let query = open_query(config)?;
            for channel in query.channels() {
                println!(
                    "{:>6}  {:<10} {:<12} {}",
                    channel.channel_number.as_deref().unwrap_or("-"),
                    channel.station_id,
                    channel.callsign,
                    channel.name
                );
            }
            Ok(())
        }
        Commands::Guide { station_id } => {
            let query = open_query(config)?;
            let programmes = query.programmes(&station_id);
            println!("{}", serde_json::to_string_pretty(&programmes)?);
            Ok(())
        }
    }
}

fn open_query(config: &Config) -> Result<GuideQuery> {
    let cache = GuideCache::open(config.get_cache_file()?, config.get_cache_ttl()?)
        .context("Failed to open the guide cache")?;
    Ok(GuideQuery::new(Arc::new(cache), config.get_query_options()?))
}

async fn sync(config: &Config) -> Result<()> {
    let cache_file = config.get_cache_file()?;
    let cache = Arc::new(
        GuideCache::open(&cache_file, config.get_cache_ttl()?)
            .with_context(|| format!("Failed to open cache {}", cache_file.display()))?,
    );
    let api = Arc::new(SdApi::new()?);
    let sync = GuideSync::new(api, Arc::clone(&cache), config.get_sync_settings()?)
        .with_credentials(config.get_sd_credentials()?);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight batches...");
            trigger.cancel();
        }
    });

    info!("📡 Synchronising guide into {}", cache_file.display());
    let report = sync.run(&cancel).await?;
    info!(
        "✅ {} lineup(s), {} slot(s), {} new program(s), {} artwork set(s) in {} ms",
        report.lineups.requested,
        report.schedules.merged,
        report.programs.merged,
        report.metadata.merged,
        report.elapsed_ms
    );
    if report.programs.rejected > 0 {
        warn!("{} program(s) refused by Schedules Direct", report.programs.rejected);
    }

    let pruned = cache.expire_and_prune(chrono::Utc::now(), config.get_retention()?);
    if pruned.slots > 0 || pruned.programs > 0 {
        info!(
            slots = pruned.slots,
            stations = pruned.stations,
            programs = pruned.programs,
            "Pruned old guide data"
        );
        cache.snapshot()?;
    }

    let stats = cache.stats();
    info!(
        channels = stats.channels,
        slots = stats.slots,
        programs = stats.programs,
        metadata = stats.metadata,
        "Cache ready"
    );
    Ok(())
}
