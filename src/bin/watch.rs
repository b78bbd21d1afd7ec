use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use guardia_watch::{
    actors::{RetentionHandle, SchedulerHandle},
    clock::SystemClock,
    config::{ChannelConfig, Config, StorageConfig, read_config_file},
    crypto::{AesGcmEncryptor, Encryptor},
    engine::Engine,
    model::NewNotificationChannel,
    notify::{NotificationDispatcher, discord::DiscordSender, telegram::TelegramSender},
    prober::Prober,
    storage::{MemoryBackend, StorageBackend, Stores},
    util::{get_log_level, get_secret_key},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let level = get_log_level();
    let filter = filter::Targets::new()
        .with_targets(vec![("guardia_watch", level), ("watch", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)
        .with_context(|| format!("failed to load config from {}", args.file))?;

    let Some(secret_key) = get_secret_key() else {
        anyhow::bail!("GUARDIA_SECRET_KEY must be set to encrypt channel secrets");
    };
    let encryptor: Arc<dyn Encryptor> = Arc::new(AesGcmEncryptor::from_passphrase(&secret_key));

    match config.storage.clone().unwrap_or_default() {
        StorageConfig::None => {
            warn!("running without persistence, all history is lost on exit");
            run(Arc::new(MemoryBackend::new()), config, encryptor).await
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("using SQLite storage at {}", path.display());
            let backend = guardia_watch::storage::sqlite::SqliteBackend::new(&path)
                .await
                .with_context(|| format!("failed to open database {}", path.display()))?;
            run(Arc::new(backend), config, encryptor).await
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            anyhow::bail!("SQLite storage requested but the storage-sqlite feature is disabled")
        }
    }
}

async fn run<B: StorageBackend + 'static>(
    backend: Arc<B>,
    config: Config,
    encryptor: Arc<dyn Encryptor>,
) -> anyhow::Result<()> {
    let health = backend.health_check().await?;
    if !health.healthy {
        anyhow::bail!("storage is unhealthy: {}", health.message);
    }

    seed(backend.as_ref(), &config, encryptor.as_ref()).await?;

    let stores = Stores::from_backend(backend.clone());

    let client = reqwest::Client::new();
    let telegram = match &config.transports.telegram_api_base {
        Some(base) => TelegramSender::with_api_base(client.clone(), base),
        None => TelegramSender::new(client.clone()),
    };
    let dispatcher = NotificationDispatcher::new(stores.channels.clone(), encryptor)
        .with_sender(Arc::new(telegram))
        .with_sender(Arc::new(DiscordSender::new(client)));

    let engine = Arc::new(
        Engine::new(
            stores.clone(),
            Arc::new(Prober::new().context("failed to build the probe client")?),
            dispatcher,
            config.settings.clone(),
            config.incidents.registration_template.clone(),
        )
        .with_clock(Arc::new(SystemClock)),
    );

    let cancel = CancellationToken::new();
    let scheduler = SchedulerHandle::spawn(engine, &config.scheduler, cancel.clone());
    let retention = RetentionHandle::spawn(
        stores.events.clone(),
        Arc::new(SystemClock),
        config.retention.clone(),
        cancel.clone(),
    );

    info!("guardia-watch running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    retention.shutdown().await;
    scheduler.shutdown().await;
    cancel.cancel();

    backend.close().await?;
    info!("bye");

    Ok(())
}

/// Write the targets and channels of the config file into the store
async fn seed<B: StorageBackend>(
    backend: &B,
    config: &Config,
    encryptor: &dyn Encryptor,
) -> anyhow::Result<()> {
    if let Some(targets) = &config.targets {
        for target in targets {
            debug!("seeding target {} ({})", target.name, target.endpoint());
            backend.upsert_target(target).await?;
        }
        info!("seeded {} targets", targets.len());
    }

    if let Some(channels) = &config.channels {
        let existing = backend.list_active_channels().await?;
        for channel in channels {
            let known = existing
                .iter()
                .any(|c| c.kind == channel.kind && c.name == channel.name);
            if known {
                trace!("channel {} already stored", channel.name);
                continue;
            }

            let id = backend
                .add_channel(&new_channel(channel, encryptor)?)
                .await?;
            debug!("stored {} channel {} as #{id}", channel.kind, channel.name);
        }
    }

    Ok(())
}

fn new_channel(
    channel: &ChannelConfig,
    encryptor: &dyn Encryptor,
) -> anyhow::Result<NewNotificationChannel> {
    Ok(NewNotificationChannel {
        kind: channel.kind.clone(),
        name: channel.name.clone(),
        secret: encryptor.encrypt(&channel.secret)?,
        destination: channel.destination.clone(),
        silent: channel.silent,
        protect_content: channel.protect_content,
        is_default: channel.is_default,
        is_active: true,
    })
}
