//! adsched ad server
//!
//! Runs the serving engine against a local SQLite database. Delivered ads
//! are written to the log.
//!
//! ## Startup
//!
//! - Load [`Config`] from `ADSCHED_*` environment variables
//! - Open the store and import the catalog file, if one is configured
//! - Purge old ad events
//! - Drive the engine runner and start serving at regular intervals

use std::sync::Arc;

use adsched_async::{Clock, Context, SystemClock, TaskRunner};
use adsched_events::AdNotification;
use adsched_server::ad_events::AdEventHistory;
use adsched_server::catalog::Catalog;
use adsched_server::serving::AdServing;
use adsched_server::store::{AdDelivery, CreativeAdStore, SqliteStore, StaticSegments};
use adsched_server::{install, AdRng, Config, Services};
use anyhow::{Context as _, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Ad events older than this are purged at startup.
const AD_EVENT_RETENTION_DAYS: i64 = 90;

/// Presents ads by logging them.
struct LogDelivery;

impl AdDelivery for LogDelivery {
    fn maybe_deliver_ad(&self, ad: &AdNotification) -> bool {
        info!(
            ad_uuid = %ad.uuid,
            creative_instance_id = %ad.creative_instance_id,
            title = %ad.title,
            body = %ad.body,
            target_url = %ad.target_url,
            "Showing ad notification"
        );
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting adsched ad server");
    info!(
        database_path = %config.database_path,
        segments = ?config.segments,
        ads_per_hour = config.engine.frequency_caps.ads_per_hour,
        ads_per_day = config.engine.frequency_caps.ads_per_day,
        "Configuration loaded"
    );

    let runner = TaskRunner::new("ads");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut driver = runner.spawn(shutdown_rx);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(
        SqliteStore::open(&config.database_path, &runner)
            .with_context(|| format!("opening database {}", config.database_path))?
            .with_clock(clock.clone()),
    );

    let mut engine_config = config.engine.clone();
    if let Some(path) = &config.catalog_path {
        let catalog = Catalog::load(path)?;
        store.delete_all().await??;
        store.save(&catalog.creative_ads).await??;
        engine_config
            .frequency_caps
            .anti_targeting
            .extend(catalog.anti_targeting);
    }

    let context = Context::new(runner.clone());
    let services = Services {
        creative_ads: store.clone(),
        ad_events: store.clone(),
        browsing_history: store.clone(),
        client_state: store,
        delivery: Arc::new(LogDelivery),
        segments: Arc::new(StaticSegments::new(config.segments.clone())),
        clock: clock.clone(),
        rng: Arc::new(AdRng::from_os_rng()),
    };
    install(&context, services, engine_config)?;

    let cutoff = clock.now() - chrono::Duration::days(AD_EVENT_RETENTION_DAYS);
    if let Err(e) = context.get::<AdEventHistory>().purge_older_than(cutoff).await? {
        error!(error = %e, "Failed to purge ad events");
    }

    let serving = context.get::<AdServing>();
    runner.post({
        let serving = serving.clone();
        move || serving.start_serving_ads_at_regular_intervals()
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut driver => {
            if let Err(e) = result {
                error!(error = %e, "Task runner panicked");
            }
        }
    }

    serving.stop_serving_ads_at_regular_intervals();
    let _ = shutdown_tx.send(true);
    if !driver.is_finished() {
        let _ = driver.await;
    }

    info!("Ad server shutdown complete");
    Ok(())
}
