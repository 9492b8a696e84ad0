use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wakeclock::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging. RUST_LOG overrides the default level.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false);
    if std::env::var_os("RUST_LOG").is_some() {
        subscriber.with_env_filter(EnvFilter::from_default_env()).init();
    } else {
        subscriber.init();
    }

    // 2. Load configuration from an optional TOML path plus WAKECLOCK__* variables.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = WakeclockConfig::load(config_path.as_deref())
        .context("failed to load wakeclock configuration")?;
    info!(
        "{} v{} using store {} in {}",
        wakeclock::ENGINE_NAME,
        wakeclock::VERSION,
        config.store_path.display(),
        config.timezone
    );

    // 3. Boot the registry against the JSON store and the tokio wake timer.
    let store = Arc::new(JsonFileStore::new(config.store_path.clone()));
    let registry = AlarmRegistry::with_system_timer(config, store).await?;

    // 4. Log every event stream.
    spawn_event_listeners(&registry);

    // 5. Make sure there is something to watch: a demo alarm two minutes out.
    if registry.get_alarms_list().is_empty() {
        register_demo_alarm(&registry).await?;
    }
    for alarm in registry.get_alarms_list() {
        info!(
            "[ALARM] {} {:02}:{:02} {} {}",
            alarm.id, alarm.hour, alarm.minute, alarm.days_of_week, alarm.state
        );
    }

    // 6. Run until Ctrl+C, then let pending writes land.
    info!("Running. Press Ctrl+C to shut down.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, flushing store writes...");
    registry.flush().await;
    info!("{} has shut down.", wakeclock::ENGINE_NAME);
    Ok(())
}

/// Spawns one task per event stream, each logging what it receives.
fn spawn_event_listeners(registry: &AlarmRegistry) {
    let mut lifecycle_rx = registry.subscribe_lifecycle_events();
    tokio::spawn(async move {
        while let Ok(event) = lifecycle_rx.recv().await {
            info!("[LIFECYCLE] => {} {:?}", event.alarm_id, event.kind);
        }
    });

    let mut observer_rx = registry.subscribe_observer_events();
    tokio::spawn(async move {
        while let Ok(event) = observer_rx.recv().await {
            match event {
                ObserverEvent::AlarmsChanged(alarms) => {
                    info!("[OBSERVER] => {} alarm(s)", alarms.len())
                }
                ObserverEvent::NextAlarmChanged(Some(next)) => info!(
                    "[OBSERVER] => next wake {} at {} ({:?})",
                    next.alarm_id, next.at, next.kind
                ),
                ObserverEvent::NextAlarmChanged(None) => info!("[OBSERVER] => nothing armed"),
            }
        }
    });
}

/// Creates a one-shot alarm with a pre-alarm, due two minutes from now.
async fn register_demo_alarm(registry: &AlarmRegistry) -> Result<()> {
    let id = registry.create_new_alarm().await?;
    let created = registry.get_alarm(id)?;
    let total = created.hour * 60 + created.minute + 2;
    let (hour, minute) = ((total / 60) % 24, total % 60);
    let alarm = registry
        .edit(id, |e| e.at(hour, minute).labelled("demo").enabled(true))
        .await?;
    if alarm.state != AlarmState::Set && alarm.state != AlarmState::PrealarmSet {
        warn!("[DEMO] alarm {} ended up in {}", id, alarm.state);
    }
    Ok(())
}
