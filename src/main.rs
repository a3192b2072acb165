use std::{
    process,
    sync::{Arc, OnceLock},
};

use birdnet_mqtt::{
    config::Config,
    core::{readiness::Readiness, relay::Relay},
    logger::LoggerManager,
    print_error,
};
use birdnet_mqtt_client::{
    backoff::Backoff, discovery, ClientError, ConnectionManager, DiagnosticRunner,
    RumqttTransport,
};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Keeps trying the first connect until it succeeds, fails fatally or the
/// service shuts down. Later losses are handled by the manager itself.
async fn connect_until_established(manager: ConnectionManager, shutdown: CancellationToken) {
    let config = manager.config();
    let mut backoff = Backoff::new(config.initial_backoff(), config.max_backoff());

    loop {
        let wait = match manager.connect(&shutdown).await {
            Ok(()) => {
                info!("Connected to MQTT broker {}", manager.broker());
                return;
            }
            Err(ClientError::Cancelled(_)) => return,
            Err(e) if e.is_fatal() => {
                error!("Cannot connect to MQTT broker: {e}");
                return;
            }
            Err(ClientError::Cooldown { remaining }) => remaining,
            Err(e) => {
                let wait = backoff.next_sleep().unwrap_or(backoff.max_delay());
                warn!("Initial connect failed, retrying in {:.1}s: {e}", wait.as_secs_f64());
                wait
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// `--diagnose`: runs the staged connection test and prints each result as
/// a JSON line.
async fn run_diagnostics(manager: ConnectionManager) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    let mut results = DiagnosticRunner::new(manager.clone(), None).test_connection(&cancel);

    let mut passed = true;
    loop {
        let result = tokio::select! {
            result = results.recv() => result,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                results.recv().await
            }
        };
        let Some(result) = result else { break };
        if !result.is_progress {
            passed = result.success;
        }
        println!("{}", serde_json::to_string(&result)?);
    }

    manager.disconnect().await;
    if !passed {
        process::exit(2);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting birdnet-mqtt version {}...", env!("CARGO_PKG_VERSION"));
    debug!("{:#?}", cfg.mqtt);
    info!("Log level: {}", cfg.logger.level);

    let transport = RumqttTransport::from_config(&cfg.mqtt).unwrap_or_else(|e| {
        error!("Failed to create MQTT transport: {}", e);
        process::exit(1);
    });
    let manager =
        ConnectionManager::new(cfg.mqtt.clone(), Arc::new(transport)).unwrap_or_else(|e| {
            error!("Failed to create connection manager: {}", e);
            process::exit(1);
        });

    if std::env::args().any(|arg| arg == "--diagnose") {
        return run_diagnostics(manager).await;
    }

    let availability = cfg.availability();
    availability.install(&manager);

    if cfg.discovery.enabled {
        info!(
            "Home Assistant discovery enabled for {} source(s)",
            cfg.discovery.sources.len()
        );
        discovery::republish_on_connect(
            &manager,
            cfg.discovery.settings.clone(),
            cfg.discovery.sources.clone(),
            cfg.discovery.feature_settings(),
        );
    }

    let readiness = Readiness::new();
    readiness.start_listening(manager.subscribe_status());

    let shutdown = CancellationToken::new();
    tokio::spawn(connect_until_established(manager.clone(), shutdown.clone()));

    let relay = Relay::new(manager.clone(), readiness);
    let relay_task = async {
        match relay.run(BufReader::new(tokio::io::stdin()), &shutdown).await {
            Ok(stats) => info!(
                "Input closed after relaying {} detection(s); staying connected",
                stats.forwarded
            ),
            Err(e) => error!("Reading detections failed: {}", e),
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        _ = relay_task => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    shutdown.cancel();
    if manager.is_connected() {
        if let Err(e) = availability
            .publish_offline(&manager, &CancellationToken::new())
            .await
        {
            warn!("Failed to publish offline status: {}", e);
        }
    }
    manager.disconnect().await;
    info!("Shutdown complete");
    Ok(())
}
