use std::{
    process,
    sync::{Arc, OnceLock},
};

use speedtest2mqtt::{
    config::Config,
    core::{
        discovery::DeviceDescriptor,
        runner::SpeedtestRunner,
        scheduler::Scheduler,
        session::SessionManager,
        topics::{TopicPublisher, TopicSink, Topics},
    },
    logger::LoggerManager,
    print_error,
};
use speedtest2mqtt_mqtt::MqttManager;
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

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

#[tokio::main]
async fn main() {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting speedtest2mqtt version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.effective_level());
    debug!("{:#?}", cfg.speedtest);
    debug!("{:#?}", cfg.homeassistant);

    let device = DeviceDescriptor::from(&cfg.homeassistant);
    let topics = Topics::new(device.device_id.as_str());

    let manager = MqttManager::from_config(cfg.transport.clone()).unwrap_or_else(|e| {
        error!("Failed to create MqttManager: {}", e);
        process::exit(1);
    });
    let instance = manager
        .with_last_will(topics.status(), "offline")
        .build_and_start()
        .await
        .unwrap_or_else(|e| {
            error!("Failed to build and start MQTT client: {}", e);
            process::exit(1);
        });
    info!("MQTT client started");

    let sink: Arc<dyn TopicSink> = Arc::new(instance.clone());
    let publisher = TopicPublisher::new(sink);
    let cancel = CancellationToken::new();

    let session = SessionManager::new(
        publisher.clone(),
        device,
        cfg.homeassistant.enable_discovery,
    );
    let session_task = tokio::spawn(session.run(instance.state_receiver(), cancel.clone()));

    let runner = SpeedtestRunner::from_config(&cfg.speedtest);
    debug!("Speedtest arguments: {:?}", runner.command_args());
    let scheduler = Scheduler::new(
        Arc::new(runner),
        publisher,
        topics.clone(),
        cfg.speedtest.refresh_interval(),
    );
    let mut scheduler_task = tokio::spawn(scheduler.run(instance.state_receiver(), cancel.clone()));

    tokio::select! {
        result = &mut scheduler_task => {
            error!("Scheduler unexpectedly finished: {:?}", result);
        }
        _ = shutdown_signal() => {}
    }

    cancel.cancel();
    if !scheduler_task.is_finished() {
        let _ = scheduler_task.await;
    }
    let _ = session_task.await;

    if let Err(e) = instance.shutdown(Some(&topics.status())).await {
        warn!("MQTT shutdown incomplete: {}", e);
    }

    info!("Shutdown complete");
}
