use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use terrarium_common::{MqttConfig, INBOUND_TOPICS};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    bus::MqttBus,
    control::{ControlLoop, RuntimeState},
    dispatch::Dispatcher,
    drivers::{build_actuators, build_sensors},
    store::{load_config, ConfigStore},
};

const DEFAULT_CONFIG_PATH: &str = "conf/config.yaml";
const RESTART_DELAY: Duration = Duration::from_secs(10);
const MQTT_RETRY_DELAY: Duration = Duration::from_secs(2);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("TERRARIUM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    loop {
        match serve(&config_path).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                error!("controller failed: {err:#}");
                info!("restarting in {}s", RESTART_DELAY.as_secs());
                tokio::select! {
                    _ = shutdown_signal() => return Ok(()),
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                }
            }
        }
    }
}

/// One controller lifetime. Returns `Ok` on Ctrl-C or SIGTERM after the
/// actuators are switched off.
async fn serve(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path).await?;
    info!(path = %config_path.display(), "configuration loaded");

    let timezone = config
        .timezone
        .as_deref()
        .map(|name| {
            name.parse::<Tz>()
                .map_err(|err| anyhow!("invalid timezone '{name}': {err}"))
        })
        .transpose()?;

    let sensors = build_sensors(&config.sensors).context("failed to set up sensors")?;
    let actuators = build_actuators(&config.actuators).context("failed to set up actuators")?;
    for (name, sensor) in &sensors {
        info!(sensor = %name, kind = sensor.kind(), "sensor configured");
    }
    for (name, actuator) in &actuators {
        info!(actuator = %name, kind = actuator.kind(), "actuator configured");
    }

    let (client, eventloop) = AsyncClient::new(mqtt_options(&config.mqtt), 64);
    let bus = Arc::new(MqttBus::new(client.clone()));

    let store = Arc::new(ConfigStore::new(config_path, &config));
    let runtime = Arc::new(RuntimeState::new(config.schedule.active));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        runtime.clone(),
        bus.clone(),
        timezone,
    ));

    let mqtt_task = spawn_mqtt_loop(client, eventloop, dispatcher);

    let mut control = ControlLoop::new(store, runtime, bus, sensors, actuators)
        .with_tick_interval(Duration::from_millis(config.tick_interval_ms.max(1)))
        .with_timezone(timezone);
    control.run(shutdown_signal()).await;

    mqtt_task.abort();
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM. The SIGTERM handler is installed when this
/// is called, not when the future is first polled.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());

    async move {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {err}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match terminate {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    warn!("failed to listen for SIGTERM: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        info!("shutdown requested");
    }
}

/// Connection settings from the config file, overridden by `MQTT_HOST`,
/// `MQTT_PORT`, `MQTT_USER` and `MQTT_PASS`.
fn mqtt_options(mqtt: &MqttConfig) -> MqttOptions {
    let host = std::env::var("MQTT_HOST").unwrap_or(mqtt.host.clone());
    let port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(mqtt.port);

    info!(host = %host, port, client_id = %mqtt.client_id, "mqtt broker");
    let mut options = MqttOptions::new(mqtt.client_id.clone(), host, port);
    options.set_keep_alive(Duration::from_secs(15));

    let user = std::env::var("MQTT_USER").unwrap_or(mqtt.user.clone());
    let pass = std::env::var("MQTT_PASS").unwrap_or(mqtt.password.clone());
    if !user.is_empty() {
        options.set_credentials(user, pass);
    }
    options
}

fn spawn_mqtt_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    dispatcher: Arc<Dispatcher>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    dispatcher.handle(&message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    // Subscriptions do not survive a clean-session reconnect.
                    for topic in INBOUND_TOPICS {
                        if let Err(err) = client.try_subscribe(topic, QoS::AtMostOnce) {
                            warn!("failed to subscribe to {topic}: {err}");
                        }
                    }
                    dispatcher.publish_full_config().await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(MQTT_RETRY_DELAY).await;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sigterm_requests_shutdown() {
        let shutdown = shutdown_signal();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .expect("SIGTERM should resolve the shutdown future");
    }
}
