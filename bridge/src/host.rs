use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::{Arc, PoisonError},
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use humidifier_common::{
    config::{read_mapping, DiscoveryConfig},
    parse_device_topic, state_topic, CommandMapping, CommandSender, DeviceTopic,
    HumidifierController, HumidifierStatePayload, RawActive, RuntimeConfig, SharedMapping,
    TransitionConfig, TOPIC_CMD_SUBSCRIPTION, TOPIC_SENSOR_SUBSCRIPTION,
};

use crate::{
    api::{Device, SwitchBotClient},
    store::{AppStore, DeviceStates},
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const STATE_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);

type Controllers = Arc<BTreeMap<String, HumidifierController>>;

#[derive(Clone)]
struct AppState {
    controllers: Controllers,
    mapping: SharedMapping,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct HumidityView {
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "currentHumidity")]
    current_humidity: Option<f32>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let states = store.load_device_states().await.unwrap_or_else(|err| {
        warn!("failed to load device states from store: {err:#}");
        DeviceStates::new()
    });

    let client = Arc::new(SwitchBotClient::new(&runtime.api)?);
    let remotes = client.list_infrared_remotes().await.unwrap_or_else(|err| {
        warn!("device discovery failed: {err:#}");
        Vec::new()
    });
    let device_ids = select_humidifiers(remotes, &runtime.discovery);
    if device_ids.is_empty() {
        warn!("no humidifiers discovered or configured");
    }

    let mapping = runtime.mapping.clone().into_shared();
    let controllers = build_controllers(
        &device_ids,
        &states,
        &mapping,
        client,
        runtime.transition,
    );

    let network = &runtime.network;
    let mut mqtt_options =
        MqttOptions::new("humidifier-bridge-rust", network.mqtt_host.clone(), network.mqtt_port);
    if !network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        controllers,
        mapping,
        mqtt,
        store,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/devices", get(handle_list_devices))
        .route("/api/devices/{device_id}", get(handle_get_device))
        .route("/api/devices/{device_id}/active", post(handle_set_active))
        .route("/api/devices/{device_id}/target", post(handle_set_target))
        .route("/api/devices/{device_id}/humidity", get(handle_get_humidity))
        .route("/api/mapping", get(handle_get_mapping).put(handle_put_mapping))
        .with_state(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.network.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind bridge server at {addr}"))?;

    info!("bridge listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    persist_device_states(&app_state)
        .await
        .context("failed to persist device states on shutdown")
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(token) = std::env::var("SWITCHBOT_TOKEN") {
        runtime.api.token = token;
    }
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if let Some(port) = env_port("MQTT_PORT") {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        runtime.network.mqtt_pass = pass;
    }
    if let Some(port) = env_port("BRIDGE_HTTP_PORT") {
        runtime.network.http_port = port;
    }
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
}

fn select_humidifiers(remotes: Vec<Device>, discovery: &DiscoveryConfig) -> Vec<String> {
    let mut device_ids = Vec::new();

    for remote in remotes {
        if !discovery.matches_name(&remote.device_name) {
            continue;
        }
        info!(
            "discovered humidifier {} ({}, {}) via hub {}",
            remote.device_name,
            remote.device_id,
            remote.remote_type.as_deref().unwrap_or("unknown type"),
            remote.hub_device_id.as_deref().unwrap_or("unknown")
        );
        device_ids.push(remote.device_id);
    }

    for device_id in &discovery.device_ids {
        if !device_ids.contains(device_id) {
            device_ids.push(device_id.clone());
        }
    }

    device_ids
}

fn build_controllers(
    device_ids: &[String],
    states: &DeviceStates,
    mapping: &SharedMapping,
    sender: Arc<dyn CommandSender>,
    transition: TransitionConfig,
) -> Controllers {
    let controllers = device_ids
        .iter()
        .map(|device_id| {
            let record = states.get(device_id).copied().unwrap_or_default();
            let controller = HumidifierController::new(
                device_id.clone(),
                record,
                Arc::clone(mapping),
                Arc::clone(&sender),
                transition,
            );
            (device_id.clone(), controller)
        })
        .collect();
    Arc::new(controllers)
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_CMD_SUBSCRIPTION, TOPIC_SENSOR_SUBSCRIPTION] {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATE_PUBLISH_INTERVAL);
        loop {
            interval.tick().await;

            for controller in app_state.controllers.values() {
                let payload = HumidifierStatePayload::from(&controller.status());
                match serde_json::to_vec(&payload) {
                    Ok(body) => {
                        if let Err(err) = app_state
                            .mqtt
                            .publish(
                                state_topic(controller.device_id()),
                                QoS::AtLeastOnce,
                                true,
                                body,
                            )
                            .await
                        {
                            warn!("state publish failed for {}: {err}", controller.device_id());
                        }
                    }
                    Err(err) => warn!("state serialization failed: {err}"),
                }
            }

            if let Err(err) = persist_device_states(&app_state).await {
                warn!("failed to persist device states: {err:#}");
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let Some((device_id, kind)) = parse_device_topic(topic) else {
        return Ok(());
    };
    let Some(controller) = app_state.controllers.get(device_id) else {
        debug!("ignoring message for unknown device {device_id}");
        return Ok(());
    };

    match kind {
        DeviceTopic::CmdActive => {
            let Some(active) = parse_active(&message) else {
                warn!("invalid active payload for {device_id}: {message}");
                return Ok(());
            };
            controller.set_active(active).await;
            persist_device_states(app_state).await?;
        }
        DeviceTopic::CmdTarget => {
            if let Ok(target) = message.trim().parse::<f64>() {
                controller.set_target_humidity(target).await;
                persist_device_states(app_state).await?;
            }
        }
        DeviceTopic::SensorHumidity => {
            if let Ok(humidity) = message.trim().parse::<f32>() {
                if humidity.is_finite() && (0.0..=100.0).contains(&humidity) {
                    controller.update_current_humidity(humidity);
                }
            }
        }
    }

    Ok(())
}

fn parse_active(message: &str) -> Option<bool> {
    let lower = message.trim().to_ascii_lowercase();
    match lower.as_str() {
        "on" | "true" => Some(true),
        "off" | "false" => Some(false),
        raw => raw
            .parse::<u8>()
            .ok()
            .and_then(|value| RawActive::try_from(value).ok())
            .map(bool::from),
    }
}

async fn handle_list_devices(State(state): State<AppState>) -> impl IntoResponse {
    let statuses: Vec<_> = state
        .controllers
        .values()
        .map(HumidifierController::status)
        .collect();
    Json(statuses)
}

async fn handle_get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    match state.controllers.get(&device_id) {
        Some(controller) => Json(controller.status()).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Unknown device"),
    }
}

async fn handle_get_humidity(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    let Some(controller) = state.controllers.get(&device_id) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown device");
    };
    Json(HumidityView {
        current_humidity: controller.current_humidity(),
        device_id,
    })
    .into_response()
}

async fn handle_set_active(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(controller) = state.controllers.get(&device_id).cloned() else {
        return error_response(StatusCode::NOT_FOUND, "Unknown device");
    };
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(raw) = value
        .parse::<u8>()
        .ok()
        .and_then(|raw| RawActive::try_from(raw).ok())
    else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid active value. Use 0 or 1");
    };

    controller.set_active(bool::from(raw)).await;

    if let Err(err) = persist_device_states(&state).await {
        warn!("failed to persist active update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist device state",
        );
    }

    Json(controller.status()).into_response()
}

async fn handle_set_target(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(controller) = state.controllers.get(&device_id).cloned() else {
        return error_response(StatusCode::NOT_FOUND, "Unknown device");
    };
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(target) = value.parse::<f64>().ok().filter(|target| target.is_finite()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid humidity value");
    };

    controller.set_target_humidity(target).await;

    if let Err(err) = persist_device_states(&state).await {
        warn!("failed to persist target update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist device state",
        );
    }

    Json(controller.status()).into_response()
}

async fn handle_get_mapping(State(state): State<AppState>) -> impl IntoResponse {
    Json(read_mapping(&state.mapping))
}

async fn handle_put_mapping(
    State(state): State<AppState>,
    Json(mapping): Json<CommandMapping>,
) -> impl IntoResponse {
    if let Err(message) = validate_mapping(&mapping) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    match apply_mapping_update(&state.store, &state.mapping, mapping).await {
        Ok(mapping) => Json(mapping).into_response(),
        Err(err) => {
            warn!("failed to persist mapping update: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist command mapping",
            )
        }
    }
}

// Controllers only see the new mapping once it is on disk.
async fn apply_mapping_update(
    store: &AppStore,
    shared: &SharedMapping,
    mut mapping: CommandMapping,
) -> anyhow::Result<CommandMapping> {
    mapping.sanitize();

    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load existing runtime config for update: {err:#}");
        RuntimeConfig::default()
    });
    runtime.mapping = mapping.clone();
    store.save_runtime_config(&runtime).await?;

    *shared.write().unwrap_or_else(PoisonError::into_inner) = mapping.clone();
    Ok(mapping)
}

fn validate_mapping(mapping: &CommandMapping) -> Result<(), &'static str> {
    if mapping.power.trim().is_empty() {
        return Err("power cannot be empty");
    }
    if mapping.humidity.trim().is_empty() {
        return Err("humidity cannot be empty");
    }
    Ok(())
}

async fn persist_device_states(state: &AppState) -> anyhow::Result<()> {
    let snapshot: DeviceStates = state
        .controllers
        .iter()
        .map(|(device_id, controller)| (device_id.clone(), controller.snapshot()))
        .collect();
    state.store.save_device_states(&snapshot).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use humidifier_common::HumidifierState;

    use super::*;

    fn remote(device_id: &str, device_name: &str) -> Device {
        Device {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            remote_type: Some("Others".to_string()),
            hub_device_id: Some("F3709208082A".to_string()),
        }
    }

    #[test]
    fn parses_active_payloads() {
        assert_eq!(parse_active("1"), Some(true));
        assert_eq!(parse_active(" ON "), Some(true));
        assert_eq!(parse_active("0"), Some(false));
        assert_eq!(parse_active("off"), Some(false));
        assert_eq!(parse_active("2"), None);
        assert_eq!(parse_active("maybe"), None);
    }

    #[test]
    fn selects_named_remotes_and_static_ids() {
        let mut discovery = DiscoveryConfig::default();
        discovery.device_ids = vec!["static-1".to_string(), "ir-1".to_string()];

        let selected = select_humidifiers(
            vec![
                remote("ir-1", "加湿器"),
                remote("ir-2", "TV"),
                remote("ir-3", "Office Humidifier"),
            ],
            &discovery,
        );

        assert_eq!(selected, vec!["ir-1", "ir-3", "static-1"]);
    }

    #[test]
    fn rejects_blank_mapping_commands() {
        let mut mapping = CommandMapping::default();
        assert!(validate_mapping(&mapping).is_ok());

        mapping.humidity = " ".to_string();
        assert_eq!(validate_mapping(&mapping), Err("humidity cannot be empty"));
    }

    #[tokio::test]
    async fn mapping_update_is_saved_before_it_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::at(dir.path());
        tokio::fs::write(
            dir.path().join("runtime.json"),
            br#"{"api":{"token":"secret"}}"#,
        )
        .await
        .unwrap();
        let shared = CommandMapping::default().into_shared();

        let update = CommandMapping {
            power: "電源".to_string(),
            power_on: Some(" ".to_string()),
            power_off: None,
            humidity: "湿度".to_string(),
        };
        let applied = apply_mapping_update(&store, &shared, update).await.unwrap();

        assert_eq!(applied.power_on, None);
        assert_eq!(read_mapping(&shared), applied);
        let runtime = store.load_runtime_config().await.unwrap();
        assert_eq!(runtime.mapping, applied);
        assert_eq!(runtime.api.token, "secret");
    }

    #[tokio::test]
    async fn failed_mapping_save_leaves_shared_mapping_alone() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the runtime file should be makes the write fail.
        tokio::fs::create_dir_all(dir.path().join("runtime.json"))
            .await
            .unwrap();
        let store = AppStore::at(dir.path());
        let shared = CommandMapping::default().into_shared();

        let mut update = CommandMapping::default();
        update.humidity = "湿度".to_string();

        assert!(apply_mapping_update(&store, &shared, update).await.is_err());
        assert_eq!(read_mapping(&shared), CommandMapping::default());
    }

    #[tokio::test]
    async fn controllers_restore_persisted_records() {
        let mut states = DeviceStates::new();
        let saved = HumidifierState {
            active: true,
            target_humidity: 70,
            internal_position: Some(55),
        };
        states.insert("known".to_string(), saved);

        let controllers = build_controllers(
            &["known".to_string(), "fresh".to_string()],
            &states,
            &CommandMapping::default().into_shared(),
            Arc::new(SwitchBotClient::disabled()),
            TransitionConfig::default(),
        );

        assert_eq!(controllers["known"].snapshot(), saved);
        assert_eq!(controllers["fresh"].snapshot(), HumidifierState::default());
    }
}
