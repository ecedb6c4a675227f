use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Mutex, RwLock},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use heating_engine::{
    entity_from_state_topic, Area, EngineError, EngineEvent, EngineStatus, EntityState,
    HeatingEngine, StateCache, TickReport, TickTime, TOPIC_ENGINE_STATUS, TOPIC_EVENTS,
    TOPIC_STATE_WILDCARD,
};

use crate::{
    api,
    dispatch::{spawn_dispatcher, ChannelSink, QUEUE_CAPACITY},
    store::{AppStore, RuntimeConfig},
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 4_096;
const CALIBRATION_POLL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Mutex<HeatingEngine>>,
    pub states: Arc<RwLock<StateCache>>,
    pub timezone: Arc<Mutex<String>>,
    pub time_synced: Arc<AtomicBool>,
    pub mqtt: AsyncClient,
    pub sink: ChannelSink,
    pub store: AppStore,
    /// Stops the running calibration driver.
    pub calibration: Arc<Mutex<Option<oneshot::Sender<String>>>>,
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
    runtime.sanitize();
    runtime.network.apply_env();

    let mut engine =
        HeatingEngine::new(runtime.engine.clone()).context("engine config rejected")?;

    let areas = store.load_areas().await.unwrap_or_else(|err| {
        warn!("failed to load areas from store: {err:#}");
        Vec::new()
    });
    for area in areas {
        let id = area.id.clone();
        if let Err(err) = engine.upsert_area(area) {
            warn!("skipping stored area {id}: {err}");
        }
    }

    let samples = store.load_samples().await.unwrap_or_else(|err| {
        warn!("failed to load learning samples from store: {err:#}");
        Vec::new()
    });
    let imported = engine.import_samples(samples);
    info!(areas = engine.areas().count(), samples = imported, "engine restored");

    let network = &runtime.network;
    let mut mqtt_options =
        MqttOptions::new("heating-controller", network.mqtt_host.clone(), network.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if !network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let (command_tx, command_rx) = mpsc::channel(QUEUE_CAPACITY);
    spawn_dispatcher(mqtt.clone(), command_rx, runtime.engine.device_timeout_ms);

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        states: Arc::new(RwLock::new(StateCache::new())),
        timezone: Arc::new(Mutex::new(runtime.timezone.clone())),
        time_synced: Arc::new(AtomicBool::new(false)),
        mqtt,
        sink: ChannelSink::new(command_tx),
        store,
        calibration: Arc::new(Mutex::new(None)),
    };

    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(
        app_state.clone(),
        Duration::from_secs(runtime.engine.control_interval_secs),
    );
    spawn_schedule_loop(
        app_state.clone(),
        Duration::from_secs(runtime.engine.schedule_interval_secs),
    );

    let app = api::router(app_state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.network.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(err) = persist_samples(&app_state).await {
        warn!("failed to persist learning samples on shutdown: {err:#}");
    }
    if let Err(err) = persist_areas(&app_state).await {
        warn!("failed to persist areas on shutdown: {err:#}");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    // Polling must not wait on the request queue it drains.
                    if let Err(err) = app_state
                        .mqtt
                        .try_subscribe(TOPIC_STATE_WILDCARD, QoS::AtMostOnce)
                    {
                        warn!("mqtt subscribe failed: {err}");
                    }
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

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let Some(entity_id) = entity_from_state_topic(topic) else {
        return Ok(());
    };
    let state = parse_entity_state(payload)
        .with_context(|| format!("invalid state payload for {entity_id}"))?;
    app_state.states.write().await.update(entity_id, state);
    Ok(())
}

/// JSON `EntityState` objects, or a bare value such as `21.5` or `on`.
fn parse_entity_state(payload: &[u8]) -> anyhow::Result<EntityState> {
    let text = std::str::from_utf8(payload)
        .context("non utf8 mqtt payload")?
        .trim();
    if text.starts_with('{') {
        Ok(serde_json::from_str(text)?)
    } else {
        Ok(EntityState::new(text))
    }
}

fn spawn_control_loop(app_state: AppState, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let now = tick_time(&app_state).await;

            let (report, status) = {
                let mut engine = app_state.engine.lock().await;
                let states = app_state.states.read().await;
                let mut sink = app_state.sink.clone();
                let report = engine.control_tick(now, &*states, &mut sink);
                (report, engine.status(now.wall))
            };

            if !report.failures.is_empty() {
                debug!(failures = report.failures.len(), "control tick finished with failures");
            }
            publish_events(&app_state.mqtt, &report.events).await;
            publish_status(&app_state.mqtt, &status).await;
            persist_after(&app_state, &report).await;
        }
    });
}

fn spawn_schedule_loop(app_state: AppState, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let now = tick_time(&app_state).await;

            let report = {
                let mut engine = app_state.engine.lock().await;
                let states = app_state.states.read().await;
                engine.schedule_tick(now, &*states)
            };
            publish_events(&app_state.mqtt, &report.events).await;
        }
    });
}

/// Claims the boiler for OPV calibration and starts the task that drives it.
pub async fn start_calibration(app_state: &AppState) -> Result<f32, EngineError> {
    let now = tick_time(app_state).await;
    let setpoint = {
        let mut engine = app_state.engine.lock().await;
        let mut sink = app_state.sink.clone();
        engine.start_calibration(now, &mut sink)?
    };

    let (stop_tx, stop_rx) = oneshot::channel();
    *app_state.calibration.lock().await = Some(stop_tx);
    publish_events(&app_state.mqtt, &[EngineEvent::CalibrationStarted { setpoint }]).await;
    spawn_calibration_driver(app_state.clone(), stop_rx);
    Ok(setpoint)
}

/// Aborts the running calibration and stops its driver.
pub async fn abort_calibration(app_state: &AppState, reason: &str) -> Result<(), EngineError> {
    let event = app_state.engine.lock().await.abort_calibration(reason)?;
    if let Some(stop) = app_state.calibration.lock().await.take() {
        let _ = stop.send(reason.to_string());
    }
    publish_events(&app_state.mqtt, &[event]).await;
    Ok(())
}

fn spawn_calibration_driver(app_state: AppState, mut stop_rx: oneshot::Receiver<String>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CALIBRATION_POLL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first setpoint went out with the start request.
        interval.tick().await;

        loop {
            tokio::select! {
                reason = &mut stop_rx => {
                    debug!("calibration driver stopped: {reason:?}");
                    break;
                }
                _ = interval.tick() => {
                    let now = tick_time(&app_state).await;
                    let report = {
                        let mut engine = app_state.engine.lock().await;
                        let states = app_state.states.read().await;
                        let mut sink = app_state.sink.clone();
                        engine.calibration_tick(now, &*states, &mut sink)
                    };
                    // The control tick may already have expired it.
                    let Some(report) = report else { break };

                    publish_events(&app_state.mqtt, &report.events).await;
                    persist_after(&app_state, &report).await;
                    if !report.events.is_empty() {
                        break;
                    }
                }
            }
        }

        drop(stop_rx);
        let mut slot = app_state.calibration.lock().await;
        if slot.as_ref().is_some_and(|stop| stop.is_closed()) {
            slot.take();
        }
    });
}

pub async fn publish_events(mqtt: &AsyncClient, events: &[EngineEvent]) {
    for event in events {
        match serde_json::to_vec(event) {
            Ok(body) => {
                if let Err(err) = mqtt.publish(TOPIC_EVENTS, QoS::AtLeastOnce, false, body).await {
                    warn!("event publish failed: {err}");
                }
            }
            Err(err) => warn!("event serialization failed: {err}"),
        }
    }
}

async fn publish_status(mqtt: &AsyncClient, status: &EngineStatus) {
    match serde_json::to_vec(status) {
        Ok(body) => {
            if let Err(err) = mqtt
                .publish(TOPIC_ENGINE_STATUS, QoS::AtLeastOnce, true, body)
                .await
            {
                warn!("engine status publish failed: {err}");
            }
        }
        Err(err) => warn!("engine status serialization failed: {err}"),
    }
}

/// Writes back whatever a tick changed on its own.
async fn persist_after(app_state: &AppState, report: &TickReport) {
    if report.has_event("heating_sample_recorded") {
        if let Err(err) = persist_samples(app_state).await {
            warn!("failed to persist learning samples: {err:#}");
        }
    }
    if report.has_event("manual_override_detected") || report.has_event("boost_expired") {
        if let Err(err) = persist_areas(app_state).await {
            warn!("failed to persist areas: {err:#}");
        }
    }
    if report.has_event("calibration_finished") || report.has_event("auto_tune_finished") {
        if let Err(err) = persist_runtime_from_state(app_state).await {
            warn!("failed to persist runtime config: {err:#}");
        }
    }
}

pub async fn persist_areas(state: &AppState) -> anyhow::Result<()> {
    let areas: Vec<Area> = state.engine.lock().await.areas().cloned().collect();
    state.store.save_areas(&areas).await
}

pub async fn persist_samples(state: &AppState) -> anyhow::Result<()> {
    let samples = state.engine.lock().await.export_samples();
    state.store.save_samples(&samples).await
}

pub async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    let engine = state.engine.lock().await.config().clone();
    let timezone = state.timezone.lock().await.clone();

    let mut runtime = state.store.load_runtime_config().await?;
    runtime.engine = engine;
    runtime.timezone = timezone;
    state.store.save_runtime_config(&runtime).await
}

/// Wall-clock in the configured zone plus the monotonic clock. Falls back to
/// UTC when the zone cannot be resolved.
pub async fn tick_time(state: &AppState) -> TickTime {
    let timezone = state.timezone.lock().await.clone();
    let local = now_in_timezone(&timezone);
    state.time_synced.store(local.is_some(), Ordering::Relaxed);
    let wall = local.unwrap_or_else(|| Utc::now().fixed_offset());
    TickTime::new(wall, monotonic_ms())
}

pub fn now_in_timezone(timezone: &str) -> Option<DateTime<FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_json_and_bare_state_payloads() {
        let state = parse_entity_state(
            br#"{"value":"heat","attributes":{"temperature":21.0,"hvac_action":"heating"}}"#,
        )
        .unwrap();
        assert_eq!(state.value, "heat");
        assert!(state.available);
        assert_eq!(state.attribute_f32("temperature"), Some(21.0));

        let bare = parse_entity_state(b" 19.5\n").unwrap();
        assert_eq!(bare.numeric(), Some(19.5));

        assert!(parse_entity_state(b"{not json").is_err());
        assert!(parse_entity_state(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn resolves_known_timezones_only() {
        assert!(now_in_timezone("Europe/Berlin").is_some());
        assert!(now_in_timezone("Nowhere/Special").is_none());
    }

    #[test]
    fn monotonic_clock_never_goes_back() {
        let first = monotonic_ms();
        let second = monotonic_ms();
        assert!(second >= first);
    }
}
