use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono_tz::Tz;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use heating_engine::{Area, EngineConfig, HeatingSample};

const DEFAULT_TIMEZONE: &str = "Europe/Berlin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.mqtt_host.trim().is_empty() {
            self.mqtt_host = defaults.mqtt_host;
        }
        if self.mqtt_port == 0 {
            self.mqtt_port = defaults.mqtt_port;
        }
        if self.http_port == 0 {
            self.http_port = defaults.http_port;
        }
    }

    /// Environment wins over the stored values.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("MQTT_HOST") {
            self.mqtt_host = host;
        }
        if let Some(port) = env_port("MQTT_PORT") {
            self.mqtt_port = port;
        }
        if let Ok(user) = std::env::var("MQTT_USER") {
            self.mqtt_user = user;
        }
        if let Ok(pass) = std::env::var("MQTT_PASS") {
            self.mqtt_pass = pass;
        }
        if let Some(port) = env_port("CONTROLLER_HTTP_PORT") {
            self.http_port = port;
        }
    }
}

fn env_port(key: &str) -> Option<u16> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .filter(|port| *port > 0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Falls back to defaults for anything the engine or the host would
    /// refuse, so a damaged file never keeps the controller down.
    pub fn sanitize(&mut self) {
        if let Err(err) = self.engine.validate() {
            warn!("stored engine config rejected, using defaults: {err}");
            self.engine = EngineConfig::default();
        }
        if self.timezone.parse::<Tz>().is_err() {
            warn!("unknown timezone '{}', using {DEFAULT_TIMEZONE}", self.timezone);
            self.timezone = DEFAULT_TIMEZONE.to_string();
        }
        self.network.sanitize();
    }
}

#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    areas_path: Arc<PathBuf>,
    learning_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new() -> Self {
        let data_dir = std::env::var("HEATING_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heating"));
        Self::in_dir(data_dir)
    }

    pub fn in_dir(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            areas_path: Arc::new(data_dir.join("areas.json")),
            learning_path: Arc::new(data_dir.join("learning.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        self.read(&self.runtime_path).await
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        self.write(&self.runtime_path, runtime).await
    }

    pub async fn load_areas(&self) -> anyhow::Result<Vec<Area>> {
        self.read(&self.areas_path).await
    }

    pub async fn save_areas(&self, areas: &[Area]) -> anyhow::Result<()> {
        self.write(&self.areas_path, areas).await
    }

    pub async fn load_samples(&self) -> anyhow::Result<Vec<HeatingSample>> {
        self.read(&self.learning_path).await
    }

    pub async fn save_samples(&self, samples: &[HeatingSample]) -> anyhow::Result<()> {
        self.write(&self.learning_path, samples).await
    }

    async fn read<T: DeserializeOwned + Default>(&self, path: &Path) -> anyhow::Result<T> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(serde_json::from_slice::<T>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}
