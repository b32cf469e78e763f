use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

use humidifier_common::{HumidifierState, RuntimeConfig};

pub type DeviceStates = BTreeMap<String, HumidifierState>;

#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    state_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new() -> Self {
        let data_dir = std::env::var("HUMIDIFIER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.humidifier"));
        Self::at(data_dir)
    }

    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            state_path: Arc::new(data_dir.join("state.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        load_json(&self.runtime_path).await
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        save_json(&self.runtime_path, runtime).await
    }

    pub async fn load_device_states(&self) -> anyhow::Result<DeviceStates> {
        let _guard = self.lock.lock().await;
        load_json(&self.state_path).await
    }

    pub async fn save_device_states(&self, states: &DeviceStates) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        save_json(&self.state_path, states).await
    }
}

async fn load_json<T: DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<T>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

async fn save_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_files_load_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::at(dir.path().join("nested"));

        assert!(store.load_device_states().await.unwrap().is_empty());
        let runtime = store.load_runtime_config().await.unwrap();
        assert_eq!(runtime.transition.grace_period_ms, 3_000);
    }

    #[tokio::test]
    async fn device_states_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::at(dir.path());

        let mut states = DeviceStates::new();
        states.insert(
            "02-202102111506-97603093".to_string(),
            HumidifierState {
                active: true,
                target_humidity: 65,
                internal_position: Some(60),
            },
        );
        store.save_device_states(&states).await.unwrap();

        assert_eq!(store.load_device_states().await.unwrap(), states);
    }

    #[tokio::test]
    async fn corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("state.json"), b"not json")
            .await
            .unwrap();

        let store = AppStore::at(dir.path());
        assert!(store.load_device_states().await.is_err());
    }
}
