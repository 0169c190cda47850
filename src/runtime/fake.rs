//! In-memory runtime for tests.  Records every call in order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ComposeStack, ContainerRuntime};
use crate::error::RuntimeError;
use crate::types::ContainerDescriptor;

#[derive(Default)]
pub struct FakeRuntime {
    /// Live containers, name -> image.
    pub containers: Mutex<BTreeMap<String, String>>,
    /// Containers compose brings back, name -> image.
    pub defined: BTreeMap<String, String>,
    pub failing_pulls: BTreeSet<String>,
    pub failing_stops: BTreeSet<String>,
    pub fail_list: bool,
    pub fail_compose: AtomicBool,
    /// Every call hangs this long before answering.
    pub delay: Option<Duration>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn with_containers(containers: &[(&str, &str)]) -> Self {
        let map: BTreeMap<String, String> = containers
            .iter()
            .map(|(n, i)| (n.to_string(), i.to_string()))
            .collect();
        Self {
            containers: Mutex::new(map.clone()),
            defined: map,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect(&self, name: &str) -> Result<serde_json::Value, RuntimeError> {
        self.record(format!("inspect {name}")).await;
        match self.containers.lock().unwrap().get(name) {
            Some(image) => Ok(serde_json::json!({ "Name": format!("/{name}"), "Config": { "Image": image } })),
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(format!("pull {image}")).await;
        if self.failing_pulls.contains(image) {
            return Err(RuntimeError::unavailable(format!("pull {image}"), "manifest unknown"));
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("stop {name}")).await;
        if self.failing_stops.contains(name) {
            return Err(RuntimeError::unavailable(format!("stop {name}"), "device busy"));
        }
        Ok(())
    }

    async fn remove(&self, name: &str, purge_volumes: bool) -> Result<(), RuntimeError> {
        self.record(format!("remove {name} volumes={purge_volumes}")).await;
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        self.record(format!("list {prefix}")).await;
        if self.fail_list {
            return Err(RuntimeError::unavailable("list", "daemon not reachable"));
        }
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, image)| ContainerDescriptor::new(name.clone(), image.clone()))
            .collect())
    }

    async fn compose_up(&self, _stack: &ComposeStack) -> Result<(), RuntimeError> {
        self.record("compose up".to_string()).await;
        if self.fail_compose.load(Ordering::SeqCst) {
            return Err(RuntimeError::unavailable("compose up", "exit status 1"));
        }
        let mut live = self.containers.lock().unwrap();
        for (name, image) in &self.defined {
            live.entry(name.clone()).or_insert_with(|| image.clone());
        }
        Ok(())
    }
}
