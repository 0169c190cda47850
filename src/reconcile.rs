//! One reconciliation pass: read pending signals, work out which managed
//! containers they hit, pull the new images and replace the containers.
//!
//! A pass never fails outward.  Runtime errors are folded into the
//! [`PassResult`] so the scheduler can log them and carry on.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};

use crate::error::RuntimeError;
use crate::runtime::{ComposeStack, ContainerRuntime};
use crate::token_store::TokenStore;
use crate::types::{PassOutcome, PassResult, UpdatePlan};

pub struct Reconciler<R> {
    runtime: R,
    store: Arc<TokenStore>,
    stack: ComposeStack,
    container_prefix: String,
    call_timeout: Duration,
}

impl<R: ContainerRuntime> Reconciler<R> {
    pub fn new(
        runtime: R,
        store: Arc<TokenStore>,
        stack: ComposeStack,
        container_prefix: String,
        call_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            store,
            stack,
            container_prefix,
            call_timeout,
        }
    }

    pub async fn run_pass(&self) -> PassOutcome {
        let snapshot = match self.store.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Failed to read {}: {}", self.store.path().display(), e);
                return PassOutcome::Completed(PassResult {
                    error: Some(format!("reading pending signals: {e}")),
                    ..Default::default()
                });
            }
        };
        if snapshot.tokens.is_empty() {
            return PassOutcome::NoUpdate;
        }
        info!("Reconciling {} pending signal(s)", snapshot.tokens.len());

        let mut result = PassResult::default();
        let retained = match self.apply(&snapshot.tokens, &mut result).await {
            Ok(retained) => Some(retained),
            Err(e) => {
                error!("Reconciliation pass failed: {:#}", e);
                result.error = Some(format!("{e:#}"));
                None
            }
        };
        if result.error.is_none() && !result.pull_failures.is_empty() {
            let failed: Vec<&str> = result.pull_failures.keys().map(String::as_str).collect();
            result.error = Some(format!("failed to pull {}", failed.join(", ")));
        }

        // A hard failure keeps every signal; otherwise only the signals whose
        // containers were spared by a failed pull go back into the store.
        if let Some(retained) = retained {
            if let Err(e) = self.store.consume(&snapshot, &retained).await {
                error!("Failed to consume {}: {}", self.store.path().display(), e);
                result.error = Some(format!("consuming pending signals: {e}"));
            }
        }
        PassOutcome::Completed(result)
    }

    /// Executes the plan for `signals` and returns the signals that still
    /// need another pass.
    async fn apply(
        &self,
        signals: &BTreeSet<String>,
        result: &mut PassResult,
    ) -> anyhow::Result<BTreeSet<String>> {
        let containers = self
            .call("list", self.runtime.list(&self.container_prefix))
            .await
            .context("listing managed containers")?;
        let mut plan = UpdatePlan::build(signals, &containers);
        if plan.is_empty() {
            info!("No managed container matches the pending signals");
        }

        for image in &plan.images_to_pull {
            match self.call("pull", self.runtime.pull(image)).await {
                Ok(()) => {
                    result.pulled_images.insert(image.clone());
                }
                Err(e) => {
                    warn!("Pull of {} failed: {}", image, e);
                    result.pull_failures.insert(image.clone(), e.to_string());
                }
            }
        }
        // Containers are only torn down once their replacement image is here.
        let (rebuild, spared): (Vec<_>, Vec<_>) = std::mem::take(&mut plan.containers_to_rebuild)
            .into_iter()
            .partition(|(_, image)| result.pulled_images.contains(image));
        let retained = signals
            .iter()
            .filter(|s| spared.iter().any(|(name, image)| name == *s || image == *s))
            .cloned()
            .collect();

        let mut errors: Vec<anyhow::Error> = Vec::new();
        for (name, _) in &rebuild {
            if let Err(e) = self.teardown(name).await {
                warn!("Teardown of {} failed: {:#}", name, e);
                errors.push(e);
                break;
            }
            result.rebuilt_containers.insert(name.clone());
        }

        // Always bring the stack up, so anything removed by this or an
        // earlier interrupted pass is recreated.
        match self
            .call("compose up", self.runtime.compose_up(&self.stack))
            .await
        {
            Ok(()) => {
                for name in &result.rebuilt_containers {
                    match self.call("inspect", self.runtime.inspect(name)).await {
                        Ok(_) => {}
                        Err(RuntimeError::NotFound(_)) => {
                            errors.push(anyhow::anyhow!("{name} not recreated by compose"))
                        }
                        Err(e) => {
                            errors.push(anyhow::Error::new(e).context(format!("inspecting {name}")))
                        }
                    }
                }
            }
            Err(e) => errors.push(anyhow::Error::new(e).context("bringing the stack up")),
        }

        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(|e| format!("{e:#}")).collect();
            anyhow::bail!("{}", messages.join("\n"));
        }
        if !result.rebuilt_containers.is_empty() {
            info!(
                "Rebuilt {}",
                result
                    .rebuilt_containers
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(retained)
    }

    async fn teardown(&self, name: &str) -> anyhow::Result<()> {
        self.call("stop", self.runtime.stop(name))
            .await
            .with_context(|| format!("stopping {name}"))?;
        self.call("remove", self.runtime.remove(name, true))
            .await
            .with_context(|| format!("removing {name}"))
    }

    async fn call<T>(
        &self,
        op: &str,
        fut: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, RuntimeError> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| RuntimeError::Timeout {
                op: op.to_string(),
                after: self.call_timeout,
            })?
    }
}
