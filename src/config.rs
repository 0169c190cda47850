use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const GENERATED_SECRET_LEN: usize = 256;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bind: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
    pub rate_limit_seconds: f64,
    pub tracked_clients: usize,
    pub max_body_bytes: usize,
    pub token_store_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub log_line_ceiling: usize,
    pub poll_interval_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation_interval_minutes: Option<f64>,
    pub runtime_timeout_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_prefix: Option<String>,
    pub compose_dir: PathBuf,
    pub compose_files: Vec<PathBuf>,
    pub env_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            shared_secret: None,
            rate_limit_seconds: 1.0,
            tracked_clients: 100,
            max_body_bytes: 64 * 1024,
            token_store_path: "/data/data.txt".into(),
            audit_log_path: "update.log".into(),
            log_line_ceiling: 250,
            poll_interval_seconds: 2.5,
            reconciliation_interval_minutes: None,
            runtime_timeout_seconds: 600.0,
            project_name: None,
            container_prefix: None,
            compose_dir: ".".into(),
            compose_files: Vec::new(),
            env_file: ".env".into(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("semaphore.toml"))
            .merge(Json::file("semaphore.json"))
            .merge(Env::prefixed("SEMAPHORE_"));
        Self::from_figment(figment)
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("SEMAPHORE_SHARED_SECRET_FILE") {
            config.shared_secret = Some(std::fs::read_to_string(secret_file)?.trim().to_string());
        }
        if config.shared_secret.is_none() {
            config.shared_secret = std::env::var("SEMAPHORE_PASSWORD").ok();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.tracked_clients == 0 {
            anyhow::bail!("tracked_clients must be at least 1");
        }
        if self.log_line_ceiling == 0 {
            anyhow::bail!("log_line_ceiling must be at least 1");
        }
        if !(self.rate_limit_seconds >= 0.0 && self.rate_limit_seconds.is_finite()) {
            anyhow::bail!("rate_limit_seconds must be a non-negative number");
        }
        if !(self.poll_interval_seconds > 0.0 && self.poll_interval_seconds.is_finite()) {
            anyhow::bail!("poll_interval_seconds must be positive");
        }
        if !(self.runtime_timeout_seconds > 0.0 && self.runtime_timeout_seconds.is_finite()) {
            anyhow::bail!("runtime_timeout_seconds must be positive");
        }
        Ok(())
    }

    /// The configured secret, or a random one nobody knows.
    pub fn resolve_secret(&self) -> String {
        match &self.shared_secret {
            Some(secret) => secret.clone(),
            None => rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(GENERATED_SECRET_LEN)
                .map(char::from)
                .collect(),
        }
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.runtime_timeout_seconds)
    }

    /// Project identifier from the config, or `COMPOSE_PROJECT_NAME` in the
    /// env file.  Reconciliation cannot run without it.
    pub fn resolve_project_name(&self) -> anyhow::Result<String> {
        if let Some(name) = &self.project_name {
            return Ok(name.clone());
        }
        let contents = std::fs::read_to_string(&self.env_file).map_err(|e| {
            anyhow::anyhow!(
                "project_name not configured and {} unreadable: {}",
                self.env_file.display(),
                e
            )
        })?;
        project_name_from_env(&contents).ok_or_else(|| {
            anyhow::anyhow!(
                "COMPOSE_PROJECT_NAME not specified in {}",
                self.env_file.display()
            )
        })
    }

    pub fn resolve_container_prefix(&self) -> anyhow::Result<String> {
        match &self.container_prefix {
            Some(prefix) => Ok(prefix.clone()),
            None => Ok(format!("{}_", self.resolve_project_name()?)),
        }
    }

    pub fn resolve_compose_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        if !self.compose_files.is_empty() {
            return Ok(self.compose_files.clone());
        }
        discover_compose_files(&self.compose_dir)
    }
}

fn project_name_from_env(contents: &str) -> Option<String> {
    contents
        .lines()
        .find(|line| line.starts_with("COMPOSE_PROJECT_NAME"))
        .and_then(|line| line.replace(' ', "").split('=').nth(1).map(str::to_string))
        .filter(|name| !name.is_empty())
}

/// `docker-compose*.yml` files in `dir`, shortest path first so the base
/// file precedes its overrides.
fn discover_compose_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .map_err(|e| anyhow::anyhow!("Cannot read compose_dir {}: {}", dir.display(), e))?
    {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("docker-compose") && n.ends_with(".yml"))
            .unwrap_or(false);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    if files.is_empty() {
        anyhow::bail!("No docker-compose*.yml files found in {}", dir.display());
    }
    files.sort_by(|a, b| {
        let (a, b) = (a.as_os_str(), b.as_os_str());
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    });
    Ok(files)
}
