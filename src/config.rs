use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use url::Url;
use crate::channel::PushChannelConfig;
use crate::upload::admission::DEFAULT_MAX_FILE_SIZE;
use crate::upload::chunking::DEFAULT_CHUNK_SIZE;
use crate::upload::errors::{Result, UploadError};
use crate::upload::types::UploadConfig;
use crate::utils::retry::RetryPolicy;

const WS_PROGRESS_PATH: &str = "ws/upload-progress";

/// Engine settings, usually read from a `config.toml`.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub api_base_url: String,
    /// Derived from `api_base_url` when unset
    pub ws_base_url: Option<String>,
    pub token: Option<String>,
    /// Scopes the push channel; without it no channel is opened
    pub user_id: Option<String>,

    pub chunk_size: u64,
    pub max_file_size: u64,
    pub global_concurrency: usize,
    pub per_task_chunk_concurrency: usize,

    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,

    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    pub sample_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            ws_base_url: None,
            token: None,
            user_id: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            global_concurrency: 3,
            per_task_chunk_concurrency: 10,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            request_timeout_secs: 300,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            sample_interval_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|err| UploadError::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(config_str)
            .map_err(|err| UploadError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let api = Url::parse(&self.api_base_url)
            .map_err(|err| UploadError::Config(format!("api_base_url: {err}")))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(UploadError::Config(format!("api_base_url must be http(s), got {}", api.scheme())));
        }
        if let Some(ws) = &self.ws_base_url {
            Url::parse(ws).map_err(|err| UploadError::Config(format!("ws_base_url: {err}")))?;
        }

        let non_zero = [
            ("chunk_size", self.chunk_size),
            ("max_file_size", self.max_file_size),
            ("global_concurrency", self.global_concurrency as u64),
            ("per_task_chunk_concurrency", self.per_task_chunk_concurrency as u64),
            ("request_timeout_secs", self.request_timeout_secs),
            ("sample_interval_ms", self.sample_interval_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(UploadError::Config(format!("{name} must be greater than zero")));
        }

        if !(1..=10).contains(&self.max_retries) {
            return Err(UploadError::Config(format!(
                "max_retries must be within 1..=10, got {}",
                self.max_retries
            )));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            global_concurrency: self.global_concurrency,
            per_task_chunk_concurrency: self.per_task_chunk_concurrency,
            chunk_size: self.chunk_size,
            max_file_size: self.max_file_size,
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            retry: RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_delay_ms)),
        }
    }

    /// `{ws}/ws/upload-progress?userId=…`, `None` without a `user_id`.
    pub fn websocket_url(&self) -> Result<Option<Url>> {
        let Some(user_id) = &self.user_id else {
            return Ok(None);
        };

        let mut url = match &self.ws_base_url {
            Some(ws) => Url::parse(ws)?,
            None => {
                let mut url = Url::parse(&self.api_base_url)?;
                let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
                url.set_scheme(scheme)
                    .map_err(|_| UploadError::Config(format!("cannot derive websocket url from {}", self.api_base_url)))?;
                url
            }
        };

        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let mut url = url.join(WS_PROGRESS_PATH)?;
        url.query_pairs_mut().append_pair("userId", user_id);

        Ok(Some(url))
    }

    pub fn push_channel_config(&self) -> Result<Option<PushChannelConfig>> {
        Ok(self.websocket_url()?.map(|url| PushChannelConfig {
            url,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }))
    }
}
