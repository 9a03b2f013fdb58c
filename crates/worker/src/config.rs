use std::path::PathBuf;
use std::time::Duration;

use genqueue_pipeline::config::OrchestratorConfig;
use genqueue_pipeline::error::PipelineError;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8188";
const DEFAULT_WORKFLOW_TYPE: &str = "txt2img";
const DEFAULT_PROGRESS_LOG_SECS: u64 = 10;

/// Settings for one worker run.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the ComfyUI HTTP API.
    pub api_url: String,
    /// One prompt per line.
    pub prompts_file: PathBuf,
    /// API-format workflow graph the prompts are injected into.
    pub workflow_file: Option<PathBuf>,
    pub workflow_type: String,
    pub priority: i32,
    /// Emit JSON log lines instead of human-readable ones.
    pub log_json: bool,
    /// Minimum spacing of progress log lines.
    pub progress_log_interval: Duration,
    pub pipeline: OrchestratorConfig,
}

impl WorkerConfig {
    /// Load worker settings from environment variables.
    ///
    /// | Env Var                          | Default                 |
    /// |----------------------------------|-------------------------|
    /// | `COMFYUI_API_URL`                | `http://127.0.0.1:8188` |
    /// | `GENQUEUE_PROMPTS_FILE`          | required                |
    /// | `GENQUEUE_WORKFLOW_FILE`         | unset                   |
    /// | `GENQUEUE_WORKFLOW_TYPE`         | `txt2img`               |
    /// | `GENQUEUE_PRIORITY`              | `0`                     |
    /// | `GENQUEUE_LOG_JSON`              | `false`                 |
    /// | `GENQUEUE_PROGRESS_LOG_SECS`     | `10`                    |
    ///
    /// Pipeline settings come from [`OrchestratorConfig::from_env`].
    pub fn from_env() -> Result<Self, PipelineError> {
        let mut config = Self::from_lookup(|name| std::env::var(name).ok())?;
        config.pipeline = OrchestratorConfig::from_env()?;
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let prompts_file = non_empty("GENQUEUE_PROMPTS_FILE")
            .map(PathBuf::from)
            .ok_or_else(|| PipelineError::Config("GENQUEUE_PROMPTS_FILE is required".to_string()))?;

        let priority: i32 = match non_empty("GENQUEUE_PRIORITY") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                PipelineError::Config(format!("GENQUEUE_PRIORITY must be an integer: {raw:?}"))
            })?,
            None => 0,
        };

        let progress_secs: u64 = match non_empty("GENQUEUE_PROGRESS_LOG_SECS") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                PipelineError::Config(format!(
                    "GENQUEUE_PROGRESS_LOG_SECS must be a whole number of seconds: {raw:?}"
                ))
            })?,
            None => DEFAULT_PROGRESS_LOG_SECS,
        };

        let log_json = non_empty("GENQUEUE_LOG_JSON")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            api_url: non_empty("COMFYUI_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            prompts_file,
            workflow_file: non_empty("GENQUEUE_WORKFLOW_FILE").map(PathBuf::from),
            workflow_type: non_empty("GENQUEUE_WORKFLOW_TYPE")
                .unwrap_or_else(|| DEFAULT_WORKFLOW_TYPE.to_string()),
            priority,
            log_json,
            progress_log_interval: Duration::from_secs(progress_secs),
            pipeline: OrchestratorConfig::default(),
        })
    }
}
