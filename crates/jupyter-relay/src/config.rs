//! Endpoint configuration and tuning knobs.
//!
//! Endpoints are immutable values. Reconnecting or switching notebooks
//! replaces them wholesale through the connection managers.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::guarded::OperationKind;

pub const DEFAULT_PORT: u16 = 4040;
pub const DEFAULT_RUNTIME_URL: &str = "http://localhost:8888";
pub const DEFAULT_ROOM_URL: &str = "tcp://127.0.0.1:4041";
pub const DEFAULT_ROOM_ID: &str = "notebook.ipynb";

/// Where the execution runtime lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEndpoint {
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    /// Attach to this kernel instead of starting a new one.
    #[serde(default)]
    pub runtime_id: Option<String>,
}

impl Default for RuntimeEndpoint {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_RUNTIME_URL.to_string(),
            token: None,
            runtime_id: None,
        }
    }
}

/// How the shared notebook document is reached.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// An external room host at `base_url`.
    #[default]
    Room,
    /// A room host started inside this process.
    Embedded,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Room => write!(f, "room"),
            ProviderKind::Embedded => write!(f, "embedded"),
        }
    }
}

/// Where the shared notebook document lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEndpoint {
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    pub path: String,
    #[serde(default)]
    pub provider: ProviderKind,
}

impl Default for DocumentEndpoint {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ROOM_URL.to_string(),
            token: None,
            path: DEFAULT_ROOM_ID.to_string(),
            provider: ProviderKind::default(),
        }
    }
}

impl DocumentEndpoint {
    /// Same server, different notebook.
    pub fn with_path(&self, path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..self.clone()
        }
    }
}

fn default_runtime_url() -> String {
    DEFAULT_RUNTIME_URL.to_string()
}

fn default_room_url() -> String {
    DEFAULT_ROOM_URL.to_string()
}

fn default_room_id() -> String {
    DEFAULT_ROOM_ID.to_string()
}

/// Payload of the administrative connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRuntime {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_runtime_url")]
    pub runtime_url: String,
    #[serde(default)]
    pub runtime_id: Option<String>,
    #[serde(default)]
    pub runtime_token: Option<String>,
    #[serde(default = "default_room_url")]
    pub room_url: String,
    #[serde(default = "default_room_id")]
    pub room_id: String,
    #[serde(default)]
    pub room_token: Option<String>,
}

impl Default for RoomRuntime {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            runtime_url: default_runtime_url(),
            runtime_id: None,
            runtime_token: None,
            room_url: default_room_url(),
            room_id: default_room_id(),
            room_token: None,
        }
    }
}

impl RoomRuntime {
    pub fn runtime_endpoint(&self) -> RuntimeEndpoint {
        RuntimeEndpoint {
            base_url: self.runtime_url.clone(),
            token: self.runtime_token.clone(),
            runtime_id: self.runtime_id.clone(),
        }
    }

    pub fn document_endpoint(&self) -> DocumentEndpoint {
        DocumentEndpoint {
            base_url: self.room_url.clone(),
            token: self.room_token.clone(),
            path: self.room_id.clone(),
            provider: self.provider,
        }
    }
}

/// Named retry budgets per operation category.
///
/// Executions get a single attempt: re-running side-effecting code after a
/// dropped connection could execute it twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub read_attempts: usize,
    pub write_attempts: usize,
    pub execute_attempts: usize,
    pub base_delay: Duration,
    pub step: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            read_attempts: 3,
            write_attempts: 3,
            execute_attempts: 1,
            base_delay: Duration::from_secs(1),
            step: Duration::from_secs(1),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self, kind: OperationKind) -> BackoffPolicy {
        let max_attempts = match kind {
            OperationKind::Read => self.read_attempts,
            OperationKind::Write => self.write_attempts,
            OperationKind::Execute => self.execute_attempts,
        };
        BackoffPolicy::new(max_attempts, self.base_delay, self.step)
    }
}

/// Mutation confirmation polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSettings {
    /// Used when a tool call does not name its own timeout.
    pub default_timeout: Duration,
    pub idle_interval: Duration,
    pub idle_timeout: Duration,
    pub output_interval: Duration,
    pub output_timeout: Duration,
    /// How often a running cell's output count is logged.
    pub progress_interval: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            idle_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            output_interval: Duration::from_millis(100),
            output_timeout: Duration::from_secs(2),
            progress_interval: Duration::from_secs(2),
        }
    }
}

/// Everything the relay needs to run.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub runtime: RuntimeEndpoint,
    pub document: DocumentEndpoint,
    pub port: u16,
    /// Persistence for the embedded room host.
    pub docs_dir: PathBuf,
    pub retry: RetrySettings,
    pub poll: PollSettings,
    pub execution: ExecutionSettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeEndpoint::default(),
            document: DocumentEndpoint::default(),
            port: DEFAULT_PORT,
            docs_dir: crate::default_docs_dir(),
            retry: RetrySettings::default(),
            poll: PollSettings::default(),
            execution: ExecutionSettings::default(),
        }
    }
}
