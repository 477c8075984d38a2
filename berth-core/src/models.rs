use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 容器生命周期状态。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    /// 无法识别的状态一律归入 Unknown
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// 按 CRI 的数值编码解析状态；未知编码视为 Unknown。
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ContainerState::Created,
            1 => ContainerState::Running,
            2 => ContainerState::Exited,
            _ => ContainerState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "CREATED",
            ContainerState::Running => "RUNNING",
            ContainerState::Exited => "EXITED",
            ContainerState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 终端尺寸（列 x 行）。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

impl TerminalSize {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

/// 创建容器时提交的配置。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// 显示名称，仅允许字母数字与 `-` `_` `.`
    pub name: String,
    /// 容器内主进程命令
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// 是否分配伪终端
    #[serde(default)]
    pub tty: bool,
    /// 是否保留 stdin
    #[serde(default)]
    pub stdin: bool,
    /// 第一个 attach 会话结束后关闭 stdin
    #[serde(default)]
    pub stdin_once: bool,
}

/// 容器状态快照。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ContainerStatus {
    pub fn created() -> Self {
        Self {
            state: ContainerState::Created,
            pid: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            reason: None,
            message: None,
        }
    }
}

/// Minimal listing info for a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
}

/// Detailed view of a container: spec plus current status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub spec: ContainerSpec,
    pub status: ContainerStatus,
}
