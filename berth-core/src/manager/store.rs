//! 容器记录与内存索引：按完整 id 或唯一前缀查找。

use super::*;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// 启动失败时记录的退出码与原因
const START_ERROR_EXIT_CODE: i32 = 128;
const START_ERROR_REASON: &str = "StartError";

/// 单个容器记录：配置、状态快照、迟绑定的任务句柄以及 IO 复用器。
pub struct Container {
    id: String,
    spec: ContainerSpec,
    status: RwLock<ContainerStatus>,
    /// 防止并发 start
    starting: AtomicBool,
    task: RwLock<Option<Arc<dyn Task>>>,
    io: ContainerIo,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("name", &self.spec.name)
            .finish_non_exhaustive()
    }
}

impl Container {
    pub fn new(id: impl Into<String>, spec: ContainerSpec) -> Self {
        let id = id.into();
        let io = ContainerIo::new(&id, spec.tty, spec.stdin);
        Self {
            id,
            spec,
            status: RwLock::new(ContainerStatus::created()),
            starting: AtomicBool::new(false),
            task: RwLock::new(None),
            io,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn io(&self) -> &ContainerIo {
        &self.io
    }

    /// 状态快照（拷贝），调用方拿到后不再随容器变化。
    pub fn status(&self) -> ContainerStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> ContainerState {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            spec: self.spec.clone(),
            status: self.status(),
        }
    }

    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            state: self.state(),
        }
    }

    /// 每次调用都重新读取任务槽；没有存活任务时返回 TaskUnavailable。
    pub fn task(&self) -> Result<Arc<dyn Task>> {
        let guard = self.task.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(task) if task.is_available() => Ok(task.clone()),
            _ => Err(ContainerError::TaskUnavailable(self.id.clone())),
        }
    }

    /// 进程退出：记录退出码，并关闭输出让所有 attach 绑定结束。
    pub fn mark_exited(&self, exit_code: i32) {
        {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            status.state = ContainerState::Exited;
            status.finished_at = Some(Utc::now());
            status.exit_code = Some(exit_code);
            status.reason = Some(if exit_code == 0 { "Completed" } else { "Error" }.to_string());
        }
        self.io.close_output();
    }

    /// 标记启动开始；仅 CREATED 且没有进行中的 start 时成功。
    pub(crate) fn begin_start(&self) -> Result<()> {
        let state = self.state();
        if state != ContainerState::Created {
            return Err(ContainerError::InvalidState(state));
        }
        if self.starting.swap(true, Ordering::AcqRel) {
            return Err(ContainerError::Other(format!(
                "container {} is already starting",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn mark_running(&self, task: Arc<dyn Task>) {
        let pid = task.pid();
        *self.task.write().unwrap_or_else(PoisonError::into_inner) = Some(task);
        {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            // 进程可能在这之前就已退出并被 wait handler 标记
            if status.state == ContainerState::Created {
                status.state = ContainerState::Running;
                status.pid = Some(pid);
                status.started_at = Some(Utc::now());
            }
        }
        self.starting.store(false, Ordering::Release);
    }

    pub(crate) fn mark_start_failed(&self, message: String) {
        {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            status.state = ContainerState::Exited;
            status.finished_at = Some(Utc::now());
            status.exit_code = Some(START_ERROR_EXIT_CODE);
            status.reason = Some(START_ERROR_REASON.to_string());
            status.message = Some(message);
        }
        self.starting.store(false, Ordering::Release);
        self.io.close_output();
    }
}

/// 容器索引。克隆共享同一份底层数据。
#[derive(Debug, Clone, Default)]
pub struct ContainerStore {
    containers: Arc<RwLock<HashMap<String, Arc<Container>>>>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, container: Container) -> Result<Arc<Container>> {
        let mut map = self
            .containers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(container.id()) {
            return Err(ContainerError::AlreadyExists(container.id().to_string()));
        }
        let container = Arc::new(container);
        map.insert(container.id().to_string(), container.clone());
        Ok(container)
    }

    /// 查找容器：先精确匹配，再按唯一前缀匹配。
    pub fn get(&self, id: &str) -> Result<Arc<Container>> {
        if id.is_empty() {
            return Err(ContainerError::InvalidId);
        }
        let map = self
            .containers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(container) = map.get(id) {
            return Ok(container.clone());
        }
        let mut matches = map
            .iter()
            .filter(|(key, _)| key.starts_with(id))
            .map(|(_, c)| c);
        match (matches.next(), matches.next()) {
            (Some(container), None) => Ok(container.clone()),
            (Some(_), Some(_)) => Err(ContainerError::Ambiguous(id.to_string())),
            _ => Err(ContainerError::NotFound(id.to_string())),
        }
    }

    pub fn list(&self) -> Vec<Arc<Container>> {
        self.containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn remove(&self, id: &str) -> Result<Arc<Container>> {
        self.containers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))
    }
}
