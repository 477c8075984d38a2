//! 容器生命周期：创建、启动、查询、删除。

use super::*;
use tracing::{info, instrument, warn};
use uuid::Uuid;

impl ContainerManager {
    /// 创建容器记录（不启动进程）。
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub fn create_container(&self, spec: ContainerSpec) -> Result<ContainerInfo> {
        self.validate_name(&spec.name)?;
        if spec.command.trim().is_empty() {
            return Err(ContainerError::InvalidRequest("command is required".into()));
        }
        let id = Uuid::new_v4().simple().to_string();
        let container = self.store.add(Container::new(id, spec))?;
        info!(container_id = %container.id(), "container created");
        Ok(container.info())
    }

    /// 启动容器：仅允许 CREATED 状态，通过运行时创建任务。
    #[instrument(skip(self))]
    pub async fn start_container(&self, id: &str) -> Result<ContainerStatus> {
        let container = self.store.get(id)?;
        container.begin_start()?;
        match self.runtime.spawn(&container) {
            Ok(task) => {
                container.mark_running(task);
                info!(container_id = %container.id(), "container started");
                Ok(container.status())
            }
            Err(e) => {
                warn!(container_id = %container.id(), error = %e, "failed to start container");
                container.mark_start_failed(e.to_string());
                Err(ContainerError::StartFailed {
                    id: container.id().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn container(&self, id: &str) -> Result<ContainerInfo> {
        Ok(self.store.get(id)?.info())
    }

    /// 列出容器，按名称排序。
    pub fn list_containers(&self) -> Vec<ContainerSummary> {
        let mut list: Vec<ContainerSummary> =
            self.store.list().iter().map(|c| c.summary()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// 删除容器记录；运行中的容器不能删除。
    #[instrument(skip(self))]
    pub fn remove_container(&self, id: &str) -> Result<()> {
        let container = self.store.get(id)?;
        let state = container.state();
        if state == ContainerState::Running {
            return Err(ContainerError::InvalidState(state));
        }
        self.store.remove(container.id())?;
        info!(container_id = %container.id(), "container removed");
        Ok(())
    }
}
