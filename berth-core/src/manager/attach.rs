use super::*;
use tracing::{debug, instrument, warn};

impl ContainerManager {
    /// 预检查：确认容器可以 attach，签发流式端点 URL。不分配任何流资源。
    #[instrument(skip(self, request), fields(container_id = %request.container_id))]
    pub fn can_attach(&self, request: AttachRequest) -> Result<AttachResponse> {
        let container = self.store.get(&request.container_id)?;
        check_attachable(container.state())?;
        let request = AttachRequest {
            container_id: container.id().to_string(),
            ..request
        };
        let url = self.streams.issue(request)?;
        Ok(AttachResponse {
            url: url.to_string(),
        })
    }

    /// 把调用方的流绑定到容器任务上，直到会话结束。
    ///
    /// CREATED 容器会先被隐式启动；resize 事件在后台独立转发，不参与会话结果。
    #[instrument(skip(self, streams, resize))]
    pub async fn attach(
        &self,
        id: &str,
        streams: AttachStreams,
        tty: bool,
        resize: Option<mpsc::Receiver<TerminalSize>>,
    ) -> Result<()> {
        let container = self.store.get(id)?;
        // 之后一律使用完整 id
        let id = container.id().to_string();
        let admission = check_attachable(container.state())?;

        // 先登记绑定（订阅输出）再启动，启动期间的输出不会丢失
        let binding = container.io().bind(AttachOptions {
            streams,
            tty,
            stdin_once: container.spec().stdin_once,
            close_stdin: self.stdin_closer(&id),
        })?;
        let binding = tokio::spawn(binding.run());

        if admission == AttachAdmission::StartRequired {
            debug!(container_id = %id, "starting created container for attach");
            if let Err(e) = self.start_container(&id).await {
                binding.abort();
                return Err(match e {
                    e @ ContainerError::StartFailed { .. } => e,
                    other => ContainerError::StartFailed {
                        id,
                        reason: other.to_string(),
                    },
                });
            }
        }

        if let Some(events) = resize {
            self.spawn_resize_relay(container, events).await;
        }

        match binding.await {
            Ok(result) => result,
            Err(e) => Err(ContainerError::Other(format!("attach io task failed: {e}"))),
        }
    }

    /// 关闭 stdin 的回调：调用时才通过 store 重新解析容器与任务。
    fn stdin_closer(&self, id: &str) -> StdinCloser {
        let store = self.store.clone();
        let id = id.to_string();
        Box::new(move || store.get(&id)?.task()?.close_input())
    }

    /// 启动 resize 转发；不保留 JoinHandle，事件源关闭后自行结束。
    async fn spawn_resize_relay(
        &self,
        container: Arc<Container>,
        events: mpsc::Receiver<TerminalSize>,
    ) {
        let resolved = self.resolve_task(&container).await;
        if resolved.is_none() {
            warn!(
                container_id = %container.id(),
                "task not resolvable, resize events will be resolved per event"
            );
        }
        tokio::spawn(async move {
            let id = container.id().to_string();
            relay_resizes(&id, events, |size| {
                let task = match &resolved {
                    Some(task) => task.clone(),
                    None => container.task()?,
                };
                task.resize(size)
            })
            .await;
        });
    }

    /// 隐式启动后任务可能短暂不可见：有限次重试。
    async fn resolve_task(&self, container: &Container) -> Option<Arc<dyn Task>> {
        let attempts = self.config.task_resolve_attempts.max(1);
        for attempt in 1..=attempts {
            match container.task() {
                Ok(task) => return Some(task),
                Err(_) if attempt < attempts => {
                    tokio::time::sleep(self.config.task_resolve_interval).await
                }
                Err(_) => {}
            }
        }
        None
    }
}
