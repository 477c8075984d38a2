use crate::error::{ContainerError, Result};
use crate::models::{
    ContainerInfo, ContainerSpec, ContainerState, ContainerStatus, ContainerSummary,
    TerminalSize,
};
use crate::streaming::{AttachRequest, AttachResponse, StreamTokens};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use url::Url;

mod attach;
mod gate;
mod io;
mod lifecycle;
mod resize;
mod runtime;
mod store;
mod task;

pub use gate::{check_attachable, AttachAdmission};
pub use io::{AttachOptions, AttachStreams, ContainerIo, IoBinding, StdinCloser};
pub use resize::relay_resizes;
pub use runtime::NativeRuntime;
pub use store::{Container, ContainerStore};
pub use task::{Task, TaskRuntime};

/// 管理器配置。
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// 流式端点根地址，预检查返回 `<base>/attach/<token>`
    pub stream_base_url: Url,
    /// 令牌有效期
    pub stream_token_ttl: Duration,
    /// 隐式启动后解析任务的重试次数
    pub task_resolve_attempts: u32,
    pub task_resolve_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stream_base_url: Url::parse("http://127.0.0.1:8080/stream/")
                .expect("valid default stream url"),
            stream_token_ttl: Duration::from_secs(60),
            task_resolve_attempts: 10,
            task_resolve_interval: Duration::from_millis(50),
        }
    }
}

/// 容器管理器：维护容器索引、驱动任务生命周期，并暴露 attach 能力。
#[derive(Clone)]
pub struct ContainerManager {
    store: ContainerStore,
    runtime: Arc<dyn TaskRuntime>,
    streams: StreamTokens,
    config: ManagerConfig,
}

impl std::fmt::Debug for ContainerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerManager")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContainerManager {
    /// 使用本机进程运行时。
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_runtime(Arc::new(NativeRuntime::new()), config)
    }

    pub fn with_runtime(runtime: Arc<dyn TaskRuntime>, config: ManagerConfig) -> Self {
        let streams = StreamTokens::new(config.stream_base_url.clone(), config.stream_token_ttl);
        Self {
            store: ContainerStore::new(),
            runtime,
            streams,
            config,
        }
    }

    pub fn store(&self) -> &ContainerStore {
        &self.store
    }

    pub fn streams(&self) -> &StreamTokens {
        &self.streams
    }

    /// 校验名称，仅允许字母数字/`-`/`_`/`.`
    fn validate_name(&self, name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(ContainerError::InvalidId)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// 记录调用的假任务。
    #[derive(Default)]
    struct FakeTask {
        closes: AtomicUsize,
        resizes: StdMutex<Vec<TerminalSize>>,
        /// 第 n 次 resize（从 1 开始）返回错误
        fail_resize_call: Option<usize>,
        unavailable: AtomicBool,
    }

    impl Task for FakeTask {
        fn pid(&self) -> u32 {
            4242
        }

        fn close_input(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn resize(&self, size: TerminalSize) -> Result<()> {
            let mut resizes = self.resizes.lock().unwrap();
            resizes.push(size);
            if Some(resizes.len()) == self.fail_resize_call {
                return Err(ContainerError::Other("resize rejected".into()));
            }
            Ok(())
        }

        fn is_available(&self) -> bool {
            !self.unavailable.load(Ordering::SeqCst)
        }
    }

    /// 不创建真实进程的运行时：取走 stdin 接收端以便断言。
    #[derive(Default)]
    struct FakeRuntime {
        spawns: AtomicUsize,
        fail: bool,
        /// 启动时立即写出并关闭输出
        greeting: Option<Vec<u8>>,
        task: Arc<FakeTask>,
        stdin: StdMutex<Option<mpsc::Receiver<Vec<u8>>>>,
    }

    impl TaskRuntime for FakeRuntime {
        fn spawn(&self, container: &Arc<Container>) -> Result<Arc<dyn Task>> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ContainerError::Other("exec format error".into()));
            }
            *self.stdin.lock().unwrap() = container.io().take_stdin();
            if let Some(greeting) = self.greeting.as_ref() {
                if let Some(tx) = container.io().stdout_sender() {
                    let _ = tx.send(greeting.clone());
                }
                container.io().close_output();
            }
            Ok(self.task.clone())
        }
    }

    impl FakeRuntime {
        fn spawns(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }

        fn stdin_bytes(&self) -> Vec<u8> {
            let mut out = Vec::new();
            if let Some(rx) = self.stdin.lock().unwrap().as_mut() {
                while let Ok(chunk) = rx.try_recv() {
                    out.extend(chunk);
                }
            }
            out
        }
    }

    fn setup(runtime: FakeRuntime) -> (ContainerManager, Arc<FakeRuntime>) {
        setup_with_config(runtime, ManagerConfig::default())
    }

    fn setup_with_config(
        runtime: FakeRuntime,
        config: ManagerConfig,
    ) -> (ContainerManager, Arc<FakeRuntime>) {
        let runtime = Arc::new(runtime);
        let manager = ContainerManager::with_runtime(runtime.clone(), config);
        (manager, runtime)
    }

    fn spec(name: &str, tty: bool, stdin_once: bool) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            command: "sh".into(), // not spawned by the fake runtime
            tty,
            stdin: true,
            stdin_once,
            ..Default::default()
        }
    }

    fn stdin_streams(stdin: tokio::io::DuplexStream) -> AttachStreams {
        AttachStreams {
            stdin: Some(Box::new(stdin)),
            ..Default::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn attach_created_container_starts_once_and_copies_stdin() {
        let (manager, runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", true, false)).unwrap();

        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"echo hi\n").await.unwrap();
        drop(client);

        manager
            .attach(&info.id, stdin_streams(server), true, None)
            .await
            .unwrap();

        assert_eq!(runtime.spawns(), 1);
        assert_eq!(runtime.stdin_bytes(), b"echo hi\n");
        assert_eq!(manager.container(&info.id).unwrap().status.state, ContainerState::Running);
        assert_eq!(runtime.task.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn attach_running_container_does_not_start() {
        let (manager, runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", true, false)).unwrap();
        manager.start_container(&info.id).await.unwrap();

        let (client, server) = tokio::io::duplex(64);
        drop(client);
        manager
            .attach(&info.id, stdin_streams(server), true, None)
            .await
            .unwrap();
        assert_eq!(runtime.spawns(), 1);
    }

    #[tokio::test]
    async fn attach_exited_container_is_rejected() {
        let (manager, runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c2", false, false)).unwrap();
        manager.store().get(&info.id).unwrap().mark_exited(0);

        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"ignored").await.unwrap();
        let err = manager
            .attach(&info.id, stdin_streams(server), false, None)
            .await
            .unwrap_err();

        assert!(matches!(err, ContainerError::InvalidState(ContainerState::Exited)));
        assert_eq!(err.to_string(), "container is in EXITED state");
        assert_eq!(runtime.spawns(), 0);
        // 没有发生 IO 绑定：stdin 通道里什么也没有
        let container = manager.store().get(&info.id).unwrap();
        let mut rx = container.io().take_stdin().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn attach_unknown_container_is_not_found() {
        let (manager, _) = setup(FakeRuntime::default());
        let err = manager
            .attach("missing", AttachStreams::default(), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::NotFound(_)));
    }

    #[tokio::test]
    async fn attach_accepts_id_prefix() {
        let (manager, runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", true, false)).unwrap();
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        manager
            .attach(&info.id[..12], stdin_streams(server), true, None)
            .await
            .unwrap();
        assert_eq!(runtime.spawns(), 1);
    }

    #[tokio::test]
    async fn stdin_once_closes_task_input_exactly_once() {
        let (manager, runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", false, true)).unwrap();
        manager.start_container(&info.id).await.unwrap();

        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"data").await.unwrap();
        drop(client);
        manager
            .attach(&info.id, stdin_streams(server), false, None)
            .await
            .unwrap();

        assert_eq!(runtime.task.closes.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.stdin_bytes(), b"data");
    }

    #[tokio::test]
    async fn stdin_once_without_task_reports_unavailable() {
        let (manager, runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", false, true)).unwrap();
        manager.start_container(&info.id).await.unwrap();
        runtime.task.unavailable.store(true, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let err = manager
            .attach(&info.id, stdin_streams(server), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::TaskUnavailable(_)));
        assert_eq!(runtime.task.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stdin_once_allows_single_live_binding() {
        let (manager, _runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", false, true)).unwrap();
        manager.start_container(&info.id).await.unwrap();

        let (first_client, first_server) = tokio::io::duplex(64);
        let first = {
            let manager = manager.clone();
            let id = info.id.clone();
            tokio::spawn(async move {
                manager
                    .attach(&id, stdin_streams(first_server), false, None)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (second_client, second_server) = tokio::io::duplex(64);
        drop(second_client);
        let err = manager
            .attach(&info.id, stdin_streams(second_server), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::AttachBusy(_)));

        drop(first_client);
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stdin_once_survives_stdout_disconnect() {
        let (manager, runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", false, true)).unwrap();
        manager.start_container(&info.id).await.unwrap();
        let container = manager.store().get(&info.id).unwrap();

        let (mut stdin_client, stdin_server) = tokio::io::duplex(64);
        let (stdout_server, stdout_client) = tokio::io::duplex(64);
        let streams = AttachStreams {
            stdin: Some(Box::new(stdin_server)),
            stdout: Some(Box::new(stdout_server)),
            stderr: None,
        };
        let session = {
            let manager = manager.clone();
            let id = info.id.clone();
            tokio::spawn(async move { manager.attach(&id, streams, false, None).await })
        };

        let stdout_tx = container.io().stdout_sender().unwrap();
        wait_until(|| stdout_tx.receiver_count() > 0).await;
        drop(stdout_client);
        stdout_tx.send(b"lost".to_vec()).unwrap();
        // 写入失败后绑定放弃 stdout，但仍在读 stdin
        wait_until(|| stdout_tx.receiver_count() == 0).await;
        assert!(!session.is_finished());
        assert_eq!(runtime.task.closes.load(Ordering::SeqCst), 0);

        let (other_client, other_server) = tokio::io::duplex(64);
        drop(other_client);
        let err = manager
            .attach(&info.id, stdin_streams(other_server), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::AttachBusy(_)));

        stdin_client.write_all(b"more").await.unwrap();
        drop(stdin_client);
        session.await.unwrap().unwrap();
        assert_eq!(runtime.task.closes.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.stdin_bytes(), b"more");
    }

    #[tokio::test]
    async fn output_during_implicit_start_reaches_caller() {
        let (manager, runtime) = setup(FakeRuntime {
            greeting: Some(b"hello".to_vec()),
            ..Default::default()
        });
        let info = manager.create_container(spec("c1", true, false)).unwrap();

        let (stdout_server, mut stdout_client) = tokio::io::duplex(1024);
        let streams = AttachStreams {
            stdout: Some(Box::new(stdout_server)),
            ..Default::default()
        };
        manager.attach(&info.id, streams, true, None).await.unwrap();

        assert_eq!(runtime.spawns(), 1);
        let mut out = Vec::new();
        stdout_client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn resize_before_task_is_resolvable_is_dropped() {
        let config = ManagerConfig {
            task_resolve_attempts: 2,
            task_resolve_interval: std::time::Duration::from_millis(1),
            ..Default::default()
        };
        let (manager, runtime) = setup_with_config(FakeRuntime::default(), config);
        let info = manager.create_container(spec("c1", true, false)).unwrap();
        manager.start_container(&info.id).await.unwrap();
        runtime.task.unavailable.store(true, Ordering::SeqCst);

        let (resize_tx, resize_rx) = mpsc::channel(8);
        resize_tx.send(TerminalSize::new(80, 24)).await.unwrap();
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        manager
            .attach(&info.id, stdin_streams(server), true, Some(resize_rx))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(runtime.task.resizes.lock().unwrap().is_empty());

        // 之后的事件逐个重新解析任务
        runtime.task.unavailable.store(false, Ordering::SeqCst);
        resize_tx.send(TerminalSize::new(120, 40)).await.unwrap();
        let task = runtime.task.clone();
        wait_until(move || !task.resizes.lock().unwrap().is_empty()).await;
        assert_eq!(
            *runtime.task.resizes.lock().unwrap(),
            vec![TerminalSize::new(120, 40)]
        );
    }

    #[tokio::test]
    async fn attach_copies_task_output_until_closed() {
        let (manager, _runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", false, false)).unwrap();
        manager.start_container(&info.id).await.unwrap();
        let container = manager.store().get(&info.id).unwrap();

        let (stdout_server, mut stdout_client) = tokio::io::duplex(1024);
        let (stderr_server, mut stderr_client) = tokio::io::duplex(1024);
        let streams = AttachStreams {
            stdin: None,
            stdout: Some(Box::new(stdout_server)),
            stderr: Some(Box::new(stderr_server)),
        };
        let session = {
            let manager = manager.clone();
            let id = info.id.clone();
            tokio::spawn(async move { manager.attach(&id, streams, false, None).await })
        };

        let stdout_tx = container.io().stdout_sender().unwrap();
        let stderr_tx = container.io().stderr_sender().unwrap();
        wait_until(|| stdout_tx.receiver_count() > 0 && stderr_tx.receiver_count() > 0).await;
        stdout_tx.send(b"out".to_vec()).unwrap();
        stderr_tx.send(b"err".to_vec()).unwrap();
        drop(stdout_tx);
        drop(stderr_tx);
        container.mark_exited(0);

        session.await.unwrap().unwrap();
        let mut out = Vec::new();
        stdout_client.read_to_end(&mut out).await.unwrap();
        let mut err = Vec::new();
        stderr_client.read_to_end(&mut err).await.unwrap();
        assert_eq!(out, b"out");
        assert_eq!(err, b"err");
    }

    #[tokio::test]
    async fn resize_failures_do_not_end_session() {
        let (manager, runtime) = setup(FakeRuntime {
            task: Arc::new(FakeTask {
                fail_resize_call: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        });
        let info = manager.create_container(spec("c1", true, false)).unwrap();

        let (resize_tx, resize_rx) = mpsc::channel(8);
        for size in [
            TerminalSize::new(80, 24),
            TerminalSize::new(100, 30),
            TerminalSize::new(100, 30),
        ] {
            resize_tx.send(size).await.unwrap();
        }
        drop(resize_tx);

        let (client, server) = tokio::io::duplex(64);
        drop(client);
        manager
            .attach(&info.id, stdin_streams(server), true, Some(resize_rx))
            .await
            .unwrap();

        let task = runtime.task.clone();
        wait_until(move || task.resizes.lock().unwrap().len() == 3).await;
        let resizes = runtime.task.resizes.lock().unwrap().clone();
        assert_eq!(
            resizes,
            vec![
                TerminalSize::new(80, 24),
                TerminalSize::new(100, 30),
                TerminalSize::new(100, 30),
            ]
        );
        assert_eq!(resizes.last(), Some(&TerminalSize::new(100, 30)));
    }

    #[tokio::test]
    async fn open_resize_source_does_not_delay_session() {
        let (manager, _runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", true, false)).unwrap();
        manager.start_container(&info.id).await.unwrap();

        let (resize_tx, resize_rx) = mpsc::channel(8);
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            manager.attach(&info.id, stdin_streams(server), true, Some(resize_rx)),
        )
        .await
        .expect("attach should return while the resize source is still open")
        .unwrap();
        drop(resize_tx);
    }

    #[tokio::test]
    async fn failed_implicit_start_is_fatal() {
        let (manager, runtime) = setup(FakeRuntime {
            fail: true,
            ..Default::default()
        });
        let info = manager.create_container(spec("c1", true, false)).unwrap();
        let (_client, server) = tokio::io::duplex(64);

        let err = manager
            .attach(&info.id, stdin_streams(server), true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::StartFailed { .. }));
        assert_eq!(runtime.spawns(), 1);

        let status = manager.container(&info.id).unwrap().status;
        assert_eq!(status.state, ContainerState::Exited);
        assert_eq!(status.exit_code, Some(128));
        assert_eq!(status.reason.as_deref(), Some("StartError"));
    }

    #[tokio::test]
    async fn start_requires_created_state() {
        let (manager, runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", true, false)).unwrap();
        manager.start_container(&info.id).await.unwrap();
        let err = manager.start_container(&info.id).await.unwrap_err();
        assert!(matches!(err, ContainerError::InvalidState(ContainerState::Running)));
        assert_eq!(runtime.spawns(), 1);
    }

    #[tokio::test]
    async fn can_attach_issues_stream_url() {
        let (manager, runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c1", true, false)).unwrap();

        let response = manager
            .can_attach(AttachRequest {
                container_id: info.id[..8].to_string(),
                stdin: true,
                stdout: true,
                stderr: false,
                tty: true,
            })
            .unwrap();
        assert!(response.url.contains("/stream/attach/"));
        // 预检查不会启动容器
        assert_eq!(runtime.spawns(), 0);

        let token = response.url.rsplit('/').next().unwrap();
        let request = manager.streams().consume(token).unwrap();
        assert_eq!(request.container_id, info.id);
    }

    #[tokio::test]
    async fn can_attach_rejects_exited_and_missing() {
        let (manager, _runtime) = setup(FakeRuntime::default());
        let info = manager.create_container(spec("c2", false, false)).unwrap();
        manager.store().get(&info.id).unwrap().mark_exited(1);

        let request = |id: &str| AttachRequest {
            container_id: id.to_string(),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
        };
        assert!(matches!(
            manager.can_attach(request(&info.id)),
            Err(ContainerError::InvalidState(ContainerState::Exited))
        ));
        assert!(matches!(
            manager.can_attach(request("nope")),
            Err(ContainerError::NotFound(_))
        ));
    }

    #[test]
    fn store_prefix_lookup() {
        let store = ContainerStore::new();
        store.add(Container::new("abc123", spec("a", false, false))).unwrap();
        store.add(Container::new("abd456", spec("b", false, false))).unwrap();

        assert_eq!(store.get("abc").unwrap().id(), "abc123");
        assert!(matches!(store.get("ab"), Err(ContainerError::Ambiguous(_))));
        assert!(matches!(store.get("zz"), Err(ContainerError::NotFound(_))));
        assert!(matches!(store.get(""), Err(ContainerError::InvalidId)));
        assert!(matches!(
            store.add(Container::new("abc123", spec("c", false, false))),
            Err(ContainerError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn create_validates_name_and_remove_rejects_running() {
        let (manager, _runtime) = setup(FakeRuntime::default());
        let err = manager.create_container(spec("bad name", false, false)).unwrap_err();
        assert!(matches!(err, ContainerError::InvalidId));

        let info = manager.create_container(spec("c1", false, false)).unwrap();
        manager.start_container(&info.id).await.unwrap();
        assert!(matches!(
            manager.remove_container(&info.id),
            Err(ContainerError::InvalidState(ContainerState::Running))
        ));
        manager.store().get(&info.id).unwrap().mark_exited(0);
        manager.remove_container(&info.id).unwrap();
        assert!(manager.list_containers().is_empty());
    }
}
