//! 本机进程运行时：tty 容器走 PTY，非 tty 容器走管道。

use super::*;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task;
use tracing::{debug, info, warn};

/// PTY 初始尺寸，attach 后由 resize 事件修正
const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;
const READ_BUF_SIZE: usize = 4096;

/// 基于本机进程的运行时。
#[derive(Debug, Clone, Default)]
pub struct NativeRuntime;

impl NativeRuntime {
    pub fn new() -> Self {
        Self
    }
}

/// 本机进程任务句柄。
struct ProcessTask {
    pid: u32,
    container: Weak<Container>,
    /// 非 tty 进程没有 PTY
    pty: Option<StdMutex<Box<dyn MasterPty + Send>>>,
    exited: Arc<AtomicBool>,
}

impl Task for ProcessTask {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn close_input(&self) -> Result<()> {
        let container = self
            .container
            .upgrade()
            .ok_or_else(|| ContainerError::TaskUnavailable(self.pid.to_string()))?;
        container.io().close_stdin();
        Ok(())
    }

    fn resize(&self, size: TerminalSize) -> Result<()> {
        let Some(pty) = self.pty.as_ref() else {
            return Err(ContainerError::Other("task has no terminal".into()));
        };
        pty.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows: size.height,
                cols: size.width,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ContainerError::Other(format!("pty resize failed: {e}")))
    }

    fn is_available(&self) -> bool {
        !self.exited.load(Ordering::Acquire)
    }
}

impl TaskRuntime for NativeRuntime {
    fn spawn(&self, container: &Arc<Container>) -> Result<Arc<dyn Task>> {
        let task = if container.io().tty() {
            spawn_pty_process(container)?
        } else {
            spawn_piped_process(container)?
        };
        info!(container_id = %container.id(), pid = task.pid, "container task spawned");
        Ok(task)
    }
}

/// 使用 PTY 创建子进程
fn spawn_pty_process(container: &Arc<Container>) -> Result<Arc<ProcessTask>> {
    let spec = container.spec();
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| ContainerError::Other(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&spec.command);
    cmd.args(&spec.args);
    if let Some(cwd) = spec.cwd.as_ref() {
        cmd.cwd(cwd);
    }
    for (k, v) in spec.env.iter() {
        cmd.env(k, v);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ContainerError::Other(e.to_string()))?;
    let pid = child
        .process_id()
        .ok_or_else(|| ContainerError::Other("missing pid".into()))?;

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ContainerError::Other(e.to_string()))?;
    if let Some(out_tx) = container.io().stdout_sender() {
        spawn_pty_output_pump(reader, out_tx);
    }
    // 没有 stdin 时不取 writer：丢弃 writer 会向终端发送 EOF
    if let Some(in_rx) = container.io().take_stdin() {
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ContainerError::Other(e.to_string()))?;
        spawn_pty_input_pump(writer, in_rx);
    }

    let exited = Arc::new(AtomicBool::new(false));
    let container_ref = container.clone();
    let exited_flag = exited.clone();
    task::spawn(async move {
        let status = task::spawn_blocking(move || child.wait()).await;
        let code = match status {
            Ok(Ok(status)) => status.exit_code() as i32,
            Ok(Err(e)) => {
                warn!(container_id = %container_ref.id(), error = %e, "failed to wait for task");
                -1
            }
            Err(e) => {
                warn!(container_id = %container_ref.id(), error = %e, "task wait handler panicked");
                -1
            }
        };
        exited_flag.store(true, Ordering::Release);
        info!(container_id = %container_ref.id(), exit_code = code, "container task exited");
        container_ref.mark_exited(code);
    });

    Ok(Arc::new(ProcessTask {
        pid,
        container: Arc::downgrade(container),
        pty: Some(StdMutex::new(pair.master)),
        exited,
    }))
}

/// 使用管道创建子进程
fn spawn_piped_process(container: &Arc<Container>) -> Result<Arc<ProcessTask>> {
    let spec = container.spec();
    let mut cmd = tokio::process::Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(spec.env.iter())
        .stdin(if spec.stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = spec.cwd.as_ref() {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| ContainerError::Other("missing pid".into()))?;

    if let (Some(stdout), Some(tx)) = (child.stdout.take(), container.io().stdout_sender()) {
        spawn_output_pump(stdout, tx);
    }
    if let (Some(stderr), Some(tx)) = (child.stderr.take(), container.io().stderr_sender()) {
        spawn_output_pump(stderr, tx);
    }
    if let (Some(mut stdin), Some(mut rx)) = (child.stdin.take(), container.io().take_stdin()) {
        task::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if stdin.write_all(&buf).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
            // 丢弃 stdin 即向进程发送 EOF
            debug!("piped stdin pump finished");
        });
    }

    let exited = Arc::new(AtomicBool::new(false));
    let container_ref = container.clone();
    let exited_flag = exited.clone();
    task::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(container_id = %container_ref.id(), error = %e, "failed to wait for task");
                -1
            }
        };
        exited_flag.store(true, Ordering::Release);
        info!(container_id = %container_ref.id(), exit_code = code, "container task exited");
        container_ref.mark_exited(code);
    });

    Ok(Arc::new(ProcessTask {
        pid,
        container: Arc::downgrade(container),
        pty: None,
        exited,
    }))
}

/// PTY 输出：阻塞读取并广播给 attach
fn spawn_pty_output_pump(mut reader: Box<dyn Read + Send>, out_tx: broadcast::Sender<Vec<u8>>) {
    task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                // 没有订阅者时 send 失败，直接丢弃
                Ok(n) => {
                    let _ = out_tx.send(buf[..n].to_vec());
                }
            }
        }
    });
}

/// PTY 输入：接收 attach 写入；通道关闭后丢弃 writer
fn spawn_pty_input_pump(mut writer: Box<dyn Write + Send>, mut in_rx: mpsc::Receiver<Vec<u8>>) {
    task::spawn_blocking(move || {
        while let Some(buf) = in_rx.blocking_recv() {
            if writer.write_all(&buf).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });
}

fn spawn_output_pump<R>(mut reader: R, out_tx: broadcast::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    task::spawn(async move {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = out_tx.send(buf[..n].to_vec());
                }
            }
        }
    });
}
