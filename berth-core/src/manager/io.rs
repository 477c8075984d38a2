//! 容器 IO 复用器：把调用方的 stdin/stdout/stderr 绑定到任务的标准流。
//!
//! stdin 通过 mpsc 通道缓冲，任务启动后由运行时取走接收端；
//! stdout/stderr 通过 broadcast 扇出给所有存活的 attach 绑定。

use super::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use scopeguard::ScopeGuard;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// stdin 通道容量（以块计）
const STDIN_CAPACITY: usize = 64;
/// 输出广播容量，慢速客户端超出后会丢块
const OUTPUT_CAPACITY: usize = 256;
const COPY_BUF_SIZE: usize = 32 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 关闭任务 stdin 的回调，由 IO 层在绑定结束时调用。
pub type StdinCloser = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// 调用方提供的三条流，任意一条都可以缺省。
#[derive(Default)]
pub struct AttachStreams {
    pub stdin: Option<BoxedReader>,
    pub stdout: Option<BoxedWriter>,
    pub stderr: Option<BoxedWriter>,
}

impl std::fmt::Debug for AttachStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachStreams")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// 一次 IO 绑定的描述。
pub struct AttachOptions {
    pub streams: AttachStreams,
    pub tty: bool,
    pub stdin_once: bool,
    pub close_stdin: StdinCloser,
}

/// 容器级 IO 复用器。
#[derive(Debug)]
pub struct ContainerIo {
    id: String,
    tty: bool,
    /// 绑定按块重新取发送端，不长期持有，保证 close_stdin 能真正关闭通道
    stdin: Arc<StdMutex<Option<mpsc::Sender<Vec<u8>>>>>,
    stdin_rx: StdMutex<Option<mpsc::Receiver<Vec<u8>>>>,
    stdout: StdMutex<Option<broadcast::Sender<Vec<u8>>>>,
    stderr: StdMutex<Option<broadcast::Sender<Vec<u8>>>>,
    /// stdin_once 模式下是否已有存活绑定
    attached: Arc<AtomicBool>,
}

impl ContainerIo {
    pub fn new(id: &str, tty: bool, stdin: bool) -> Self {
        let (stdin_tx, stdin_rx) = if stdin {
            let (tx, rx) = mpsc::channel(STDIN_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (stdout, _) = broadcast::channel(OUTPUT_CAPACITY);
        // tty 模式下 stderr 已合并进 stdout
        let stderr = (!tty).then(|| broadcast::channel(OUTPUT_CAPACITY).0);
        Self {
            id: id.to_string(),
            tty,
            stdin: Arc::new(StdMutex::new(stdin_tx)),
            stdin_rx: StdMutex::new(stdin_rx),
            stdout: StdMutex::new(Some(stdout)),
            stderr: StdMutex::new(stderr),
            attached: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tty(&self) -> bool {
        self.tty
    }

    /// 运行时取走 stdin 接收端；只能取一次。
    pub fn take_stdin(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.stdin_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn stdout_sender(&self) -> Option<broadcast::Sender<Vec<u8>>> {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stderr_sender(&self) -> Option<broadcast::Sender<Vec<u8>>> {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 丢弃 stdin 发送端；缓冲数据写完后任务会读到 EOF。
    pub fn close_stdin(&self) {
        if self
            .stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!(container_id = %self.id, "container stdin closed");
        }
    }

    /// 丢弃输出发送端；运行时的泵结束后订阅者会收到 Closed。
    pub fn close_output(&self) {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// 登记一次绑定：占用 stdin_once 名额并立即订阅输出。
    ///
    /// 订阅发生在任务启动之前，隐式启动期间产生的输出不会丢失。
    pub fn bind(&self, opts: AttachOptions) -> Result<IoBinding> {
        let AttachOptions {
            streams,
            tty,
            stdin_once,
            close_stdin,
        } = opts;

        let claim = if stdin_once {
            if self.attached.swap(true, Ordering::AcqRel) {
                return Err(ContainerError::AttachBusy(self.id.clone()));
            }
            Some(scopeguard::guard(self.attached.clone(), release_claim as fn(_)))
        } else {
            None
        };

        let AttachStreams {
            stdin,
            stdout,
            stderr,
        } = streams;
        // tty 下没有独立的 stderr
        let stderr = if tty { None } else { stderr };
        let out_rx = stdout.as_ref().and_then(|_| subscribe(&self.stdout));
        let err_rx = stderr.as_ref().and_then(|_| subscribe(&self.stderr));

        Ok(IoBinding {
            id: self.id.clone(),
            stdin_tx: self.stdin.clone(),
            caller_stdin: stdin.is_some(),
            stdin,
            stdout,
            stderr,
            out_rx,
            err_rx,
            stdin_once,
            close_stdin,
            _claim: claim,
        })
    }
}

fn release_claim(attached: Arc<AtomicBool>) {
    attached.store(false, Ordering::Release);
}

fn subscribe(
    slot: &StdMutex<Option<broadcast::Sender<Vec<u8>>>>,
) -> Option<broadcast::Receiver<Vec<u8>>> {
    slot.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|tx| tx.subscribe())
}

/// 已登记的绑定，由 [`IoBinding::run`] 驱动复制。
pub struct IoBinding {
    id: String,
    stdin_tx: Arc<StdMutex<Option<mpsc::Sender<Vec<u8>>>>>,
    caller_stdin: bool,
    stdin: Option<BoxedReader>,
    stdout: Option<BoxedWriter>,
    stderr: Option<BoxedWriter>,
    out_rx: Option<broadcast::Receiver<Vec<u8>>>,
    err_rx: Option<broadcast::Receiver<Vec<u8>>>,
    stdin_once: bool,
    close_stdin: StdinCloser,
    /// drop 时释放 stdin_once 名额
    _claim: Option<ScopeGuard<Arc<AtomicBool>, fn(Arc<AtomicBool>)>>,
}

impl std::fmt::Debug for IoBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBinding")
            .field("id", &self.id)
            .field("stdin_once", &self.stdin_once)
            .finish_non_exhaustive()
    }
}

impl IoBinding {
    /// 持续复制直到会话结束。
    ///
    /// 结束条件：
    /// - 调用方 stdin 到达 EOF 或读取失败
    /// - 没有调用方 stdin，且任务输出全部关闭或调用方输出端全部断开
    ///
    /// 调用方提供了 stdin 且 stdin_once 时，无论从哪条路径结束都恰好关闭一次任务 stdin。
    pub async fn run(mut self) -> Result<()> {
        let copied = self.copy().await;
        if self.stdin_once && self.caller_stdin {
            let closed = (self.close_stdin)();
            if let (Err(e), Err(close_err)) = (&copied, &closed) {
                warn!(
                    container_id = %self.id,
                    error = %e,
                    close_error = %close_err,
                    "failed to close container stdin"
                );
            }
            return copied.and(closed);
        }
        copied
    }

    async fn copy(&mut self) -> Result<()> {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            tokio::select! {
                read = read_some(&mut self.stdin, &mut buf), if self.stdin.is_some() => {
                    match read {
                        Ok(0) => {
                            debug!(container_id = %self.id, "attach stdin reached eof");
                            return Ok(());
                        }
                        Ok(n) => self.forward_stdin(buf[..n].to_vec()).await,
                        Err(e) if is_disconnect(&e) => {
                            debug!(container_id = %self.id, error = %e, "attach stdin disconnected");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                chunk = recv_chunk(&mut self.out_rx), if self.out_rx.is_some() => {
                    match chunk {
                        Ok(bytes) => {
                            if !write_chunk(&mut self.stdout, &bytes).await? {
                                // 调用方 stdout 断开：停止转发，会话继续
                                debug!(container_id = %self.id, "attach stdout disconnected");
                                self.stdout = None;
                                self.out_rx = None;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(container_id = %self.id, dropped = n, "attach stdout lagged");
                        }
                        Err(RecvError::Closed) => self.out_rx = None,
                    }
                }
                chunk = recv_chunk(&mut self.err_rx), if self.err_rx.is_some() => {
                    match chunk {
                        Ok(bytes) => {
                            if !write_chunk(&mut self.stderr, &bytes).await? {
                                debug!(container_id = %self.id, "attach stderr disconnected");
                                self.stderr = None;
                                self.err_rx = None;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(container_id = %self.id, dropped = n, "attach stderr lagged");
                        }
                        Err(RecvError::Closed) => self.err_rx = None,
                    }
                }
                else => {
                    debug!(container_id = %self.id, "container output closed");
                    return Ok(());
                }
            }
        }
    }

    async fn forward_stdin(&mut self, data: Vec<u8>) {
        let tx = self
            .stdin_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(tx) = tx else {
            return;
        };
        if tx.send(data).await.is_err() {
            debug!(container_id = %self.id, "container stdin no longer accepts input");
        }
    }
}

async fn read_some(reader: &mut Option<BoxedReader>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn recv_chunk(
    rx: &mut Option<broadcast::Receiver<Vec<u8>>>,
) -> std::result::Result<Vec<u8>, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// 写出一块数据；调用方断开返回 Ok(false)。
async fn write_chunk(writer: &mut Option<BoxedWriter>, bytes: &[u8]) -> Result<bool> {
    let Some(w) = writer.as_mut() else {
        return Ok(true);
    };
    let written = match w.write_all(bytes).await {
        Ok(()) => w.flush().await,
        Err(e) => Err(e),
    };
    match written {
        Ok(()) => Ok(true),
        Err(e) if is_disconnect(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
    )
}
