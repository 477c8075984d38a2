//! 任务抽象：容器内存活进程的句柄，以及创建它的运行时。

use super::*;

/// 容器内存活进程的句柄。
///
/// 仅在容器进入 RUNNING 之后存在；进程退出后 `is_available` 返回 false。
pub trait Task: Send + Sync {
    fn pid(&self) -> u32;

    /// 关闭进程的 stdin。
    fn close_input(&self) -> Result<()>;

    /// 调整控制终端尺寸。
    fn resize(&self, size: TerminalSize) -> Result<()>;

    fn is_available(&self) -> bool;
}

/// 进程运行时：为容器创建任务。
///
/// 实现负责把进程的 stdio 接到 `container.io()` 上，并在进程退出时调用
/// `Container::mark_exited`。
pub trait TaskRuntime: Send + Sync {
    fn spawn(&self, container: &Arc<Container>) -> Result<Arc<dyn Task>>;
}
