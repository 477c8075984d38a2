//! 终端尺寸转发：按顺序把 resize 事件应用到任务上，单次失败只记日志。

use super::*;
use tracing::{debug, warn};

/// 消费 resize 事件直到通道关闭（所有发送端被丢弃）。
///
/// 与上一次成功应用的尺寸相同的事件会被跳过；失败过的尺寸总会重试。
pub async fn relay_resizes<F>(
    container_id: &str,
    mut events: mpsc::Receiver<TerminalSize>,
    mut apply: F,
) where
    F: FnMut(TerminalSize) -> Result<()>,
{
    let mut applied: Option<TerminalSize> = None;
    while let Some(size) = events.recv().await {
        if applied == Some(size) {
            continue;
        }
        match apply(size) {
            Ok(()) => applied = Some(size),
            Err(e) => warn!(
                container_id,
                width = size.width,
                height = size.height,
                error = %e,
                "failed to resize task console"
            ),
        }
    }
    debug!(container_id, "resize event source closed");
}
