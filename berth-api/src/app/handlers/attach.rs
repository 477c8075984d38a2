//! attach 流式端点
//!
//! 协议：二进制帧，首字节为通道号
//! - 0: 客户端 -> 容器 stdin
//! - 1: 容器 stdout -> 客户端
//! - 2: 容器 stderr -> 客户端
//! - 3: 会话错误（文本），随后关闭连接
//! - 4: 客户端 -> 终端尺寸 JSON，如 {"Width":120,"Height":40}

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use berth_core::{AttachRequest, AttachResponse, AttachStreams, ContainerManager, TerminalSize};
use futures::stream::StreamExt;
use futures::SinkExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::app::{ApiError, AppState};

const STDIN_CHANNEL: u8 = 0;
const STDOUT_CHANNEL: u8 = 1;
const STDERR_CHANNEL: u8 = 2;
const ERROR_CHANNEL: u8 = 3;
const RESIZE_CHANNEL: u8 = 4;

/// 内存管道容量
const PIPE_SIZE: usize = 64 * 1024;
/// 未处理的 resize 事件上限，超出时丢弃新事件
const RESIZE_QUEUE: usize = 16;

#[derive(Debug, Default, Deserialize)]
pub struct AttachBody {
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub stderr: bool,
    #[serde(default)]
    pub tty: bool,
}

#[derive(Debug, Deserialize)]
struct ResizeFrame {
    #[serde(rename = "Width")]
    width: u16,
    #[serde(rename = "Height")]
    height: u16,
}

/// POST /containers/:id/attach - 预检查并返回流式端点 URL
#[instrument(skip_all)]
pub async fn prepare_attach(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AttachBody>,
) -> Result<Json<AttachResponse>, ApiError> {
    let response = state.manager.can_attach(AttachRequest {
        container_id: id,
        stdin: body.stdin,
        stdout: body.stdout,
        stderr: body.stderr,
        tty: body.tty,
    })?;
    Ok(Json(response))
}

/// GET /stream/attach/:token - 凭令牌升级为 WebSocket 并进入 attach 会话
pub async fn stream_attach(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let request = state.manager.streams().consume(&token)?;
    let manager = state.manager.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, manager, request)))
}

/// 在 WebSocket 与 attach 会话之间搬运数据
async fn handle_socket(socket: WebSocket, manager: Arc<ContainerManager>, request: AttachRequest) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (stdin_client, stdin_server) = tokio::io::duplex(PIPE_SIZE);
    let (stdout_server, stdout_client) = tokio::io::duplex(PIPE_SIZE);
    let (stderr_server, stderr_client) = tokio::io::duplex(PIPE_SIZE);
    let (resize_tx, resize_rx) = mpsc::channel::<TerminalSize>(RESIZE_QUEUE);

    let with_stderr = request.stderr && !request.tty;
    let streams = AttachStreams {
        stdin: request
            .stdin
            .then(|| Box::new(stdin_server) as Box<dyn AsyncRead + Send + Unpin>),
        stdout: request
            .stdout
            .then(|| Box::new(stdout_server) as Box<dyn AsyncWrite + Send + Unpin>),
        stderr: with_stderr
            .then(|| Box::new(stderr_server) as Box<dyn AsyncWrite + Send + Unpin>),
    };
    let mut stdin_client = request.stdin.then_some(stdin_client);
    let mut stdout_client = request.stdout.then_some(stdout_client);
    let mut stderr_client = with_stderr.then_some(stderr_client);

    let id = request.container_id.clone();
    let tty = request.tty;
    let mut session =
        tokio::spawn(async move { manager.attach(&id, streams, tty, Some(resize_rx)).await });

    let mut out_buf = vec![0u8; 8192];
    let mut err_buf = vec![0u8; 8192];
    let mut outcome: Option<Result<(), String>> = None;

    loop {
        tokio::select! {
            // 客户端 -> 容器
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match data.split_first() {
                        Some((&STDIN_CHANNEL, payload)) => {
                            if let Some(writer) = stdin_client.as_mut() {
                                if writer.write_all(payload).await.is_err() {
                                    stdin_client = None;
                                }
                            }
                        }
                        Some((&RESIZE_CHANNEL, payload)) => {
                            if let Some(size) = parse_resize(payload) {
                                // 队列满时丢弃，不阻塞数据通道
                                let _ = resize_tx.try_send(size);
                            }
                        }
                        _ => {}
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            // 容器 stdout -> 客户端
            n = read_pipe(&mut stdout_client, &mut out_buf) => {
                match n {
                    Some(n) => {
                        if ws_tx.send(frame(STDOUT_CHANNEL, &out_buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    None => stdout_client = None,
                }
            }
            // 容器 stderr -> 客户端
            n = read_pipe(&mut stderr_client, &mut err_buf) => {
                match n {
                    Some(n) => {
                        if ws_tx.send(frame(STDERR_CHANNEL, &err_buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    None => stderr_client = None,
                }
            }
            result = &mut session => {
                outcome = Some(match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(e) => Err(e.to_string()),
                });
                break;
            }
        }
    }

    let Some(outcome) = outcome else {
        // 客户端断开：丢弃 stdin 与 resize 发送端即结束会话
        debug!(container_id = %request.container_id, "attach client disconnected");
        return;
    };

    // 会话已结束，把管道里剩余的输出发完
    for (reader, channel) in [
        (&mut stdout_client, STDOUT_CHANNEL),
        (&mut stderr_client, STDERR_CHANNEL),
    ] {
        let Some(reader) = reader.as_mut() else {
            continue;
        };
        while let Ok(n @ 1..) = reader.read(&mut out_buf).await {
            if ws_tx.send(frame(channel, &out_buf[..n])).await.is_err() {
                return;
            }
        }
    }
    if let Err(message) = outcome {
        debug!(container_id = %request.container_id, error = %message, "attach session failed");
        let _ = ws_tx.send(frame(ERROR_CHANNEL, message.as_bytes())).await;
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

async fn read_pipe(reader: &mut Option<DuplexStream>, buf: &mut [u8]) -> Option<usize> {
    match reader {
        Some(reader) => match reader.read(buf).await {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        },
        None => std::future::pending().await,
    }
}

fn frame(channel: u8, payload: &[u8]) -> Message {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(channel);
    data.extend_from_slice(payload);
    Message::Binary(data)
}

fn parse_resize(payload: &[u8]) -> Option<TerminalSize> {
    serde_json::from_slice::<ResizeFrame>(payload)
        .ok()
        .map(|f| TerminalSize::new(f.width, f.height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resize_frames() {
        assert_eq!(
            parse_resize(br#"{"Width":120,"Height":40}"#),
            Some(TerminalSize::new(120, 40))
        );
        assert_eq!(parse_resize(b"not json"), None);
    }

    #[test]
    fn frames_are_channel_prefixed() {
        match frame(STDOUT_CHANNEL, b"hi") {
            Message::Binary(data) => assert_eq!(data, vec![1, b'h', b'i']),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
