//! 流式端点令牌：预检查通过后签发一次性 URL，由传输层凭令牌换回 attach 请求。

use crate::error::{ContainerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use url::Url;
use uuid::Uuid;

/// attach 预检查请求。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachRequest {
    pub container_id: String,
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub stderr: bool,
    #[serde(default)]
    pub tty: bool,
}

impl AttachRequest {
    pub fn validate(&self) -> Result<()> {
        if !(self.stdin || self.stdout || self.stderr) {
            return Err(ContainerError::InvalidRequest(
                "one of stdin, stdout, or stderr must be set".into(),
            ));
        }
        if self.tty && self.stderr {
            return Err(ContainerError::InvalidRequest(
                "tty and stderr cannot both be set".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachResponse {
    pub url: String,
}

struct PendingRequest {
    request: AttachRequest,
    issued_at: Instant,
}

/// 一次性令牌缓存。克隆共享同一份缓存。
#[derive(Clone)]
pub struct StreamTokens {
    base_url: Url,
    ttl: Duration,
    pending: Arc<StdMutex<HashMap<String, PendingRequest>>>,
}

impl std::fmt::Debug for StreamTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTokens")
            .field("base_url", &self.base_url.as_str())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl StreamTokens {
    pub fn new(mut base_url: Url, ttl: Duration) -> Self {
        // join 依赖末尾的 `/`
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            ttl,
            pending: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// 校验请求并签发 `<base>/attach/<token>`。
    pub fn issue(&self, request: AttachRequest) -> Result<Url> {
        request.validate()?;
        let token = Uuid::new_v4().simple().to_string();
        let url = self
            .base_url
            .join(&format!("attach/{token}"))
            .map_err(|e| ContainerError::Other(format!("invalid stream url: {e}")))?;

        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, p| now.duration_since(p.issued_at) < self.ttl);
        pending.insert(
            token,
            PendingRequest {
                request,
                issued_at: now,
            },
        );
        Ok(url)
    }

    /// 取回并作废令牌；未知、已用或过期的令牌都返回 InvalidToken。
    pub fn consume(&self, token: &str) -> Result<AttachRequest> {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .ok_or(ContainerError::InvalidToken)?;
        if entry.issued_at.elapsed() >= self.ttl {
            return Err(ContainerError::InvalidToken);
        }
        Ok(entry.request)
    }
}
