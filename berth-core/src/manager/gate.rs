use super::*;

/// 状态检查结果：可以直接 attach，或需要先隐式启动容器。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachAdmission {
    Ready,
    StartRequired,
}

/// attach 前的状态门：预检查与 attach 入口共用同一判断。
pub fn check_attachable(state: ContainerState) -> Result<AttachAdmission> {
    match state {
        ContainerState::Running => Ok(AttachAdmission::Ready),
        ContainerState::Created => Ok(AttachAdmission::StartRequired),
        other => Err(ContainerError::InvalidState(other)),
    }
}
