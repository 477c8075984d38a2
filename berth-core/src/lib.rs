//! Core library for container attach: container records, task lifecycle, IO multiplexing,
//! terminal resize relaying and attach sessions.

mod error;
mod manager;
mod models;
mod streaming;

pub use error::{ContainerError, Result};
pub use manager::{
    check_attachable, relay_resizes, AttachAdmission, AttachOptions, AttachStreams, Container,
    ContainerIo, ContainerManager, ContainerStore, IoBinding, ManagerConfig, NativeRuntime,
    StdinCloser, Task, TaskRuntime,
};
pub use models::{
    ContainerInfo, ContainerSpec, ContainerState, ContainerStatus, ContainerSummary,
    TerminalSize,
};
pub use streaming::{AttachRequest, AttachResponse, StreamTokens};
