use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 控制器状态机：idle → start-pending → running → stop-pending → stopped。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Idle,
    StartPending,
    Running,
    StopPending,
    Stopped,
}

impl ServiceState {
    /// pending 状态需要递增 checkpoint 并携带等待提示。
    pub fn is_pending(self) -> bool {
        matches!(self, Self::StartPending | Self::StopPending)
    }
}

/// 上报给宿主服务管理器的状态快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub checkpoint: u32,
    pub wait_hint: Duration,
    pub accepts_stop: bool,
    /// 0 表示正常；非 0 仅出现在失败后的 stopped 上报中。
    pub exit_code: u32,
}

/// 宿主投递的控制事件。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Stop,
    Shutdown,
    Interrogate,
}
