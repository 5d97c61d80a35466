//! 状态簿：记录当前状态并按上报规则生成快照。

use crate::models::{ServiceState, ServiceStatus};
use std::time::Duration;

/// pending 状态的等待提示。
pub const PENDING_WAIT_HINT: Duration = Duration::from_secs(10);

/// 失败后 stopped 上报携带的服务自定义退出码。
pub const SERVICE_SPECIFIC_EXIT_CODE: u32 = 1;

#[derive(Debug)]
pub(crate) struct StatusBook {
    state: ServiceState,
    checkpoint: u32,
    failed: bool,
}

impl Default for StatusBook {
    fn default() -> Self {
        Self {
            state: ServiceState::Idle,
            checkpoint: 0,
            failed: false,
        }
    }
}

impl StatusBook {
    pub(crate) fn state(&self) -> ServiceState {
        self.state
    }

    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// 切换状态并返回应上报的快照；进入 stopped 后不再变化。
    pub(crate) fn transition(&mut self, state: ServiceState) -> Option<ServiceStatus> {
        if self.state == ServiceState::Stopped {
            return None;
        }
        self.state = state;
        Some(self.snapshot())
    }

    /// 当前状态的快照。pending 状态每次调用都会递增 checkpoint。
    pub(crate) fn snapshot(&mut self) -> ServiceStatus {
        let wait_hint = if self.state.is_pending() {
            self.checkpoint = self.checkpoint.wrapping_add(1);
            PENDING_WAIT_HINT
        } else {
            self.checkpoint = 0;
            Duration::ZERO
        };
        let exit_code = if self.state == ServiceState::Stopped && self.failed {
            SERVICE_SPECIFIC_EXIT_CODE
        } else {
            0
        };
        ServiceStatus {
            state: self.state,
            checkpoint: self.checkpoint,
            wait_hint,
            accepts_stop: matches!(self.state, ServiceState::Running | ServiceState::StopPending),
            exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_states_count_checkpoints() {
        let mut book = StatusBook::default();
        let first = book.transition(ServiceState::StartPending).unwrap();
        assert_eq!(first.checkpoint, 1);
        assert_eq!(first.wait_hint, PENDING_WAIT_HINT);
        assert!(!first.accepts_stop);
        assert_eq!(book.snapshot().checkpoint, 2);

        let running = book.transition(ServiceState::Running).unwrap();
        assert_eq!(running.checkpoint, 0);
        assert_eq!(running.wait_hint, Duration::ZERO);
        assert!(running.accepts_stop);

        let stopping = book.transition(ServiceState::StopPending).unwrap();
        assert_eq!(stopping.checkpoint, 1);
        assert_eq!(book.snapshot().checkpoint, 2);
        assert_eq!(book.snapshot().checkpoint, 3);
    }

    #[test]
    fn stopped_is_terminal() {
        let mut book = StatusBook::default();
        book.mark_failed();
        let stopped = book.transition(ServiceState::Stopped).unwrap();
        assert_eq!(stopped.exit_code, SERVICE_SPECIFIC_EXIT_CODE);
        assert_eq!(stopped.checkpoint, 0);
        assert!(!stopped.accepts_stop);
        assert!(book.transition(ServiceState::Running).is_none());
        assert_eq!(book.state(), ServiceState::Stopped);
    }

    #[test]
    fn clean_stop_reports_zero_exit_code() {
        let mut book = StatusBook::default();
        book.transition(ServiceState::Running);
        assert_eq!(book.transition(ServiceState::Stopped).unwrap().exit_code, 0);
    }
}
