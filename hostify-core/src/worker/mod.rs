//! Worker 契约与工厂：按配置中的 `worker_kind` 选择后端。
//!
//! 所有后端都满足同一套语义：
//! - 构造时校验 `context`，失败即返回配置错误；
//! - `on_start` 做耗时但不阻塞等待完成的准备工作；
//! - `run` 阻塞到负载自然结束，或被 `on_stop` 打断；
//! - `on_stop` 幂等，未启动时为空操作，只会向负载转发一次。

use crate::config::{ServiceConfig, WorkerKind};
use crate::error::{Result, ServiceError};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::instrument;

mod component;
mod executable;
mod managed_runtime;
mod native_module;
mod process;

#[cfg(windows)]
pub use component::ComponentWorker;
pub use executable::ExecutableWorker;
pub use managed_runtime::{ManagedRuntimeWorker, HOST_CLASS};
pub use native_module::{NativeModuleWorker, RUN_SYMBOL, STOP_SYMBOL};

/// 统一的后端能力集合。
///
/// `run` 与 `on_stop` 会在不同线程上并发调用，因此取 `&self`，实现内部自行同步。
pub trait Worker: Send + Sync {
    fn config(&self) -> &ServiceConfig;

    /// 启动前准备：创建进程 / 实例化组件 / 引导运行时。失败对本次运行是致命的。
    fn on_start(&mut self) -> Result<()>;

    /// 请求停止。错误只会在控制器的唯一调用点被记录，不会向上传播。
    fn on_stop(&self) -> Result<()>;

    /// 阻塞执行负载主体。
    fn run(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.config().name)
            .field("kind", &self.config().worker_kind)
            .finish_non_exhaustive()
    }
}

/// 纯分发：不依赖是否处于服务控制之下，安装前也可用于提前校验。
#[instrument(skip(config), fields(service = %config.name, kind = %config.worker_kind))]
pub fn build(config: ServiceConfig) -> Result<Box<dyn Worker>> {
    let worker: Box<dyn Worker> = match config.worker_kind {
        WorkerKind::Executable => Box::new(ExecutableWorker::new(config)?),
        WorkerKind::NativeModule => Box::new(NativeModuleWorker::new(config)?),
        WorkerKind::Component => component::build(config)?,
        WorkerKind::ManagedRuntime => Box::new(ManagedRuntimeWorker::new(config)?),
    };
    Ok(worker)
}

/// context 非空校验，`what` 描述该后端对 context 的期望。
pub(crate) fn require_context(config: &ServiceConfig, what: &str) -> Result<()> {
    if config.context.trim().is_empty() {
        return Err(ServiceError::invalid_config(format!(
            "the context of service {} must be a non-empty {what}",
            config.name
        )));
    }
    Ok(())
}

/// context 必须指向已存在的普通文件。
pub(crate) fn require_file(config: &ServiceConfig, what: &str) -> Result<()> {
    require_context(config, what)?;
    if !Path::new(&config.context).is_file() {
        return Err(ServiceError::invalid_config(format!(
            "the {what} {} must be a regular file",
            config.context
        )));
    }
    Ok(())
}

/// 停止转发闸门：`on_start` 成功后才上膛，之后只放行第一次 `on_stop`。
#[derive(Debug, Default)]
pub(crate) struct StopLatch {
    armed: AtomicBool,
    fired: AtomicBool,
}

impl StopLatch {
    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// 仅在已上膛且首次调用时返回 true。
    pub(crate) fn fire(&self) -> bool {
        self.armed.load(Ordering::Acquire) && !self.fired.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_fails_for_every_kind() {
        for kind in WorkerKind::ALL {
            let config = ServiceConfig::new("demo", "Demo", kind, "   ");
            let err = build(config).unwrap_err();
            assert!(
                matches!(err, ServiceError::InvalidConfig(_)),
                "{kind}: unexpected error {err}"
            );
        }
    }

    #[test]
    fn missing_files_fail_at_construction() {
        let missing = std::env::temp_dir().join("hostify-definitely-missing.bin");
        for kind in [WorkerKind::Executable, WorkerKind::NativeModule] {
            let config =
                ServiceConfig::new("demo", "Demo", kind, missing.to_string_lossy().into_owned());
            assert!(matches!(
                build(config),
                Err(ServiceError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn latch_only_fires_once_after_arming() {
        let latch = StopLatch::default();
        assert!(!latch.fire());
        assert!(!latch.fired());
        latch.arm();
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.fired());
    }
}
