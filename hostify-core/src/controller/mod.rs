//! 服务控制器：把宿主的控制事件协议与阻塞的负载主体对接起来。
//!
//! 每次运行只有两条执行上下文：宿主投递控制事件的线程，以及承载 `Worker::run` 的阻塞任务。
//! 控制事件只写入取消通道，由监督任务负责把停止请求转发给 worker。

use crate::error::{Result, ServiceError};
use crate::models::{ControlEvent, ServiceState, ServiceStatus};
use crate::worker::Worker;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::{task, time};
use tracing::{debug, error, info, instrument, warn};

mod status;

pub use status::{PENDING_WAIT_HINT, SERVICE_SPECIFIC_EXIT_CODE};
use status::StatusBook;

/// stop-pending 期间重复上报的间隔，保证 checkpoint 持续递增。
pub const PENDING_REPORT_INTERVAL: Duration = Duration::from_secs(2);

/// 等待 `on_stop` 返回的上限；超时只记录日志，控制器继续等待 `run` 结束。
pub const STOP_DISPATCH_TIMEOUT: Duration = PENDING_WAIT_HINT;

/// 向宿主服务管理器上报状态。
pub trait StatusReporter: Send + Sync {
    fn report(&self, status: &ServiceStatus) -> Result<()>;
}

/// 宿主侧控制事件注册：把 [`ControlHandle`] 交给宿主，换回状态上报通道。
pub trait ControlHost {
    fn register(&self, service_name: &str, handle: ControlHandle)
        -> Result<Arc<dyn StatusReporter>>;
}

struct Shared {
    service_name: String,
    reporter: OnceLock<Arc<dyn StatusReporter>>,
    book: Mutex<StatusBook>,
    stop_tx: watch::Sender<bool>,
}

impl Shared {
    fn book(&self) -> MutexGuard<'_, StatusBook> {
        // 状态簿只做简单赋值，中毒后数据依然可用
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, status: &ServiceStatus) {
        let Some(reporter) = self.reporter.get() else {
            debug!(service = %self.service_name, state = ?status.state, "no reporter registered");
            return;
        };
        if let Err(e) = reporter.report(status) {
            warn!(service = %self.service_name, state = ?status.state, "failed to report status: {e}");
        }
    }

    /// 状态切换与上报在同一把锁内完成，保证上报顺序与状态顺序一致。
    fn transition(&self, state: ServiceState) -> bool {
        let mut book = self.book();
        match book.transition(state) {
            Some(status) => {
                self.publish(&status);
                true
            }
            None => false,
        }
    }

    fn report_current(&self) {
        let mut book = self.book();
        let status = book.snapshot();
        self.publish(&status);
    }

    fn request_stop(&self, event: ControlEvent) {
        {
            let mut book = self.book();
            if book.state() != ServiceState::Running {
                debug!(service = %self.service_name, ?event, state = ?book.state(), "stop ignored");
                return;
            }
            if let Some(status) = book.transition(ServiceState::StopPending) {
                self.publish(&status);
            }
        }
        info!(service = %self.service_name, ?event, "stop requested");
        self.stop_tx.send_replace(true);
    }

    fn report_stopped(&self) {
        if self.transition(ServiceState::Stopped) {
            info!(service = %self.service_name, "service stopped");
        }
    }
}

/// 宿主持有的控制句柄，可在任意线程上投递事件。
#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("service", &self.shared.service_name)
            .finish()
    }
}

impl ControlHandle {
    pub fn handle(&self, event: ControlEvent) {
        match event {
            ControlEvent::Interrogate => self.shared.report_current(),
            ControlEvent::Stop | ControlEvent::Shutdown => {
                self.shared.request_stop(event)
            }
        }
    }

    pub fn state(&self) -> ServiceState {
        self.shared.book().state()
    }
}

/// 单次运行的状态机：`idle → start-pending → running → stop-pending → stopped`。
pub struct ServiceController {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceController")
            .field("service", &self.shared.service_name)
            .field("state", &self.state())
            .finish()
    }
}

impl ServiceController {
    pub fn new(service_name: impl Into<String>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                service_name: service_name.into(),
                reporter: OnceLock::new(),
                book: Mutex::new(StatusBook::default()),
                stop_tx,
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    pub fn state(&self) -> ServiceState {
        self.shared.book().state()
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            shared: self.shared.clone(),
        }
    }

    /// 向宿主注册控制事件接收者，只能调用一次。
    #[instrument(skip_all, fields(service = %self.shared.service_name))]
    pub fn init(&self, host: &dyn ControlHost) -> Result<()> {
        if self.shared.reporter.get().is_some() {
            return Err(ServiceError::Other(format!(
                "service {} is already registered with the host",
                self.shared.service_name
            )));
        }
        let reporter = host.register(&self.shared.service_name, self.handle())?;
        self.shared
            .reporter
            .set(reporter)
            .map_err(|_| ServiceError::Other("status reporter already set".into()))?;
        debug!("control handler registered");
        Ok(())
    }

    /// 失败后的 stopped 上报携带非零退出码。
    pub fn mark_failed(&self) {
        self.shared.book().mark_failed();
    }

    /// 终态上报，重复调用无效果。
    pub fn report_stopped(&self) {
        self.shared.report_stopped();
    }

    /// 驱动一次完整运行，返回前一定已经上报 stopped。
    #[instrument(skip_all, fields(service = %self.shared.service_name))]
    pub fn run(&self, worker: Box<dyn Worker>) -> Result<()> {
        if self.shared.reporter.get().is_none() {
            return Err(ServiceError::Other(format!(
                "service {} must be registered with the host before running",
                self.shared.service_name
            )));
        }
        if self.state() != ServiceState::Idle {
            return Err(ServiceError::Other(format!(
                "service {} has already run",
                self.shared.service_name
            )));
        }

        let result = self.drive(worker);
        if result.is_err() {
            self.mark_failed();
        }
        self.report_stopped();
        result
    }

    fn drive(&self, worker: Box<dyn Worker>) -> Result<()> {
        let service = self.shared.service_name.clone();
        self.shared.transition(ServiceState::StartPending);

        let start_failed = |e: ServiceError| ServiceError::StartFailed {
            service: service.clone(),
            source: Box::new(e),
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| start_failed(e.into()))?;
        let worker = runtime
            .block_on(start(self.shared.clone(), worker))
            .map_err(start_failed)?;

        self.shared.transition(ServiceState::Running);
        info!("service running");

        let result = runtime.block_on(supervise(self.shared.clone(), worker));
        // 超时未返回的 on_stop 不再等待
        runtime.shutdown_background();

        result.map_err(|e| ServiceError::RunFailed {
            service,
            source: Box::new(e),
        })
    }
}

/// pending 状态下周期性重报的计时器，首次触发在一个间隔之后。
fn pending_ticker() -> time::Interval {
    let mut ticker = time::interval_at(
        time::Instant::now() + PENDING_REPORT_INTERVAL,
        PENDING_REPORT_INTERVAL,
    );
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    ticker
}

/// 在阻塞任务中执行 `on_start`，期间持续重报 start-pending。
async fn start(shared: Arc<Shared>, mut worker: Box<dyn Worker>) -> Result<Arc<dyn Worker>> {
    let call = task::spawn_blocking(move || contain(|| worker.on_start()).map(|()| worker));
    tokio::pin!(call);

    let mut ticker = pending_ticker();
    loop {
        tokio::select! {
            joined = &mut call => {
                return match joined {
                    Ok(started) => started.map(Arc::from),
                    Err(e) => Err(ServiceError::Workload(format!("on_start was aborted: {e}"))),
                };
            }
            _ = ticker.tick() => shared.report_current(),
        }
    }
}

/// 在阻塞任务中执行负载主体，同时响应取消通道。
async fn supervise(shared: Arc<Shared>, worker: Arc<dyn Worker>) -> Result<()> {
    let mut stop_rx = shared.stop_tx.subscribe();
    let body = {
        let worker = worker.clone();
        task::spawn_blocking(move || worker.run())
    };
    tokio::pin!(body);

    let mut ticker = pending_ticker();

    // 订阅前已到达的停止请求
    let mut stopping = *stop_rx.borrow_and_update();
    if stopping {
        task::spawn(dispatch_stop(shared.service_name.clone(), worker.clone()));
    }

    loop {
        tokio::select! {
            joined = &mut body => {
                return match joined {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(ServiceError::Workload(format!(
                        "the workload panicked: {}",
                        panic_message(e.into_panic().as_ref())
                    ))),
                    Err(e) => Err(ServiceError::Workload(format!("the workload was aborted: {e}"))),
                };
            }
            changed = stop_rx.changed(), if !stopping => {
                if changed.is_ok() && *stop_rx.borrow_and_update() {
                    stopping = true;
                    task::spawn(dispatch_stop(shared.service_name.clone(), worker.clone()));
                }
            }
            _ = ticker.tick(), if stopping => {
                shared.report_current();
            }
        }
    }
}

/// `on_stop` 错误唯一的记录点。
async fn dispatch_stop(service: String, worker: Arc<dyn Worker>) {
    let call = task::spawn_blocking(move || worker.on_stop());
    match time::timeout(STOP_DISPATCH_TIMEOUT, call).await {
        Ok(Ok(Ok(()))) => debug!(service = %service, "stop forwarded to the workload"),
        Ok(Ok(Err(e))) => warn!(service = %service, "an error occurred while stopping the workload: {e}"),
        Ok(Err(e)) => error!(service = %service, "on_stop panicked: {e}"),
        Err(_) => warn!(
            service = %service,
            "on_stop did not return within {STOP_DISPATCH_TIMEOUT:?}; waiting for the workload"
        ),
    }
}

/// 把 `on_start` 中的 panic 转为负载错误。
fn contain<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(ServiceError::Workload(format!(
            "the workload panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}
