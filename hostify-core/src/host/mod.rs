//! 进程入口编排：服务主函数与安装/卸载动作。

use crate::config::ServiceConfig;
use crate::controller::{ControlHost, ServiceController};
use crate::error::{Result, ServiceError};
use crate::lifecycle::{HostLayout, LifecycleManager, ServiceRegistrar};
use crate::logging::{self, LoggingGuard};
use crate::store::{keys, ConfigStore};
use crate::worker;
use std::path::Path;
use tracing::{debug, error, info, instrument};

/// 命令行触发的安装期动作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupAction {
    Install,
    Uninstall,
}

/// 从存储中还原安装时写入的配置。
pub fn load_startup_config<S: ConfigStore>(store: &S, service_name: &str) -> Result<ServiceConfig> {
    let blob = store.get_string(&keys::service_param_key(service_name), keys::STARTUP_CONFIGURATION)?;
    let config = ServiceConfig::from_portable_blob(&blob)?;
    if !config.name.eq_ignore_ascii_case(service_name) {
        return Err(ServiceError::invalid_config(format!(
            "the startup configuration of {service_name} belongs to {}",
            config.name
        )));
    }
    config.validate()?;
    Ok(config)
}

/// 切换工作目录并注册动态库搜索目录。
pub fn prepare_environment(config: &ServiceConfig) -> Result<()> {
    let working_directory = config.working_directory();
    std::env::set_current_dir(&working_directory).map_err(|e| {
        ServiceError::invalid_config(format!(
            "failed to change the working directory to {}: {e}",
            working_directory.display()
        ))
    })?;
    debug!(dir = %working_directory.display(), "working directory changed");

    let search_directories = config.search_directories();
    #[cfg(windows)]
    crate::scm::add_library_directories(&search_directories)?;
    #[cfg(not(windows))]
    debug!(
        count = search_directories.len(),
        "library search directories only apply on Windows"
    );
    Ok(())
}

/// 宿主以服务名调用的主函数。注册控制处理器后，任何失败都会以 stopped 收尾。
pub fn service_main<S: ConfigStore>(
    service_name: &str,
    host: &dyn ControlHost,
    store: &S,
) -> Result<()> {
    logging::init_tracing();
    let controller = ServiceController::new(service_name);
    if let Err(e) = controller.init(host) {
        report_entry_failure(service_name, &e);
        return Err(e);
    }

    // guard 活到错误记录之后
    let mut logging: Option<LoggingGuard> = None;
    let result = run_service(&controller, store, &mut logging);
    if let Err(e) = &result {
        report_entry_failure(service_name, e);
        controller.mark_failed();
        controller.report_stopped();
    }
    drop(logging);
    result
}

/// 入口级失败：写日志，Windows 上同时输出到调试器（服务进程通常没有可见的控制台）。
fn report_entry_failure(service_name: &str, e: &ServiceError) {
    error!(service = %service_name, "the service main failed: {e}");
    #[cfg(windows)]
    crate::scm::debug_output(&format!("hostify: the service {service_name} failed: {e}"));
}

fn run_service<S: ConfigStore>(
    controller: &ServiceController,
    store: &S,
    logging: &mut Option<LoggingGuard>,
) -> Result<()> {
    let config = load_startup_config(store, controller.service_name())?;
    #[cfg(windows)]
    crate::scm::ensure_service_session()?;
    prepare_environment(&config)?;
    *logging = Some(logging::init(&config, true)?);

    info!(
        service = %config.name,
        kind = %config.worker_kind,
        context = %config.context,
        "starting service"
    );
    let worker = worker::build(config)?;
    controller.run(worker)
}

/// 读取配置文件并执行安装或卸载。
#[instrument(skip(registrar, store, layout))]
pub fn setup<R, S>(
    action: SetupAction,
    config_file: &Path,
    registrar: R,
    store: S,
    layout: HostLayout,
) -> Result<()>
where
    R: ServiceRegistrar,
    S: ConfigStore,
{
    let config = ServiceConfig::load(config_file)?;
    let _logging = logging::init(&config, false)?;
    let manager = LifecycleManager::new(config, registrar, store, layout);
    let name = manager.config().name.clone();

    match action {
        SetupAction::Install => {
            prepare_environment(manager.config())?;
            manager.install()?;
            info!(service = %name, "installation completed");
        }
        SetupAction::Uninstall => {
            if !manager.installed() {
                return Err(ServiceError::NotFound(name));
            }
            manager.uninstall()?;
            info!(service = %name, "uninstallation completed");
        }
    }
    Ok(())
}
