//! 安装期的服务注册与注销，与运行期控制相互独立。

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::store::{keys, ConfigStore, StoreValue};
use crate::worker;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// 独立进程启动时追加的参数，由 CLI 识别后进入服务分派。
pub const SERVICE_LAUNCH_FLAG: &str = "--service";

/// 服务管理器中的进程类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    OwnProcess,
    ShareProcess,
}

/// 服务管理器启动服务时执行的命令行。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub arguments: Vec<String>,
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.program.display())?;
        for arg in &self.arguments {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// 提交给服务管理器的注册信息；启动方式固定为自动。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    /// None 表示 LocalSystem。
    pub account: Option<String>,
    pub kind: ServiceKind,
    pub launch: LaunchCommand,
}

/// 服务管理器的注册操作。
pub trait ServiceRegistrar {
    fn exists(&self, name: &str) -> Result<bool>;
    fn create(&self, registration: &ServiceRegistration) -> Result<()>;
    /// 服务未运行时返回 [`ServiceError::NotActive`]。
    fn stop(&self, name: &str) -> Result<()>;
    /// 服务不存在时返回 [`ServiceError::NotFound`]。
    fn delete(&self, name: &str) -> Result<()>;
}

impl<T: ServiceRegistrar + ?Sized> ServiceRegistrar for &T {
    fn exists(&self, name: &str) -> Result<bool> {
        (**self).exists(name)
    }

    fn create(&self, registration: &ServiceRegistration) -> Result<()> {
        (**self).create(registration)
    }

    fn stop(&self, name: &str) -> Result<()> {
        (**self).stop(name)
    }

    fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name)
    }
}

/// 安装所需的宿主文件位置。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    /// 独立模式下服务管理器直接启动的镜像。
    pub image_path: PathBuf,
    /// 共享模式下的宿主进程（svchost.exe）。
    pub shared_host_path: PathBuf,
    /// 共享宿主加载的入口动态库，需导出 `ServiceMain`。
    pub shared_library_path: PathBuf,
}

impl HostLayout {
    pub fn launch_command(&self, config: &ServiceConfig) -> LaunchCommand {
        if config.standalone() {
            LaunchCommand {
                program: self.image_path.clone(),
                arguments: vec![SERVICE_LAUNCH_FLAG.to_string()],
            }
        } else {
            LaunchCommand {
                program: self.shared_host_path.clone(),
                arguments: vec!["-k".to_string(), keys::group_name(&config.name)],
            }
        }
    }
}

pub struct LifecycleManager<R, S> {
    config: ServiceConfig,
    registrar: R,
    store: S,
    layout: HostLayout,
}

impl<R, S> fmt::Debug for LifecycleManager<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("service", &self.config.name)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl<R: ServiceRegistrar, S: ConfigStore> LifecycleManager<R, S> {
    pub fn new(config: ServiceConfig, registrar: R, store: S, layout: HostLayout) -> Self {
        Self {
            config,
            registrar,
            store,
            layout,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registration(&self) -> ServiceRegistration {
        ServiceRegistration {
            name: self.config.name.clone(),
            display_name: self.config.display_name.clone(),
            description: self.config.description.clone(),
            account: self.config.account_kind.account_name().map(str::to_string),
            kind: if self.config.standalone() {
                ServiceKind::OwnProcess
            } else {
                ServiceKind::ShareProcess
            },
            launch: self.layout.launch_command(&self.config),
        }
    }

    /// 先构造一次 worker 做校验，任何写入都发生在校验之后。
    #[instrument(skip(self), fields(service = %self.config.name))]
    pub fn install(&self) -> Result<()> {
        drop(worker::build(self.config.clone())?);

        let name = &self.config.name;
        if self.registrar.exists(name)? {
            return Err(ServiceError::AlreadyExists(name.clone()));
        }

        let registration = self.registration();
        self.registrar.create(&registration)?;
        debug!(launch = %registration.launch, "service registered");

        if let Err(e) = self.persist() {
            warn!("failed to persist the configuration, removing the registration: {e}");
            if let Err(cleanup) = self.registrar.delete(name) {
                warn!("failed to remove the registration: {cleanup}");
            }
            return Err(e);
        }

        info!(standalone = self.config.standalone(), "service installed");
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let name = &self.config.name;
        let param_key = keys::service_param_key(name);
        self.store.set(
            &param_key,
            keys::STARTUP_CONFIGURATION,
            StoreValue::String(self.config.to_portable_blob()?),
        )?;
        if self.config.standalone() {
            return Ok(());
        }

        self.store.set(
            keys::SVCHOST_KEY,
            &keys::group_name(name),
            StoreValue::MultiString(vec![name.clone()]),
        )?;
        self.store.set(
            &keys::group_key(name),
            keys::CO_INITIALIZE_SECURITY_PARAM,
            StoreValue::U32(1),
        )?;
        self.store.set(
            &param_key,
            keys::SERVICE_DLL,
            StoreValue::String(self.layout.shared_library_path.display().to_string()),
        )?;
        self.store.set(
            &param_key,
            keys::SERVICE_DLL_UNLOAD_ON_STOP,
            StoreValue::U32(1),
        )?;
        self.store.set(
            &param_key,
            keys::SERVICE_MAIN,
            StoreValue::String(keys::SERVICE_MAIN_EXPORT.to_string()),
        )?;
        Ok(())
    }

    /// 停止（未运行视为成功）并删除注册，再清理存储项；存储项缺失不算错误。
    #[instrument(skip(self), fields(service = %self.config.name))]
    pub fn uninstall(&self) -> Result<()> {
        let name = &self.config.name;
        match self.registrar.stop(name) {
            Ok(()) => debug!("stop requested"),
            Err(ServiceError::NotActive(_)) => debug!("service was not running"),
            Err(e) => return Err(e),
        }
        self.registrar.delete(name)?;

        self.remove_entry(&keys::service_param_key(name), None);
        if !self.config.standalone() {
            self.remove_entry(&keys::group_key(name), None);
            self.remove_entry(keys::SVCHOST_KEY, Some(&keys::group_name(name)));
        }

        info!("service uninstalled");
        Ok(())
    }

    fn remove_entry(&self, path: &str, key: Option<&str>) {
        match self.store.delete(path, key) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(path, ?key, "entry already absent"),
            Err(e) => warn!("failed to remove {path}: {e}"),
        }
    }

    /// 只用于前置检查，查询失败按未安装处理。
    pub fn installed(&self) -> bool {
        match self.registrar.exists(&self.config.name) {
            Ok(exists) => exists,
            Err(e) => {
                debug!(service = %self.config.name, "failed to query the service: {e}");
                false
            }
        }
    }
}
