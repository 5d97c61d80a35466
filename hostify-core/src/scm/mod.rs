//! Windows 服务管理器（SCM）绑定：控制事件注册、状态上报、服务注册与进程环境。

use crate::controller::{ControlHandle, ControlHost, StatusReporter};
use crate::error::{Result, ServiceError};
use crate::lifecycle::{HostLayout, ServiceKind, ServiceRegistrar, ServiceRegistration};
use crate::models::{ControlEvent, ServiceState, ServiceStatus};
use std::ffi::{OsStr, OsString};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use windows_service::service::{
    self as scm, ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl,
    ServiceExitCode, ServiceInfo, ServiceStartType, ServiceType,
};
use windows_service::service_control_handler::{
    self, ServiceControlHandlerResult, ServiceStatusHandle,
};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};
use windows_sys::Win32::Foundation::{
    ERROR_SERVICE_DOES_NOT_EXIST, ERROR_SERVICE_EXISTS, ERROR_SERVICE_NOT_ACTIVE,
};

/// 共享宿主入口动态库的文件名。
pub const SHARED_LIBRARY_NAME: &str = "hostify_svchost.dll";

/// 通过 `RegisterServiceCtrlHandlerEx` 接收控制事件。
#[derive(Debug, Clone, Copy)]
pub struct ScmControlHost {
    service_type: ServiceType,
}

impl ScmControlHost {
    pub fn own_process() -> Self {
        Self {
            service_type: ServiceType::OWN_PROCESS,
        }
    }

    pub fn share_process() -> Self {
        Self {
            service_type: ServiceType::SHARE_PROCESS,
        }
    }
}

impl ControlHost for ScmControlHost {
    fn register(
        &self,
        service_name: &str,
        handle: ControlHandle,
    ) -> Result<Arc<dyn StatusReporter>> {
        let status_handle = service_control_handler::register(service_name, move |control| {
            let event = match control {
                ServiceControl::Stop => ControlEvent::Stop,
                ServiceControl::Shutdown | ServiceControl::Preshutdown => ControlEvent::Shutdown,
                ServiceControl::Interrogate => ControlEvent::Interrogate,
                _ => return ServiceControlHandlerResult::NotImplemented,
            };
            handle.handle(event);
            ServiceControlHandlerResult::NoError
        })
        .map_err(|e| registration_error(service_name, "register the control handler of", e))?;

        Ok(Arc::new(ScmStatusReporter {
            handle: status_handle,
            service_type: self.service_type,
        }))
    }
}

pub struct ScmStatusReporter {
    handle: ServiceStatusHandle,
    service_type: ServiceType,
}

impl StatusReporter for ScmStatusReporter {
    fn report(&self, status: &ServiceStatus) -> Result<()> {
        let current_state = match status.state {
            // Idle 只会出现在 Interrogate 的应答里，此时 SCM 视角仍在启动中
            ServiceState::Idle | ServiceState::StartPending => scm::ServiceState::StartPending,
            ServiceState::Running => scm::ServiceState::Running,
            ServiceState::StopPending => scm::ServiceState::StopPending,
            ServiceState::Stopped => scm::ServiceState::Stopped,
        };
        let controls_accepted = if status.accepts_stop {
            ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN
        } else {
            ServiceControlAccept::empty()
        };
        let exit_code = match status.exit_code {
            0 => ServiceExitCode::Win32(0),
            code => ServiceExitCode::ServiceSpecific(code),
        };
        self.handle
            .set_service_status(scm::ServiceStatus {
                service_type: self.service_type,
                current_state,
                controls_accepted,
                exit_code,
                checkpoint: status.checkpoint,
                wait_hint: status.wait_hint,
                process_id: None,
            })
            .map_err(|e| ServiceError::Other(format!("SetServiceStatus failed: {e}")))
    }
}

/// 本机 SCM 上的服务注册。
#[derive(Debug, Default, Clone, Copy)]
pub struct ScmRegistrar;

impl ScmRegistrar {
    fn manager(access: ServiceManagerAccess) -> Result<ServiceManager> {
        ServiceManager::local_computer(None::<&str>, access)
            .map_err(|e| registration_error("", "connect to the service manager for", e))
    }
}

impl ServiceRegistrar for ScmRegistrar {
    fn exists(&self, name: &str) -> Result<bool> {
        let manager = Self::manager(ServiceManagerAccess::CONNECT)?;
        match manager.open_service(name, ServiceAccess::QUERY_STATUS) {
            Ok(_) => Ok(true),
            Err(e) if os_error(&e) == Some(ERROR_SERVICE_DOES_NOT_EXIST) => Ok(false),
            Err(e) => Err(registration_error(name, "query", e)),
        }
    }

    fn create(&self, registration: &ServiceRegistration) -> Result<()> {
        let manager =
            Self::manager(ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE)?;
        let info = ServiceInfo {
            name: OsString::from(&registration.name),
            display_name: OsString::from(&registration.display_name),
            service_type: match registration.kind {
                ServiceKind::OwnProcess => ServiceType::OWN_PROCESS,
                ServiceKind::ShareProcess => ServiceType::SHARE_PROCESS,
            },
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: registration.launch.program.clone(),
            launch_arguments: registration
                .launch
                .arguments
                .iter()
                .map(OsString::from)
                .collect(),
            dependencies: vec![],
            account_name: registration.account.as_ref().map(OsString::from),
            account_password: None,
        };
        let service = manager
            .create_service(&info, ServiceAccess::CHANGE_CONFIG)
            .map_err(|e| match os_error(&e) {
                Some(ERROR_SERVICE_EXISTS) => ServiceError::AlreadyExists(registration.name.clone()),
                _ => registration_error(&registration.name, "create", e),
            })?;
        if let Some(description) = registration.description.as_deref() {
            if let Err(e) = service.set_description(description) {
                warn!(service = %registration.name, "failed to set the description: {e}");
            }
        }
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<()> {
        let manager = Self::manager(ServiceManagerAccess::CONNECT)?;
        let service = manager
            .open_service(name, ServiceAccess::STOP | ServiceAccess::QUERY_STATUS)
            .map_err(|e| not_found_or(name, "open", e))?;
        match service.stop() {
            Ok(status) => {
                debug!(service = name, state = ?status.current_state, "stop requested");
                Ok(())
            }
            Err(e) if os_error(&e) == Some(ERROR_SERVICE_NOT_ACTIVE) => {
                Err(ServiceError::NotActive(name.to_string()))
            }
            Err(e) => Err(registration_error(name, "stop", e)),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        let manager = Self::manager(ServiceManagerAccess::CONNECT)?;
        let service = manager
            .open_service(name, ServiceAccess::DELETE)
            .map_err(|e| not_found_or(name, "open", e))?;
        service
            .delete()
            .map_err(|e| registration_error(name, "delete", e))
    }
}

fn os_error(e: &windows_service::Error) -> Option<u32> {
    match e {
        windows_service::Error::Winapi(io) => io.raw_os_error().map(|code| code as u32),
        _ => None,
    }
}

fn not_found_or(name: &str, action: &'static str, e: windows_service::Error) -> ServiceError {
    if os_error(&e) == Some(ERROR_SERVICE_DOES_NOT_EXIST) {
        ServiceError::NotFound(name.to_string())
    } else {
        registration_error(name, action, e)
    }
}

fn registration_error(name: &str, action: &'static str, e: windows_service::Error) -> ServiceError {
    let source = match e {
        windows_service::Error::Winapi(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
    };
    ServiceError::Registration {
        service: name.to_string(),
        action,
        source,
    }
}

/// 当前安装包的宿主布局：镜像自身、系统目录下的 svchost、同目录的入口动态库。
pub fn host_layout() -> Result<HostLayout> {
    let image_path = std::env::current_exe()?;
    let shared_library_path = image_path.with_file_name(SHARED_LIBRARY_NAME);
    Ok(HostLayout {
        image_path,
        shared_host_path: system_directory()?.join("svchost.exe"),
        shared_library_path,
    })
}

fn system_directory() -> Result<PathBuf> {
    use windows_sys::Win32::System::SystemInformation::GetSystemDirectoryW;

    let mut buffer = vec![0u16; 260];
    loop {
        // SAFETY: 缓冲区长度与传入的容量一致。
        let len = unsafe { GetSystemDirectoryW(buffer.as_mut_ptr(), buffer.len() as u32) } as usize;
        if len == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if len < buffer.len() {
            buffer.truncate(len);
            return Ok(PathBuf::from(OsString::from_wide(&buffer)));
        }
        buffer.resize(len + 1, 0);
    }
}

/// 服务只能在 session 0 中运行。
pub fn ensure_service_session() -> Result<()> {
    use windows_sys::Win32::System::RemoteDesktop::ProcessIdToSessionId;
    use windows_sys::Win32::System::Threading::GetCurrentProcessId;

    let mut session = 0u32;
    // SAFETY: 输出参数指向有效的 u32。
    let ok = unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session) };
    if ok == 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if session != 0 {
        return Err(ServiceError::Unsupported(format!(
            "the service host must run in session 0, not session {session}"
        )));
    }
    Ok(())
}

/// 把目录加入本进程的动态库搜索路径。
pub fn add_library_directories(dirs: &[PathBuf]) -> Result<()> {
    use windows_sys::Win32::System::LibraryLoader::{
        AddDllDirectory, SetDefaultDllDirectories, LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
    };

    // SAFETY: 只修改本进程的搜索策略。
    if unsafe { SetDefaultDllDirectories(LOAD_LIBRARY_SEARCH_DEFAULT_DIRS) } == 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    for dir in dirs.iter().filter(|d| d.is_dir()) {
        let wide = wide_path(dir);
        // SAFETY: NUL 结尾的绝对路径。
        if unsafe { AddDllDirectory(wide.as_ptr()) }.is_null() {
            warn!(
                dir = %dir.display(),
                "failed to add the library directory: {}",
                std::io::Error::last_os_error()
            );
        } else {
            debug!(dir = %dir.display(), "library directory added");
        }
    }
    Ok(())
}

/// 写入调试器输出（DebugView 等工具可见），用于日志尚未可用时的入口级失败。
pub fn debug_output(message: &str) {
    use windows_sys::Win32::System::Diagnostics::Debug::OutputDebugStringW;

    let wide: Vec<u16> = OsStr::new(message).encode_wide().chain(Some(0)).collect();
    // SAFETY: NUL 结尾的宽字符串，调用期间存活。
    unsafe { OutputDebugStringW(wide.as_ptr()) };
}

fn wide_path(path: &Path) -> Vec<u16> {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    OsStr::new(&absolute).encode_wide().chain(Some(0)).collect()
}
