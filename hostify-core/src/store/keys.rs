//! 注册表布局：启动配置与共享宿主分组所在的路径和值名。

use sha2::{Digest, Sha224};

pub const SVCHOST_KEY: &str = r"HKLM\SOFTWARE\Microsoft\Windows NT\CurrentVersion\Svchost";
pub const CO_INITIALIZE_SECURITY_PARAM: &str = "CoInitializeSecurityParam";
pub const SERVICE_DLL: &str = "ServiceDll";
pub const SERVICE_DLL_UNLOAD_ON_STOP: &str = "ServiceDllUnloadOnStop";
pub const SERVICE_MAIN: &str = "ServiceMain";
pub const STARTUP_CONFIGURATION: &str = "StartupConfiguration";

/// 共享宿主动态库导出的入口函数名。
pub const SERVICE_MAIN_EXPORT: &str = "ServiceMain";

/// `HKLM\SYSTEM\CurrentControlSet\Services\<name>\Parameters`
pub fn service_param_key(service_name: &str) -> String {
    format!(r"HKLM\SYSTEM\CurrentControlSet\Services\{service_name}\Parameters")
}

/// 共享宿主分组名：服务名 + 服务名的 SHA-224 摘要。
pub fn group_name(service_name: &str) -> String {
    let digest = Sha224::digest(service_name.as_bytes());
    format!("Broker_{service_name}_{digest:x}")
}

/// `<Svchost>\<group>`
pub fn group_key(service_name: &str) -> String {
    format!(r"{SVCHOST_KEY}\{}", group_name(service_name))
}
