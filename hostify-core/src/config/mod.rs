//! 服务配置：一次运行内只读，可从 JSON 文件加载，也可经由可移植 blob 在安装期与运行期之间传递。

use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::{Path, PathBuf};
use std::str::FromStr;

mod blob;
pub mod size;

/// 后端类型，决定 `context` 的含义。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(try_from = "String", into = "&'static str")]
pub enum WorkerKind {
    /// context 为可执行文件路径
    #[default]
    Executable,
    /// context 为导出固定 C 入口对的动态库路径
    NativeModule,
    /// context 为组件 CLSID / ProgID
    Component,
    /// context 为 JVM classpath
    ManagedRuntime,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 4] = [
        WorkerKind::Executable,
        WorkerKind::NativeModule,
        WorkerKind::Component,
        WorkerKind::ManagedRuntime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executable => "executable",
            Self::NativeModule => "native_module",
            Self::Component => "component",
            Self::ManagedRuntime => "managed_runtime",
        }
    }
}

impl FromStr for WorkerKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ServiceError::UnsupportedKind(s.to_string()))
    }
}

impl TryFrom<String> for WorkerKind {
    type Error = ServiceError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<WorkerKind> for &'static str {
    fn from(kind: WorkerKind) -> Self {
        kind.as_str()
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务运行所用的 OS 账户。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    LocalSystem,
    #[default]
    LocalService,
    NetworkService,
}

impl AccountKind {
    /// 注册服务时使用的账户名；`None` 表示 LocalSystem。
    pub fn account_name(self) -> Option<&'static str> {
        match self {
            Self::LocalSystem => None,
            Self::LocalService => Some(r"NT AUTHORITY\LocalService"),
            Self::NetworkService => Some(r"NT AUTHORITY\NetworkService"),
        }
    }
}

/// 日志配置（原样保存，解析与校验见 `logging`）。
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoggerConfig {
    pub base_path: String,
    pub max_size: Option<String>,
    pub max_files: Option<usize>,
}

/// 服务配置结构体
/// 可选字段缺省时不序列化，保证 blob 往返时 "缺省" 与 "显式值" 可区分。
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// 服务注册名
    pub name: String,
    /// 服务显示名
    pub display_name: String,
    /// 后端相关的上下文（可执行文件 / 动态库 / CLSID / classpath）
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub worker_kind: WorkerKind,
    #[serde(default)]
    pub account_kind: AccountKind,
    /// 独占进程（true）或挂在共享宿主进程组中（false）
    pub standalone: Option<bool>,
    /// 停止时是否走协作式退出而非强制终止
    pub post_quit_message: Option<bool>,
    pub description: Option<String>,
    /// JDK 根目录，仅 managed_runtime 使用
    pub runtime_directory: Option<String>,
    pub working_directory: Option<String>,
    pub arguments: Option<Vec<String>>,
    /// 额外的动态库搜索目录
    pub search_directories: Option<Vec<String>>,
    pub logger: Option<LoggerConfig>,
}

impl ServiceConfig {
    /// 最小配置，其余字段取默认。
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        worker_kind: WorkerKind,
        context: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            context: context.into(),
            worker_kind,
            account_kind: AccountKind::default(),
            standalone: None,
            post_quit_message: None,
            description: None,
            runtime_directory: None,
            working_directory: None,
            arguments: None,
            search_directories: None,
            logger: None,
        }
    }

    /// 读取、解析并校验 JSON 配置文件。
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            ServiceError::invalid_config(format!(
                "failed to read the configuration file {}: {e}",
                path.display()
            ))
        })?;
        let config: ServiceConfig = serde_json::from_slice(&data).map_err(|e| {
            ServiceError::invalid_config(format!(
                "failed to parse the configuration file {}: {e}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 与后端无关的字段校验；context 由各后端在构造时校验。
    pub fn validate(&self) -> Result<()> {
        let valid_name = !self.name.trim().is_empty()
            && !self.name.contains(['\\', '/'])
            && !self.name.chars().any(char::is_control);
        if !valid_name {
            return Err(ServiceError::invalid_config(format!(
                "invalid service name: {:?}",
                self.name
            )));
        }
        if self.display_name.trim().is_empty() {
            return Err(ServiceError::invalid_config(
                "the display name must be non-empty",
            ));
        }
        crate::logging::LoggerSettings::resolve(self)?;
        Ok(())
    }

    pub fn standalone(&self) -> bool {
        self.standalone.unwrap_or(true)
    }

    pub fn post_quit_message(&self) -> bool {
        self.post_quit_message.unwrap_or(false)
    }

    pub fn arguments(&self) -> &[String] {
        self.arguments.as_deref().unwrap_or_default()
    }

    /// 工作目录：未配置时为当前镜像所在目录。
    pub fn working_directory(&self) -> PathBuf {
        self.working_directory
            .as_ref()
            .map(PathBuf::from)
            .or_else(executing_directory)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// 动态库搜索目录：配置项在前，镜像目录追加在末尾。
    pub fn search_directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .search_directories
            .iter()
            .flatten()
            .map(PathBuf::from)
            .collect();
        if let Some(dir) = executing_directory() {
            dirs.push(dir);
        }
        dirs
    }
}

/// 当前镜像所在目录。
pub fn executing_directory() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn worker_kind_parses_case_insensitively() {
        assert_eq!(
            "Native_Module".parse::<WorkerKind>().unwrap(),
            WorkerKind::NativeModule
        );
        let err = "python".parse::<WorkerKind>().unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedKind(ref k) if k == "python"));
    }

    #[test]
    fn load_reads_camel_case_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(
            &path,
            r#"{
                "name": "demo",
                "displayName": "Demo Service",
                "context": "C:\\tool.exe",
                "workerKind": "executable",
                "accountKind": "network_service",
                "arguments": ["--flag"],
                "postQuitMessage": true
            }"#,
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.account_kind, AccountKind::NetworkService);
        assert_eq!(config.arguments(), ["--flag".to_string()]);
        assert!(config.post_quit_message());
        assert!(config.standalone());
        assert_eq!(config.description, None);
    }

    #[test]
    fn load_rejects_unknown_worker_kind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(
            &path,
            r#"{"name": "demo", "displayName": "Demo", "context": "x", "workerKind": "python"}"#,
        )
        .unwrap();

        let err = ServiceConfig::load(&path).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, ServiceError::InvalidConfig(_)));
        assert!(message.contains("unsupported worker kind"), "{message}");
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = ServiceConfig::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidConfig(_)));
    }

    #[test]
    fn validate_rejects_names_with_separators() {
        let config = ServiceConfig::new("a\\b", "A", WorkerKind::Executable, "x");
        assert!(matches!(
            config.validate(),
            Err(ServiceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn search_directories_keep_configured_order() {
        let mut config = ServiceConfig::new("demo", "Demo", WorkerKind::NativeModule, "x");
        config.search_directories = Some(vec!["first".into(), "second".into()]);
        let dirs = config.search_directories();
        assert_eq!(dirs[0], PathBuf::from("first"));
        assert_eq!(dirs[1], PathBuf::from("second"));
    }
}
