//! 可移植 blob：配置 JSON 的 base64 编码，自描述且无损。

use super::ServiceConfig;
use crate::error::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

impl ServiceConfig {
    /// 编码为可落盘的 blob。
    pub fn to_portable_blob(&self) -> Result<String> {
        let data = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(data))
    }

    /// 从 blob 还原配置；不做字段校验。
    pub fn from_portable_blob(data: &str) -> Result<Self> {
        let bytes = STANDARD.decode(data.trim())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountKind, LoggerConfig, WorkerKind};
    use crate::error::ServiceError;

    fn full_config() -> ServiceConfig {
        ServiceConfig {
            name: "demo".into(),
            display_name: "Demo Service".into(),
            context: "lib/app.jar".into(),
            worker_kind: WorkerKind::ManagedRuntime,
            account_kind: AccountKind::NetworkService,
            standalone: Some(false),
            post_quit_message: Some(true),
            description: Some("说明".into()),
            runtime_directory: Some("C:/jdk".into()),
            working_directory: Some("C:/work".into()),
            arguments: Some(vec!["--flag".into(), "with space".into()]),
            search_directories: Some(vec![]),
            logger: Some(LoggerConfig {
                base_path: "logs/demo.log".into(),
                max_size: None,
                max_files: Some(3),
            }),
        }
    }

    #[test]
    fn round_trip_keeps_every_field() {
        let config = full_config();
        let blob = config.to_portable_blob().unwrap();
        let decoded = ServiceConfig::from_portable_blob(&blob).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(decoded.to_portable_blob().unwrap(), blob);
    }

    #[test]
    fn round_trip_keeps_absent_fields_absent() {
        let config = ServiceConfig::new("demo", "Demo", WorkerKind::Executable, "tool.exe");
        let blob = config.to_portable_blob().unwrap();
        let decoded = ServiceConfig::from_portable_blob(&blob).unwrap();
        assert_eq!(decoded, config);
        assert!(decoded.arguments.is_none());
        assert!(decoded.logger.is_none());
    }

    #[test]
    fn garbage_blob_is_rejected() {
        let err = ServiceConfig::from_portable_blob("not base64 !!").unwrap_err();
        assert!(matches!(err, ServiceError::Encoding(_)));
    }
}
