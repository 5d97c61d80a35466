use hostify_core::controller::SERVICE_SPECIFIC_EXIT_CODE;
use hostify_core::store::keys;
use hostify_core::{
    service_main, ConfigStore, ControlHandle, ControlHost, MemoryStore, Result, ServiceError,
    ServiceState, ServiceStatus, StatusReporter, StoreValue,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder(Mutex<Vec<ServiceStatus>>);

impl StatusReporter for Recorder {
    fn report(&self, status: &ServiceStatus) -> Result<()> {
        self.0.lock().unwrap().push(status.clone());
        Ok(())
    }
}

impl Recorder {
    fn reports(&self) -> Vec<(ServiceState, u32)> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.state, s.exit_code))
            .collect()
    }
}

struct Host(Arc<Recorder>);

impl ControlHost for Host {
    fn register(
        &self,
        _service_name: &str,
        _handle: ControlHandle,
    ) -> Result<Arc<dyn StatusReporter>> {
        Ok(self.0.clone())
    }
}

struct RejectingHost;

impl ControlHost for RejectingHost {
    fn register(
        &self,
        service_name: &str,
        _handle: ControlHandle,
    ) -> Result<Arc<dyn StatusReporter>> {
        Err(ServiceError::NotFound(service_name.to_string()))
    }
}

#[test]
fn missing_startup_config_ends_in_a_single_failed_stop() {
    let recorder = Arc::new(Recorder::default());
    let err = service_main("demo", &Host(recorder.clone()), &MemoryStore::new()).unwrap_err();

    assert!(err.is_not_found(), "{err}");
    assert_eq!(
        recorder.reports(),
        vec![(ServiceState::Stopped, SERVICE_SPECIFIC_EXIT_CODE)]
    );
    // 失败发生在读取配置之前，日志也必须已经可用
    assert!(tracing::dispatcher::has_been_set());
}

#[test]
fn corrupt_startup_config_ends_in_a_single_failed_stop() {
    let recorder = Arc::new(Recorder::default());
    let store = MemoryStore::new();
    store
        .set(
            &keys::service_param_key("demo"),
            keys::STARTUP_CONFIGURATION,
            StoreValue::String("not a blob".into()),
        )
        .unwrap();

    assert!(service_main("demo", &Host(recorder.clone()), &store).is_err());
    assert_eq!(
        recorder.reports(),
        vec![(ServiceState::Stopped, SERVICE_SPECIFIC_EXIT_CODE)]
    );
}

#[test]
fn registration_failure_is_returned_without_reports() {
    let err = service_main("demo", &RejectingHost, &MemoryStore::new()).unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)), "{err}");
}

#[cfg(unix)]
#[test]
fn installed_executable_runs_to_a_clean_stop() {
    use hostify_core::{LoggerConfig, ServiceConfig, WorkerKind};

    let workdir = tempfile::TempDir::new().unwrap();
    let mut config = ServiceConfig::new("demo", "Demo", WorkerKind::Executable, "/bin/sh");
    config.arguments = Some(vec!["-c".into(), "exit 0".into()]);
    config.working_directory = Some(workdir.path().to_string_lossy().into_owned());
    config.logger = Some(LoggerConfig {
        base_path: workdir.path().join("demo.log").to_string_lossy().into_owned(),
        max_size: None,
        max_files: None,
    });

    let store = MemoryStore::new();
    store
        .set(
            &keys::service_param_key("demo"),
            keys::STARTUP_CONFIGURATION,
            StoreValue::String(config.to_portable_blob().unwrap()),
        )
        .unwrap();

    let recorder = Arc::new(Recorder::default());
    service_main("demo", &Host(recorder.clone()), &store).unwrap();

    assert_eq!(
        recorder.reports(),
        vec![
            (ServiceState::StartPending, 0),
            (ServiceState::Running, 0),
            (ServiceState::Stopped, 0),
        ]
    );
    assert!(workdir.path().join("demo.log").exists());
}
