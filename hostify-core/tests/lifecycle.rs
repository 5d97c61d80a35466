use hostify_core::store::keys;
use hostify_core::{
    setup, ConfigStore, HostLayout, LifecycleManager, MemoryStore, Result, ServiceConfig,
    ServiceError, ServiceKind, ServiceRegistrar, ServiceRegistration, SetupAction, StoreValue,
    WorkerKind,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::{NamedTempFile, TempDir};

/// 内存中的服务管理器，记录每次 stop 请求。
#[derive(Default)]
struct FakeScm {
    services: Mutex<BTreeMap<String, (ServiceRegistration, bool)>>,
    stop_requests: Mutex<Vec<String>>,
}

impl FakeScm {
    fn start(&self, name: &str) {
        if let Some(entry) = self.services.lock().unwrap().get_mut(name) {
            entry.1 = true;
        }
    }

    fn registration(&self, name: &str) -> Option<ServiceRegistration> {
        self.services
            .lock()
            .unwrap()
            .get(name)
            .map(|(registration, _)| registration.clone())
    }
}

impl ServiceRegistrar for FakeScm {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.services.lock().unwrap().contains_key(name))
    }

    fn create(&self, registration: &ServiceRegistration) -> Result<()> {
        let mut services = self.services.lock().unwrap();
        if services.contains_key(&registration.name) {
            return Err(ServiceError::AlreadyExists(registration.name.clone()));
        }
        services.insert(registration.name.clone(), (registration.clone(), false));
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.stop_requests.lock().unwrap().push(name.to_string());
        let mut services = self.services.lock().unwrap();
        match services.get_mut(name) {
            None => Err(ServiceError::NotFound(name.to_string())),
            Some((_, running)) if *running => {
                *running = false;
                Ok(())
            }
            Some(_) => Err(ServiceError::NotActive(name.to_string())),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.services
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }
}

fn layout() -> HostLayout {
    HostLayout {
        image_path: PathBuf::from(r"C:\Hostify\hostify.exe"),
        shared_host_path: PathBuf::from(r"C:\Windows\System32\svchost.exe"),
        shared_library_path: PathBuf::from(r"C:\Hostify\hostify_svchost.dll"),
    }
}

fn config(name: &str, program: &NamedTempFile, standalone: bool) -> ServiceConfig {
    let mut config = ServiceConfig::new(
        name,
        format!("{name} service"),
        WorkerKind::Executable,
        program.path().to_string_lossy().into_owned(),
    );
    config.arguments = Some(vec!["--flag".into()]);
    config.standalone = Some(standalone);
    config
}

#[test]
fn install_then_uninstall_toggles_installed() {
    let program = NamedTempFile::new().unwrap();
    let scm = FakeScm::default();
    let store = MemoryStore::new();
    let manager = LifecycleManager::new(config("demo", &program, true), &scm, &store, layout());

    assert!(!manager.installed());
    manager.install().unwrap();
    assert!(manager.installed());

    let registration = scm.registration("demo").unwrap();
    assert_eq!(registration.kind, ServiceKind::OwnProcess);
    assert_eq!(registration.launch.arguments, vec!["--service".to_string()]);

    // 启动配置可原样还原
    let blob = store
        .get_string(&keys::service_param_key("demo"), keys::STARTUP_CONFIGURATION)
        .unwrap();
    assert_eq!(
        ServiceConfig::from_portable_blob(&blob).unwrap(),
        *manager.config()
    );

    scm.start("demo");
    manager.uninstall().unwrap();
    assert!(!manager.installed());
    assert!(!store.contains_path(&keys::service_param_key("demo")));
    assert_eq!(*scm.stop_requests.lock().unwrap(), vec!["demo".to_string()]);
}

#[test]
fn uninstall_of_a_stopped_service_tolerates_not_active() {
    let program = NamedTempFile::new().unwrap();
    let scm = FakeScm::default();
    let manager =
        LifecycleManager::new(config("demo", &program, true), &scm, MemoryStore::new(), layout());
    manager.install().unwrap();
    manager.uninstall().unwrap();
    assert!(!manager.installed());
}

#[test]
fn uninstall_of_a_missing_service_is_not_found() {
    let program = NamedTempFile::new().unwrap();
    let manager = LifecycleManager::new(
        config("demo", &program, true),
        FakeScm::default(),
        MemoryStore::new(),
        layout(),
    );
    assert!(matches!(manager.uninstall(), Err(ServiceError::NotFound(_))));
}

#[test]
fn shared_install_registers_group_entries() {
    let program = NamedTempFile::new().unwrap();
    let scm = FakeScm::default();
    let store = MemoryStore::new();
    let manager = LifecycleManager::new(config("demo", &program, false), &scm, &store, layout());
    manager.install().unwrap();

    let group = keys::group_name("demo");
    let registration = scm.registration("demo").unwrap();
    assert_eq!(registration.kind, ServiceKind::ShareProcess);
    assert_eq!(registration.launch.program, layout().shared_host_path);
    assert_eq!(registration.launch.arguments, vec!["-k".to_string(), group.clone()]);

    assert_eq!(
        store.get(keys::SVCHOST_KEY, &group).unwrap(),
        StoreValue::MultiString(vec!["demo".into()])
    );
    assert_eq!(
        store
            .get(&keys::group_key("demo"), keys::CO_INITIALIZE_SECURITY_PARAM)
            .unwrap(),
        StoreValue::U32(1)
    );
    let param_key = keys::service_param_key("demo");
    assert_eq!(
        store.get_string(&param_key, keys::SERVICE_DLL).unwrap(),
        layout().shared_library_path.display().to_string()
    );
    assert_eq!(
        store.get(&param_key, keys::SERVICE_DLL_UNLOAD_ON_STOP).unwrap(),
        StoreValue::U32(1)
    );
    assert_eq!(
        store.get_string(&param_key, keys::SERVICE_MAIN).unwrap(),
        keys::SERVICE_MAIN_EXPORT
    );

    manager.uninstall().unwrap();
    assert!(store.get(keys::SVCHOST_KEY, &group).unwrap_err().is_not_found());
    assert!(!store.contains_path(&keys::group_key("demo")));
}

#[test]
fn shared_services_get_distinct_groups() {
    let program = NamedTempFile::new().unwrap();
    let scm = FakeScm::default();
    let store = MemoryStore::new();
    for name in ["alpha", "beta"] {
        LifecycleManager::new(config(name, &program, false), &scm, &store, layout())
            .install()
            .unwrap();
    }

    let alpha = scm.registration("alpha").unwrap().launch;
    let beta = scm.registration("beta").unwrap().launch;
    assert_ne!(alpha.arguments[1], beta.arguments[1]);
    assert!(store.get(keys::SVCHOST_KEY, &keys::group_name("alpha")).is_ok());
    assert!(store.get(keys::SVCHOST_KEY, &keys::group_name("beta")).is_ok());
}

#[test]
fn setup_installs_and_uninstalls_from_a_config_file() {
    let program = NamedTempFile::new().unwrap();
    let workdir = TempDir::new().unwrap();
    let mut config = config("demo", &program, true);
    config.working_directory = Some(workdir.path().to_string_lossy().into_owned());
    let file = workdir.path().join("demo.json");
    std::fs::write(&file, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

    let scm = FakeScm::default();
    let store = MemoryStore::new();
    setup(SetupAction::Install, &file, &scm, &store, layout()).unwrap();
    assert!(scm.exists("demo").unwrap());
    assert!(matches!(
        setup(SetupAction::Install, &file, &scm, &store, layout()),
        Err(ServiceError::AlreadyExists(_))
    ));

    setup(SetupAction::Uninstall, &file, &scm, &store, layout()).unwrap();
    assert!(!scm.exists("demo").unwrap());
    assert!(matches!(
        setup(SetupAction::Uninstall, &file, &scm, &store, layout()),
        Err(ServiceError::NotFound(_))
    ));
}
