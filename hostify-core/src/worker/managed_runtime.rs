//! JVM 托管运行时后端：context 为 class path，宿主类需提供
//!
//! ```java
//! package io.hostify;
//! public final class Hostify {
//!     public static void run(String[] args) { ... }
//!     public static void onStop() { ... }
//! }
//! ```
//!
//! 同一进程内 JVM 只能创建一次，共享宿主进程中的多个服务复用同一个 VM。

use super::{require_context, StopLatch, Worker};
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use jni::objects::{JObject, JString, JValue};
use jni::sys::{jint, JavaVMInitArgs, JavaVMOption, JNI_FALSE, JNI_OK, JNI_VERSION_1_8};
use jni::{JNIEnv, JavaVM};
use libloading::Library;
use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub const HOST_CLASS: &str = "io/hostify/Hostify";
const RUN_SIGNATURE: &str = "([Ljava/lang/String;)V";
const STOP_SIGNATURE: &str = "()V";

#[cfg(windows)]
const JVM_LIBRARY_CANDIDATES: &[&str] = &["bin/server/jvm.dll", "jre/bin/server/jvm.dll"];
#[cfg(target_os = "macos")]
const JVM_LIBRARY_CANDIDATES: &[&str] = &["lib/server/libjvm.dylib", "jre/lib/server/libjvm.dylib"];
#[cfg(all(not(windows), not(target_os = "macos")))]
const JVM_LIBRARY_CANDIDATES: &[&str] = &["lib/server/libjvm.so", "jre/lib/server/libjvm.so"];

type CreateJavaVm =
    unsafe extern "system" fn(*mut *mut jni::sys::JavaVM, *mut *mut c_void, *mut c_void) -> jint;

/// 进程级 VM，附带加载它的动态库（后释放）。
struct ManagedRuntime {
    vm: JavaVM,
    class_path: String,
    _library: Library,
}

static RUNTIME: Mutex<Option<Arc<ManagedRuntime>>> = Mutex::new(None);

pub struct ManagedRuntimeWorker {
    config: ServiceConfig,
    library_path: PathBuf,
    runtime: Option<Arc<ManagedRuntime>>,
    latch: StopLatch,
}

impl std::fmt::Debug for ManagedRuntimeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedRuntimeWorker")
            .field("class_path", &self.config.context)
            .field("library_path", &self.library_path)
            .field("started", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl ManagedRuntimeWorker {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        require_context(&config, "class path")?;
        let home = config.runtime_directory.as_deref().ok_or_else(|| {
            ServiceError::invalid_config(format!(
                "service {} needs runtimeDirectory pointing at a JDK",
                config.name
            ))
        })?;
        let library_path = locate_jvm_library(Path::new(home))?;
        Ok(Self {
            config,
            library_path,
            runtime: None,
            latch: StopLatch::default(),
        })
    }

    fn runtime(&self) -> Result<&ManagedRuntime> {
        self.runtime.as_deref().ok_or_else(|| {
            ServiceError::Workload(format!(
                "managed runtime for {} was not started",
                self.config.name
            ))
        })
    }
}

/// 在 JDK 目录下查找 JVM 动态库。
fn locate_jvm_library(home: &Path) -> Result<PathBuf> {
    if !home.is_dir() {
        return Err(ServiceError::invalid_config(format!(
            "runtime directory {} must be an existing directory",
            home.display()
        )));
    }
    JVM_LIBRARY_CANDIDATES
        .iter()
        .map(|relative| home.join(relative))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            ServiceError::invalid_config(format!(
                "no JVM library found under {}",
                home.display()
            ))
        })
}

fn acquire_runtime(library_path: &Path, class_path: &str) -> Result<Arc<ManagedRuntime>> {
    let mut slot = RUNTIME
        .lock()
        .map_err(|_| ServiceError::Other("managed runtime slot poisoned".into()))?;
    if let Some(existing) = slot.as_ref() {
        if existing.class_path != class_path {
            warn!(
                requested = class_path,
                active = %existing.class_path,
                "JVM already running with a different class path; reusing it"
            );
        }
        return Ok(existing.clone());
    }

    let runtime = Arc::new(create_runtime(library_path, class_path)?);
    *slot = Some(runtime.clone());
    Ok(runtime)
}

fn create_runtime(library_path: &Path, class_path: &str) -> Result<ManagedRuntime> {
    let startup = |message: String| ServiceError::Workload(format!("JVM startup failed: {message}"));

    // SAFETY: 加载 JDK 自带的 JVM 库。
    let library = unsafe { Library::new(library_path) }
        .map_err(|e| startup(format!("{}: {e}", library_path.display())))?;
    // SAFETY: JNI_CreateJavaVM 的签名由 JNI 规范固定。
    let create: CreateJavaVm = unsafe { library.get::<CreateJavaVm>(b"JNI_CreateJavaVM\0") }
        .map(|s| *s)
        .map_err(|e| startup(e.to_string()))?;

    let options = [format!("-Djava.class.path={class_path}"), "-Xrs".to_string()]
        .into_iter()
        .map(|o| CString::new(o).map_err(|_| startup("class path contains a NUL byte".into())))
        .collect::<Result<Vec<_>>>()?;
    let mut raw_options: Vec<JavaVMOption> = options
        .iter()
        .map(|o| JavaVMOption {
            optionString: o.as_ptr() as *mut _,
            extraInfo: std::ptr::null_mut(),
        })
        .collect();
    let mut args = JavaVMInitArgs {
        version: JNI_VERSION_1_8,
        nOptions: raw_options.len() as jint,
        options: raw_options.as_mut_ptr(),
        ignoreUnrecognized: JNI_FALSE,
    };

    let mut vm: *mut jni::sys::JavaVM = std::ptr::null_mut();
    let mut env: *mut c_void = std::ptr::null_mut();
    // SAFETY: 参数在调用期间有效；成功时 vm 指向新建的 VM。
    let code = unsafe { create(&mut vm, &mut env, &mut args as *mut _ as *mut c_void) };
    if code != JNI_OK || vm.is_null() {
        return Err(startup(format!("JNI_CreateJavaVM returned {code}")));
    }
    // SAFETY: vm 非空且由 JNI_CreateJavaVM 返回。
    let vm = unsafe { JavaVM::from_raw(vm) }.map_err(|e| startup(e.to_string()))?;

    info!(library = %library_path.display(), class_path, "JVM created");
    Ok(ManagedRuntime {
        vm,
        class_path: class_path.to_string(),
        _library: library,
    })
}

/// 把 JNI 错误转换为负载错误；Java 异常会被清除并带上其 `toString()`。
fn java_error(env: &mut JNIEnv, err: jni::errors::Error, action: &str) -> ServiceError {
    if !matches!(err, jni::errors::Error::JavaException) {
        return ServiceError::Workload(format!("{action}: {err}"));
    }
    let text = describe_exception(env).unwrap_or_else(|| "unknown Java exception".into());
    ServiceError::Workload(format!("{action}: {text}"))
}

fn describe_exception(env: &mut JNIEnv) -> Option<String> {
    let throwable = env.exception_occurred().ok()?;
    env.exception_clear().ok()?;
    if throwable.is_null() {
        return None;
    }
    let text = env
        .call_method(&throwable, "toString", "()Ljava/lang/String;", &[])
        .and_then(|v| v.l())
        .ok()?;
    let text = JString::from(text);
    let text = env.get_string(&text).ok()?;
    Some(text.into())
}

fn check_host_class(env: &mut JNIEnv) -> jni::errors::Result<()> {
    let class = env.find_class(HOST_CLASS)?;
    env.get_static_method_id(&class, "run", RUN_SIGNATURE)?;
    env.get_static_method_id(&class, "onStop", STOP_SIGNATURE)?;
    Ok(())
}

fn invoke_run(env: &mut JNIEnv, args: &[String]) -> jni::errors::Result<()> {
    let array = env.new_object_array(args.len() as jint, "java/lang/String", JObject::null())?;
    for (index, arg) in args.iter().enumerate() {
        let value = env.new_string(arg)?;
        env.set_object_array_element(&array, index as jint, &value)?;
        env.delete_local_ref(value)?;
    }
    env.call_static_method(HOST_CLASS, "run", RUN_SIGNATURE, &[JValue::Object(array.as_ref())])?;
    Ok(())
}

impl Worker for ManagedRuntimeWorker {
    fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn on_start(&mut self) -> Result<()> {
        let runtime = acquire_runtime(&self.library_path, &self.config.context)?;
        {
            let mut env = runtime
                .vm
                .attach_current_thread()
                .map_err(|e| ServiceError::Workload(format!("failed to attach to the JVM: {e}")))?;
            if let Err(e) = check_host_class(&mut env) {
                return Err(java_error(
                    &mut env,
                    e,
                    &format!("{HOST_CLASS} is missing or incomplete"),
                ));
            }
        }
        self.runtime = Some(runtime);
        self.latch.arm();
        Ok(())
    }

    fn on_stop(&self) -> Result<()> {
        if !self.latch.fire() {
            return Ok(());
        }
        let runtime = self.runtime()?;
        let mut env = runtime
            .vm
            .attach_current_thread()
            .map_err(|e| ServiceError::Workload(format!("failed to attach to the JVM: {e}")))?;
        info!(service = %self.config.name, "forwarding stop to {HOST_CLASS}");
        match env.call_static_method(HOST_CLASS, "onStop", STOP_SIGNATURE, &[]) {
            Ok(_) => Ok(()),
            Err(e) => Err(java_error(&mut env, e, "onStop failed")),
        }
    }

    fn run(&self) -> Result<()> {
        let runtime = self.runtime()?;
        let mut env = runtime
            .vm
            .attach_current_thread()
            .map_err(|e| ServiceError::Workload(format!("failed to attach to the JVM: {e}")))?;
        match invoke_run(&mut env, self.config.arguments()) {
            Ok(()) => Ok(()),
            Err(e) => Err(java_error(&mut env, e, "run failed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerKind;

    fn config(runtime_directory: Option<String>) -> ServiceConfig {
        let mut config =
            ServiceConfig::new("demo", "Demo", WorkerKind::ManagedRuntime, "app.jar");
        config.runtime_directory = runtime_directory;
        config
    }

    #[test]
    fn runtime_directory_is_required() {
        let err = ManagedRuntimeWorker::new(config(None)).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidConfig(_)));
    }

    #[test]
    fn runtime_directory_without_jvm_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ManagedRuntimeWorker::new(config(Some(
            dir.path().to_string_lossy().into_owned(),
        )))
        .unwrap_err();
        assert!(err.to_string().contains("no JVM library"), "{err}");
    }

    #[test]
    fn jvm_library_is_located_under_the_home() {
        let dir = tempfile::tempdir().unwrap();
        let relative = JVM_LIBRARY_CANDIDATES[0];
        let library = dir.path().join(relative);
        std::fs::create_dir_all(library.parent().unwrap()).unwrap();
        std::fs::write(&library, b"").unwrap();

        let worker =
            ManagedRuntimeWorker::new(config(Some(dir.path().to_string_lossy().into_owned())))
                .unwrap();
        assert_eq!(worker.library_path, library);
        // 未启动时 stop 为空操作
        worker.on_stop().unwrap();
    }
}
