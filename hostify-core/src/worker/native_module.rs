//! 动态库后端：模块需导出
//!
//! ```c
//! void hostify_run(size_t argc, const char* argv[]);
//! void hostify_on_stop(void);
//! ```

use super::{require_file, StopLatch, Worker};
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use libloading::Library;
use std::ffi::{c_char, CString};
use tracing::info;

pub const RUN_SYMBOL: &str = "hostify_run";
pub const STOP_SYMBOL: &str = "hostify_on_stop";

type RunFn = unsafe extern "C" fn(usize, *const *const c_char);
type StopFn = unsafe extern "C" fn();

pub struct NativeModuleWorker {
    config: ServiceConfig,
    run: RunFn,
    stop: StopFn,
    latch: StopLatch,
    // 必须最后释放：run/stop 指向其中的代码
    _library: Library,
}

impl std::fmt::Debug for NativeModuleWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModuleWorker")
            .field("module", &self.config.context)
            .finish_non_exhaustive()
    }
}

impl NativeModuleWorker {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        require_file(&config, "module path")?;

        // SAFETY: 加载用户配置的模块，其初始化代码由模块作者负责。
        let library = unsafe { Library::new(&config.context) }.map_err(|e| {
            ServiceError::invalid_config(format!(
                "failed to load the module {}: {e}",
                config.context
            ))
        })?;
        let run = resolve::<RunFn>(&library, &config, RUN_SYMBOL)?;
        let stop = resolve::<StopFn>(&library, &config, STOP_SYMBOL)?;

        Ok(Self {
            config,
            run,
            stop,
            latch: StopLatch::default(),
            _library: library,
        })
    }
}

fn resolve<T: Copy>(library: &Library, config: &ServiceConfig, name: &str) -> Result<T> {
    let symbol = format!("{name}\0");
    // SAFETY: 签名由模块契约约定；拷贝出的函数指针与 Library 同生命周期持有。
    unsafe { library.get::<T>(symbol.as_bytes()) }
        .map(|s| *s)
        .map_err(|e| {
            ServiceError::invalid_config(format!(
                "failed to resolve '{name}' in {}: {e}",
                config.context
            ))
        })
}

impl Worker for NativeModuleWorker {
    fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn on_start(&mut self) -> Result<()> {
        self.latch.arm();
        Ok(())
    }

    fn on_stop(&self) -> Result<()> {
        if self.latch.fire() {
            info!(module = %self.config.context, "forwarding stop to the module");
            // SAFETY: 见 resolve。
            unsafe { (self.stop)() };
        }
        Ok(())
    }

    fn run(&self) -> Result<()> {
        let args = self
            .config
            .arguments()
            .iter()
            .map(|a| {
                CString::new(a.as_str()).map_err(|_| {
                    ServiceError::invalid_config(format!("argument contains a NUL byte: {a:?}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let argv: Vec<*const c_char> = args.iter().map(|a| a.as_ptr()).collect();

        info!(module = %self.config.context, argc = argv.len(), "entering the module");
        // SAFETY: argv 及其指向的字符串在调用期间有效。
        unsafe { (self.run)(argv.len(), argv.as_ptr()) };
        Ok(())
    }
}
