//! COM 组件后端：context 为 CLSID 或 ProgID，组件需实现 `IHostifyComponent`。
//!
//! ```idl
//! [uuid(7D1A4F52-93C8-4B6E-A0E4-5C2F8B91D3A7)]
//! interface IHostifyComponent : IUnknown {
//!     HRESULT Run([in] SAFEARRAY(BSTR) args);
//!     HRESULT OnStop();
//! };
//! ```

use super::{require_context, Worker};
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};

#[cfg(windows)]
pub(crate) fn build(config: ServiceConfig) -> Result<Box<dyn Worker>> {
    Ok(Box::new(ComponentWorker::new(config)?))
}

/// 校验 context 后拒绝：组件只能在 Windows 上实例化。
#[cfg(not(windows))]
pub(crate) fn build(config: ServiceConfig) -> Result<Box<dyn Worker>> {
    require_context(&config, "component CLSID")?;
    Err(ServiceError::Unsupported(format!(
        "component worker {} requires Windows",
        config.context
    )))
}

#[cfg(windows)]
pub struct ComponentWorker {
    config: ServiceConfig,
    latch: super::StopLatch,
    instance: Option<com::Instance>,
    clsid: windows_sys::core::GUID,
}

#[cfg(windows)]
impl std::fmt::Debug for ComponentWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentWorker")
            .field("clsid", &self.config.context)
            .finish_non_exhaustive()
    }
}

#[cfg(windows)]
impl ComponentWorker {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        require_context(&config, "component CLSID")?;
        let clsid = com::parse_clsid(&config.context)?;
        Ok(Self {
            config,
            latch: super::StopLatch::default(),
            instance: None,
            clsid,
        })
    }

    fn instance(&self) -> Result<&com::Instance> {
        self.instance.as_ref().ok_or_else(|| {
            ServiceError::Workload(format!("component {} was not started", self.config.context))
        })
    }
}

#[cfg(windows)]
impl Worker for ComponentWorker {
    fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn on_start(&mut self) -> Result<()> {
        com::initialize_thread();
        self.instance = Some(com::Instance::create(&self.clsid, &self.config.context)?);
        self.latch.arm();
        Ok(())
    }

    fn on_stop(&self) -> Result<()> {
        if !self.latch.fire() {
            return Ok(());
        }
        com::initialize_thread();
        self.instance()?.on_stop(&self.config.context)
    }

    fn run(&self) -> Result<()> {
        com::initialize_thread();
        self.instance()?
            .run(self.config.arguments(), &self.config.context)
    }
}

#[cfg(windows)]
mod com {
    use crate::error::{Result, ServiceError};
    use std::ffi::{c_void, OsStr};
    use std::os::windows::ffi::OsStrExt;
    use std::ptr;
    use windows_sys::core::{GUID, HRESULT};
    use windows_sys::Win32::Foundation::{SysAllocStringLen, SysFreeString};
    use windows_sys::Win32::System::Com::{
        CLSIDFromString, CoCreateInstance, CoInitializeEx, CLSCTX_INPROC_SERVER,
        COINIT_MULTITHREADED, SAFEARRAY,
    };
    use windows_sys::Win32::System::Ole::{
        SafeArrayCreateVector, SafeArrayDestroy, SafeArrayPutElement,
    };
    use windows_sys::Win32::System::Variant::VT_BSTR;

    const IID_IHOSTIFY_COMPONENT: GUID = GUID::from_u128(0x7d1a4f52_93c8_4b6e_a0e4_5c2f8b91d3a7);

    #[repr(C)]
    struct Vtbl {
        query_interface:
            unsafe extern "system" fn(*mut c_void, *const GUID, *mut *mut c_void) -> HRESULT,
        add_ref: unsafe extern "system" fn(*mut c_void) -> u32,
        release: unsafe extern "system" fn(*mut c_void) -> u32,
        run: unsafe extern "system" fn(*mut c_void, *mut SAFEARRAY) -> HRESULT,
        on_stop: unsafe extern "system" fn(*mut c_void) -> HRESULT,
    }

    #[repr(C)]
    struct Raw {
        vtbl: *const Vtbl,
    }

    /// 多线程套间中的组件实例。
    pub(super) struct Instance(*mut Raw);

    // SAFETY: 实例在 MTA 中创建，接口指针可跨线程使用。
    unsafe impl Send for Instance {}
    unsafe impl Sync for Instance {}

    fn wide(s: &str) -> Vec<u16> {
        OsStr::new(s).encode_wide().chain(Some(0)).collect()
    }

    fn check(hr: HRESULT, clsid: &str, message: &str) -> Result<()> {
        if hr >= 0 {
            Ok(())
        } else {
            Err(ServiceError::Workload(format!(
                "component {clsid}: {message}: {}",
                std::io::Error::from_raw_os_error(hr)
            )))
        }
    }

    /// 当前线程加入 MTA；重复调用或已处于其他套间时忽略。
    pub(super) fn initialize_thread() {
        // SAFETY: 无前置条件。
        let _ = unsafe { CoInitializeEx(ptr::null(), COINIT_MULTITHREADED) };
    }

    pub(super) fn parse_clsid(text: &str) -> Result<GUID> {
        let mut clsid = GUID::from_u128(0);
        let text_w = wide(text.trim());
        // SAFETY: 输入为 NUL 结尾的 UTF-16 串。
        let hr = unsafe { CLSIDFromString(text_w.as_ptr(), &mut clsid) };
        if hr < 0 {
            return Err(ServiceError::invalid_config(format!(
                "{text} is neither a CLSID nor a registered ProgID"
            )));
        }
        Ok(clsid)
    }

    impl Instance {
        pub(super) fn create(clsid: &GUID, name: &str) -> Result<Self> {
            let mut raw: *mut c_void = ptr::null_mut();
            // SAFETY: 输出指针在成功时指向 IHostifyComponent。
            let hr = unsafe {
                CoCreateInstance(
                    clsid,
                    ptr::null_mut(),
                    CLSCTX_INPROC_SERVER,
                    &IID_IHOSTIFY_COMPONENT,
                    &mut raw,
                )
            };
            check(hr, name, "failed to create an instance")?;
            Ok(Self(raw.cast()))
        }

        pub(super) fn run(&self, args: &[String], name: &str) -> Result<()> {
            let array = BstrArray::new(args, name)?;
            // SAFETY: self.0 在 Drop 前始终有效。
            let hr = unsafe { ((*(*self.0).vtbl).run)(self.0.cast(), array.0) };
            check(hr, name, "an error occurred inside the component while running")
        }

        pub(super) fn on_stop(&self, name: &str) -> Result<()> {
            // SAFETY: 同上。
            let hr = unsafe { ((*(*self.0).vtbl).on_stop)(self.0.cast()) };
            check(hr, name, "an error occurred inside the component while stopping")
        }
    }

    impl Drop for Instance {
        fn drop(&mut self) {
            // SAFETY: 释放 CoCreateInstance 返回的引用。
            unsafe { ((*(*self.0).vtbl).release)(self.0.cast()) };
        }
    }

    /// 一维 BSTR SAFEARRAY，Drop 时销毁。
    struct BstrArray(*mut SAFEARRAY);

    impl BstrArray {
        fn new(args: &[String], name: &str) -> Result<Self> {
            // SAFETY: 元素类型与数量合法。
            let array = unsafe { SafeArrayCreateVector(VT_BSTR, 0, args.len() as u32) };
            if array.is_null() {
                return Err(ServiceError::Workload(format!(
                    "component {name}: failed to allocate the argument array"
                )));
            }
            let array = Self(array);
            for (index, arg) in args.iter().enumerate() {
                let units: Vec<u16> = OsStr::new(arg).encode_wide().collect();
                let index = index as i32;
                // SAFETY: SafeArrayPutElement 复制 BSTR，之后释放本地副本。
                let hr = unsafe {
                    let bstr = SysAllocStringLen(units.as_ptr(), units.len() as u32);
                    let hr = SafeArrayPutElement(array.0, &index, bstr as *const c_void);
                    SysFreeString(bstr);
                    hr
                };
                check(hr, name, "failed to fill the argument array")?;
            }
            Ok(array)
        }
    }

    impl Drop for BstrArray {
        fn drop(&mut self) {
            // SAFETY: 由 SafeArrayCreateVector 创建。
            unsafe { SafeArrayDestroy(self.0) };
        }
    }
}
