//! Entry module loaded by the shared service host (`svchost.exe -k <group>`).
//!
//! 安装时在服务参数键下登记 `ServiceDll` 指向本库、`ServiceMain` 指向导出的同名函数。

#[cfg(windows)]
mod entry {
    use hostify_core::scm::ScmControlHost;
    use hostify_core::store::RegistryStore;
    use windows_service::service_dispatcher::parse_service_arguments;

    /// svchost 在自己的线程上调用，`argv[0]` 为服务名。
    ///
    /// # Safety
    /// `argv` 必须指向 `argc` 个以 NUL 结尾的 UTF-16 字符串，由宿主进程保证。
    #[no_mangle]
    pub unsafe extern "system" fn ServiceMain(argc: u32, argv: *mut *mut u16) {
        hostify_core::logging::init_tracing();
        let arguments = parse_service_arguments(argc, argv);
        let Some(name) = arguments.first().map(|n| n.to_string_lossy().into_owned()) else {
            tracing::error!("the shared host passed no service name");
            return;
        };
        let store = RegistryStore::new();
        // 失败已在 service_main 内记录并以 stopped 收尾
        let _ = hostify_core::service_main(&name, &ScmControlHost::share_process(), &store);
    }
}
