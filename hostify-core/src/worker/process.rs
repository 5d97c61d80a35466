//! 进程底层操作：强制终止进程树、协作式退出请求。

use crate::error::{Result, ServiceError};
use sysinfo::{Pid, System};

/// 杀死进程树；失败返回 false。
///
/// - Windows: 使用 taskkill /F /T 强制杀死进程树
/// - 其他平台: 先收集子进程，再从叶子节点向上逐一 kill
pub(crate) fn kill_process_tree(pid: u32) -> bool {
    if kill_process_tree_native(pid) {
        return true;
    }
    kill_process_tree_fallback(pid)
}

#[cfg(windows)]
fn kill_process_tree_native(pid: u32) -> bool {
    std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(not(windows))]
fn kill_process_tree_native(_pid: u32) -> bool {
    // 不按进程组杀，交给 fallback 逐个处理，避免误伤同组的外部进程
    false
}

fn kill_process_tree_fallback(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();

    let mut tree = Vec::new();
    collect_process_tree(&sys, Pid::from(pid as usize), &mut tree);
    if tree.is_empty() {
        // 进程已不存在，视为成功
        return true;
    }

    // 叶子优先
    tree.reverse();
    tree.into_iter()
        .filter_map(|p| sys.process(p))
        .fold(true, |all, process| process.kill() && all)
}

fn collect_process_tree(sys: &System, pid: Pid, result: &mut Vec<Pid>) {
    if sys.process(pid).is_some() {
        result.push(pid);
    }
    for (child_pid, process) in sys.processes() {
        if process.parent() == Some(pid) {
            collect_process_tree(sys, *child_pid, result);
        }
    }
}

/// 协作式退出请求的投递目标。
///
/// Windows 上投递的是主线程的 `WM_QUIT`，需要在进程启动后立即记下主线程 id。
#[derive(Debug, Clone, Copy)]
pub(crate) struct QuitTarget {
    pid: u32,
    #[cfg(windows)]
    main_thread: Option<u32>,
}

impl QuitTarget {
    #[cfg(windows)]
    pub(crate) fn capture(pid: u32) -> Self {
        Self {
            pid,
            main_thread: main_thread_id(pid),
        }
    }

    #[cfg(not(windows))]
    pub(crate) fn capture(pid: u32) -> Self {
        Self { pid }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }
}

/// 线程快照中属于该进程的第一个线程，即主线程。
#[cfg(windows)]
fn main_thread_id(pid: u32) -> Option<u32> {
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
    };

    // SAFETY: 快照句柄在返回前关闭；THREADENTRY32 按要求预置 dwSize。
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0);
        if snapshot == INVALID_HANDLE_VALUE {
            return None;
        }
        let mut entry: THREADENTRY32 = std::mem::zeroed();
        entry.dwSize = std::mem::size_of::<THREADENTRY32>() as u32;

        let mut found = None;
        let mut more = Thread32First(snapshot, &mut entry) != 0;
        while more {
            if entry.th32OwnerProcessID == pid {
                found = Some(entry.th32ThreadID);
                break;
            }
            more = Thread32Next(snapshot, &mut entry) != 0;
        }
        CloseHandle(snapshot);
        found
    }
}

/// 向主线程投递 `WM_QUIT`，投递失败时退回到强制终止进程树。
#[cfg(windows)]
pub(crate) fn request_quit(target: QuitTarget) -> Result<()> {
    use windows_sys::Win32::UI::WindowsAndMessaging::{PostThreadMessageW, WM_QUIT};

    let pid = target.pid;
    let posted = match target.main_thread {
        // SAFETY: 只投递消息，不涉及内存。
        Some(thread) => match unsafe { PostThreadMessageW(thread, WM_QUIT, 0, 0) } {
            0 => Err(std::io::Error::last_os_error().to_string()),
            _ => Ok(()),
        },
        None => Err("the main thread is unknown".to_string()),
    };
    match posted {
        Ok(()) => Ok(()),
        Err(reason) => {
            tracing::warn!(pid, "failed to post WM_QUIT ({reason}); terminating the process tree");
            if kill_process_tree(pid) {
                Ok(())
            } else {
                Err(ServiceError::Workload(format!(
                    "failed to terminate process {pid}"
                )))
            }
        }
    }
}

/// 发送 SIGTERM，由进程自行退出。
#[cfg(not(windows))]
pub(crate) fn request_quit(target: QuitTarget) -> Result<()> {
    let mut sys = System::new();
    let pid = Pid::from(target.pid as usize);
    if !sys.refresh_process(pid) {
        return Ok(());
    }
    match sys
        .process(pid)
        .and_then(|p| p.kill_with(sysinfo::Signal::Term))
    {
        Some(true) | None => Ok(()),
        Some(false) => Err(ServiceError::Workload(format!(
            "failed to deliver the quit signal to process {pid}"
        ))),
    }
}

#[cfg(all(test, windows))]
mod tests {
    use super::*;
    use std::os::windows::process::CommandExt;
    use std::process::{Command, Stdio};

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    #[test]
    fn main_thread_is_captured_and_quit_ends_a_windowless_child() {
        let mut child = Command::new("ping")
            .args(["-n", "30", "127.0.0.1"])
            .stdout(Stdio::null())
            .creation_flags(CREATE_NO_WINDOW)
            .spawn()
            .unwrap();
        let target = QuitTarget::capture(child.id());
        assert!(target.main_thread.is_some());

        request_quit(target).unwrap();
        let begin = std::time::Instant::now();
        child.wait().unwrap();
        assert!(begin.elapsed() < std::time::Duration::from_secs(10));
    }
}
