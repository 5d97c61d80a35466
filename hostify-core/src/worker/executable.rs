//! 可执行文件后端：启动子进程并等待其退出。
//!
//! 子进程在被回收前一直留在锁内，停止请求与回收互斥，因此按 pid 发出的信号不会落到被复用的 pid 上。

use super::process::{kill_process_tree, request_quit, QuitTarget};
use super::{require_file, StopLatch, Worker};
use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `run` 轮询子进程退出的间隔。
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct ExecutableWorker {
    config: ServiceConfig,
    child: Mutex<Option<Child>>,
    target: Option<QuitTarget>,
    latch: StopLatch,
}

impl ExecutableWorker {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        require_file(&config, "executable path")?;
        Ok(Self {
            config,
            child: Mutex::new(None),
            target: None,
            latch: StopLatch::default(),
        })
    }

    /// 已启动子进程的 pid。
    pub fn pid(&self) -> Option<u32> {
        self.target.map(|t| t.pid())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.context);
        cmd.args(self.config.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = self.config.working_directory.as_ref() {
            cmd.current_dir(dir);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }

    fn child(&self) -> Result<MutexGuard<'_, Option<Child>>> {
        self.child
            .lock()
            .map_err(|_| ServiceError::Other("child handle poisoned".into()))
    }
}

impl Worker for ExecutableWorker {
    fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn on_start(&mut self) -> Result<()> {
        let mut child = self.command().spawn().map_err(|e| {
            ServiceError::SpawnFailed(format!("{}: {e}", self.config.context))
        })?;
        let pid = child.id();
        self.target = Some(QuitTarget::capture(pid));

        if let Some(stdout) = child.stdout.take() {
            spawn_output_forwarder(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_forwarder(stderr, "stderr");
        }

        info!(pid, program = %self.config.context, "process started");
        *self
            .child
            .get_mut()
            .map_err(|_| ServiceError::Other("child handle poisoned".into()))? = Some(child);
        self.latch.arm();
        Ok(())
    }

    fn on_stop(&self) -> Result<()> {
        if !self.latch.fire() {
            return Ok(());
        }
        let Some(target) = self.target else {
            return Ok(());
        };
        let pid = target.pid();

        // 持锁直到信号发出：此期间 run 无法回收子进程
        let mut guard = self.child()?;
        let Some(child) = guard.as_mut() else {
            debug!(pid, "process already reaped; nothing to stop");
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            debug!(pid, "process already exited; nothing to stop");
            return Ok(());
        }

        if self.config.post_quit_message() {
            info!(pid, "requesting the process to quit");
            return request_quit(target);
        }

        info!(pid, "terminating the process tree");
        if kill_process_tree(pid) {
            return Ok(());
        }
        warn!(pid, "failed to terminate the process tree; killing the process itself");
        child.kill().map_err(|e| {
            ServiceError::Workload(format!("failed to terminate process {pid}: {e}"))
        })
    }

    fn run(&self) -> Result<()> {
        let (pid, status) = loop {
            {
                let mut guard = self.child()?;
                // 从未启动或已经 run 过
                let Some(child) = guard.as_mut() else {
                    return Ok(());
                };
                if let Some(status) = child.try_wait()? {
                    let pid = child.id();
                    guard.take();
                    break (pid, status);
                }
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        };
        info!(pid, %status, "process exited");

        if status.success() || self.latch.fired() {
            Ok(())
        } else {
            Err(ServiceError::Workload(format!(
                "process {} exited with {status}",
                self.config.context
            )))
        }
    }
}

/// 逐行转发子进程输出到日志。
fn spawn_output_forwarder<R: Read + Send + 'static>(reader: R, stream: &'static str) {
    let spawned = std::thread::Builder::new()
        .name(format!("workload-{stream}"))
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                match line {
                    Ok(line) => info!(target: "workload", stream, "{line}"),
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        warn!("failed to spawn the {stream} forwarder: {e}");
    }
}
