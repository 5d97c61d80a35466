use anyhow::Context;
use clap::{ArgGroup, Parser};
use hostify_core::SetupAction;
use std::path::PathBuf;

/// Install, uninstall, or host a workload as an OS service.
#[derive(Debug, Parser)]
#[command(name = "hostify", author, version, about = "Generic OS service host")]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["install", "uninstall", "service"])
))]
struct Cli {
    /// 安装服务
    #[arg(short = 'i', long)]
    install: bool,

    /// 卸载服务
    #[arg(short = 'u', long)]
    uninstall: bool,

    /// 服务配置文件（JSON）
    #[arg(
        short = 'c',
        long = "config_file",
        env = "HOSTIFY_CONFIG_FILE",
        value_parser = existing_file,
        required_unless_present = "service"
    )]
    config_file: Option<PathBuf>,

    /// 由服务管理器启动时使用
    #[arg(long, hide = true)]
    service: bool,
}

impl Cli {
    fn action(&self) -> Option<SetupAction> {
        if self.install {
            Some(SetupAction::Install)
        } else if self.uninstall {
            Some(SetupAction::Uninstall)
        } else {
            None
        }
    }
}

/// 配置文件必须是已存在的普通文件。
fn existing_file(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("{value} is not a regular file"))
    }
}

fn main() -> anyhow::Result<()> {
    // 加载 .env 文件（如果存在），忽略错误
    let _ = dotenvy::dotenv();
    hostify_core::logging::init_tracing();
    let cli = Cli::parse();

    if cli.service {
        return dispatch();
    }

    let action = cli.action().context("no action requested")?;
    let config_file = cli
        .config_file
        .as_deref()
        .context("--config_file is required")?;
    run_setup(action, config_file)
        .with_context(|| format!("failed to {action:?} from {}", config_file.display()))
}

#[cfg(windows)]
fn run_setup(action: SetupAction, config_file: &std::path::Path) -> anyhow::Result<()> {
    use hostify_core::scm::{host_layout, ScmRegistrar};
    use hostify_core::store::RegistryStore;

    let layout = host_layout()?;
    hostify_core::setup(action, config_file, ScmRegistrar, RegistryStore::new(), layout)?;
    Ok(())
}

#[cfg(not(windows))]
fn run_setup(_action: SetupAction, _config_file: &std::path::Path) -> anyhow::Result<()> {
    anyhow::bail!("installing services is only supported on Windows")
}

#[cfg(windows)]
fn dispatch() -> anyhow::Result<()> {
    service::dispatch().context("failed to connect to the service manager")
}

#[cfg(not(windows))]
fn dispatch() -> anyhow::Result<()> {
    anyhow::bail!("service mode is only supported on Windows")
}

#[cfg(windows)]
mod service {
    use hostify_core::scm::ScmControlHost;
    use hostify_core::store::RegistryStore;
    use std::ffi::OsString;
    use windows_service::{define_windows_service, service_dispatcher};

    define_windows_service!(ffi_service_main, service_main);

    pub fn dispatch() -> windows_service::Result<()> {
        // 独立进程类型的服务名由 SCM 通过参数传入，此处的名字会被忽略
        service_dispatcher::start("", ffi_service_main)
    }

    fn service_main(arguments: Vec<OsString>) {
        let Some(name) = arguments.first().map(|n| n.to_string_lossy().into_owned()) else {
            tracing::error!("the service manager passed no service name");
            return;
        };
        let store = RegistryStore::new();
        // 失败已在 service_main 内记录并以 stopped 收尾
        let _ = hostify_core::service_main(&name, &ScmControlHost::own_process(), &store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clap_parses_install() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let cli = Cli::try_parse_from(["hostify", "-i", "-c", path]).unwrap();
        assert_eq!(cli.action(), Some(SetupAction::Install));
        assert_eq!(cli.config_file.as_deref(), Some(file.path()));

        let cli = Cli::try_parse_from(["hostify", "--uninstall", "--config_file", path]).unwrap();
        assert_eq!(cli.action(), Some(SetupAction::Uninstall));
    }

    #[test]
    fn clap_rejects_bad_combinations() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        // 缺少动作
        assert!(Cli::try_parse_from(["hostify", "-c", path]).is_err());
        // 互斥
        assert!(Cli::try_parse_from(["hostify", "-i", "-u", "-c", path]).is_err());
        // 配置文件必须存在
        assert!(Cli::try_parse_from(["hostify", "-i", "-c", "/definitely/missing.json"]).is_err());
        // 目录不是普通文件
        let dir = tempfile::tempdir().unwrap();
        assert!(Cli::try_parse_from(["hostify", "-i", "-c", dir.path().to_str().unwrap()]).is_err());
    }

    #[test]
    fn clap_parses_service_mode_without_config() {
        let cli = Cli::try_parse_from(["hostify", "--service"]).unwrap();
        assert!(cli.service);
        assert!(cli.action().is_none());
    }
}
