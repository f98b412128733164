//! seatwarden - multi-seat login and session manager
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              Event Loop                  │
//! ├──────────────────────────────────────────┤
//! │  logind / plugins / control socket       │
//! │                   ↓                      │
//! │  Manager → Seat → Session → AuthSession  │
//! │                   ↓                      │
//! │          ProcessSupervisor               │
//! └──────────────────────────────────────────┘
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use log::{error, info, warn};
use nix::unistd::{fork, setsid, ForkResult};

use seatwarden::auth::PamBackend;
use seatwarden::broker::LogindBroker;
use seatwarden::config::Config;
use seatwarden::constants::SYSTEM_CONFIG_PATH;
use seatwarden::context::Services;
use seatwarden::manager::Manager;
use seatwarden::plugins::{AuthPlugin, PluginRegistry};
use seatwarden::utils::PasswdDb;

/// Print help message
fn print_help() {
    println!(
        r#"seatwarden {} - multi-seat login and session manager

USAGE:
    seatwarden [OPTIONS]

OPTIONS:
    -h, --help              Print this help message
    -V, --version           Print version information
    -c, --config PATH       Use PATH instead of the default config lookup
    -D, --daemonize         Detach from the terminal and run in the background
    --init-config[=PATH]    Write the default config (default: {})
    -f, --force             Overwrite an existing config with --init-config

SIGNALS:
    SIGTERM, SIGINT         Stop every session and exit
    SIGHUP                  Reload the config file

CONFIG FILE:
    $SEATWARDEN_CONFIG, ~/.config/seatwarden/config.toml, {}
"#,
        env!("CARGO_PKG_VERSION"),
        SYSTEM_CONFIG_PATH,
        SYSTEM_CONFIG_PATH
    );
}

/// Value following `short`/`long` on the command line
fn option_value<'a>(args: &'a [String], short: &str, long: &str) -> Result<Option<&'a str>> {
    let Some(pos) = args.iter().position(|a| a == short || a == long) else {
        return Ok(None);
    };
    args.get(pos + 1)
        .map(|v| Some(v.as_str()))
        .ok_or_else(|| anyhow!("{} requires a value", long))
}

/// Fork into the background. Returns the pipe the child reports its
/// startup status on; the parent never returns.
fn daemonize() -> Result<File> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error()).context("pipe2 failed");
    }
    let (mut status_read, status_write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };

    // SAFETY: no threads exist yet
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { .. } => {
            drop(status_write);
            let mut status = [1u8];
            let code = match status_read.read(&mut status) {
                Ok(1) => status[0] as i32,
                _ => 1,
            };
            std::process::exit(code);
        }
        ForkResult::Child => {
            drop(status_read);
            setsid().context("setsid failed")?;
            std::env::set_current_dir("/").context("chdir / failed")?;

            let null = OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/null")
                .context("Failed to open /dev/null")?;
            for fd in 0..3 {
                unsafe {
                    libc::dup2(null.as_raw_fd(), fd);
                }
            }
            Ok(status_write)
        }
    }
}

fn report_status(pipe: Option<File>, code: u8) {
    if let Some(mut pipe) = pipe {
        let _ = pipe.write_all(&[code]);
    }
}

fn build_services(config: &Config, registry: &PluginRegistry) -> Result<Services> {
    let auth = PamBackend::load().context("PAM is required")?;
    let broker = LogindBroker::connect().context("logind is required")?;

    let accounts = match config.general.accounts_plugin.trim() {
        "" => None,
        name => match registry.account_plugin(name, &config.plugin_options(name)) {
            Ok(plugin) => {
                info!("Accounts plugin: {}", plugin.name());
                Some(plugin)
            }
            Err(e) => {
                warn!("{}, continuing without account provisioning", e);
                None
            }
        },
    };

    Ok(Services {
        auth: Box::new(auth),
        broker: Box::new(broker),
        users: Box::new(PasswdDb),
        accounts,
    })
}

fn load_auth_plugins(config: &Config, registry: &PluginRegistry) -> Vec<Box<dyn AuthPlugin>> {
    let mut plugins = Vec::new();
    for name in &config.general.auth_plugins {
        match registry.auth_plugin(name, &config.plugin_options(name)) {
            Ok(plugin) => plugins.push(plugin),
            Err(e) => warn!("{}", e),
        }
    }
    plugins
}

fn manager_loop(mut manager: Manager) -> seatwarden::Result<()> {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        warn!("sd_notify READY failed: {}", e);
    }
    let result = manager.run();
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    manager.stop();
    result
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Check command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --help
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    // --version
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("seatwarden {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // --init-config or --init-config=PATH
    if let Some(arg) = args.iter().find(|a| a.starts_with("--init-config")) {
        let path = match arg.split_once('=') {
            Some((_, path)) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(SYSTEM_CONFIG_PATH),
        };
        let force = args.iter().any(|a| a == "--force" || a == "-f");
        if path.exists() && !force {
            bail!("Config file already exists: {} (use --force)", path.display());
        }
        Config::write_default(&path)?;
        println!("Config file generated: {}", path.display());
        return Ok(());
    }

    let config_path = option_value(&args, "-c", "--config")?.map(PathBuf::from);
    let config = match &config_path {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load(),
    };

    // Fork before any thread is started
    let status_pipe = if args.iter().any(|a| a == "--daemonize" || a == "-D") {
        Some(daemonize()?)
    } else {
        None
    };

    info!("seatwarden {} starting...", env!("CARGO_PKG_VERSION"));

    let registry = PluginRegistry::with_builtin();
    let services = match build_services(&config, &registry) {
        Ok(services) => services,
        Err(e) => {
            error!("{:#}", e);
            report_status(status_pipe, 1);
            return Err(e);
        }
    };
    let plugins = load_auth_plugins(&config, &registry);

    let mut manager = match Manager::new(config, services, plugins) {
        Ok(manager) => manager,
        Err(e) => {
            report_status(status_pipe, 1);
            return Err(e).context("Failed to create manager");
        }
    };
    if let Some(path) = &config_path {
        manager.set_config_path(path);
    }
    if let Err(e) = manager.start() {
        report_status(status_pipe, 1);
        return Err(e).context("Failed to start manager");
    }
    report_status(status_pipe, 0);

    manager_loop(manager)?;
    info!("seatwarden exiting");
    Ok(())
}
