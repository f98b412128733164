//! seatwarden-launcher - run a session's helper processes from a script

use anyhow::{anyhow, Context, Result};
use log::{info, warn};

use seatwarden::config::Config;
use seatwarden::launcher::{control_socket_path, parse_script, Launcher, LauncherOptions};

fn print_help() {
    println!(
        r#"seatwarden-launcher {} - session helper launcher

USAGE:
    seatwarden-launcher -f SCRIPT [-s SESSIONID]

OPTIONS:
    -f, --file SCRIPT       Launch commands from SCRIPT
    -s, --sessionid ID      Session the helpers belong to; names the
                            control socket $XDG_RUNTIME_DIR/ID
    -h, --help              Print this help message

SCRIPT:
    M <command>             Launch and monitor
    L <command>             Launch as leader; its exit stops the rest
    W <path>[,<path>...]    Wait until every path exists
    # ...                   Comment

CONTROL:
    Requests on the control socket (see seatwarden-client):
    launch COMMAND [leader], stop PID, list
"#,
        env!("CARGO_PKG_VERSION")
    );
}

fn option_value<'a>(args: &'a [String], short: &str, long: &str) -> Result<Option<&'a str>> {
    let Some(pos) = args.iter().position(|a| a == short || a == long) else {
        return Ok(None);
    };
    args.get(pos + 1)
        .map(|v| Some(v.as_str()))
        .ok_or_else(|| anyhow!("{} requires a value", long))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let Some(file) = option_value(&args, "-f", "--file")? else {
        print_help();
        return Ok(());
    };
    let session_id = option_value(&args, "-s", "--sessionid")?;

    let script = match std::fs::read_to_string(file) {
        Ok(script) => script,
        Err(e) => {
            warn!("Failed to open script {}: {}", file, e);
            return Ok(());
        }
    };

    // Follow the session down if our parent goes away
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP) } < 0 {
        warn!("Cannot set parent death signal: {}", std::io::Error::last_os_error());
    }

    let config = Config::load();
    info!(
        "seatwarden-launcher pid {}, session {}",
        std::process::id(),
        session_id.unwrap_or("<none>")
    );

    let options = LauncherOptions {
        terminate_timeout: config.terminate_timeout(),
        signal_group_on_exit: true,
    };
    let mut launcher = Launcher::new(parse_script(&script), options).context("Failed to create launcher")?;

    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").ok();
    match control_socket_path(runtime_dir.as_deref(), session_id) {
        Ok(path) => {
            if let Err(e) = launcher.listen(&path) {
                warn!("Control socket {} unavailable: {}", path.display(), e);
            }
        }
        Err(e) => warn!("No control socket: {}", e),
    }
    launcher.start().context("Failed to start launcher")?;
    launcher.run()?;

    info!("seatwarden-launcher exiting");
    Ok(())
}
