//! seatwarden-client - send one request to the daemon's control socket,
//! or to a session launcher's

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use seatwarden::config::Config;
use seatwarden::control::{Request, Response};
use seatwarden::launcher::control_socket_path;
use seatwarden::utils::quote_arg;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

fn print_help() {
    println!(
        r#"seatwarden-client {} - control a running seatwarden

USAGE:
    seatwarden-client [--socket PATH] COMMAND

COMMANDS:
    login SEAT USER PASSWORD [KEY=VALUE]...    Log USER in on an idle seat
    switch SEAT [USER PASSWORD [KEY=VALUE]...] Replace the seat's user
    logout SEAT                                End the seat's session
    seats                                      List seats
    launch SESSIONID COMMAND [leader]          Start COMMAND in the session
    stop SESSIONID PID                         Stop a process of the session
    list SESSIONID                             List the session's processes

OPTIONS:
    -S, --socket PATH       Control socket (default: from config, or
                            $XDG_RUNTIME_DIR/SESSIONID for launcher commands)
    -h, --help              Print this help message
"#,
        env!("CARGO_PKG_VERSION")
    );
}

/// Validate the command line by running it through the request parser
fn build_request(args: &[String]) -> Result<Request> {
    if args.is_empty() {
        bail!("no command given (see --help)");
    }
    let quoted = args
        .iter()
        .map(|arg| quote_arg(arg).ok_or_else(|| anyhow!("cannot quote argument {:?}", arg)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Request::parse(&quoted.join(" "))?)
}

/// Launcher commands name the session right after the verb
fn is_launcher_command(args: &[String]) -> bool {
    matches!(args.first().map(String::as_str), Some("launch" | "stop" | "list"))
}

/// Remove the session id from a launcher command and return its socket
fn take_launcher_socket(args: &mut Vec<String>) -> Result<PathBuf> {
    if args.len() < 2 {
        bail!("{} requires a session id", args[0]);
    }
    let session_id = args.remove(1);
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").ok();
    Ok(control_socket_path(runtime_dir.as_deref(), Some(&session_id))?)
}

fn send(socket: &Path, request: &Request) -> Result<Response> {
    let mut line = request.to_line()?;
    line.push('\n');

    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("Failed to connect to {}", socket.display()))?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.write_all(line.as_bytes())?;

    let mut reply = String::new();
    BufReader::new(&stream)
        .read_line(&mut reply)
        .context("Failed to read reply")?;
    if reply.is_empty() {
        bail!("connection closed without a reply");
    }
    Ok(Response::parse(&reply)?)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return;
    }

    let mut socket = None;
    if let Some(pos) = args.iter().position(|a| a == "--socket" || a == "-S") {
        if pos + 1 >= args.len() {
            eprintln!("--socket requires a value");
            std::process::exit(1);
        }
        socket = Some(PathBuf::from(args.remove(pos + 1)));
        args.remove(pos);
    }

    let socket = if is_launcher_command(&args) {
        take_launcher_socket(&mut args).map(|default| socket.unwrap_or(default))
    } else {
        Ok(socket.unwrap_or_else(|| PathBuf::from(Config::load().general.control_socket)))
    };

    let result = socket.and_then(|socket| build_request(&args).and_then(|request| send(&socket, &request)));
    match result {
        Ok(response) => {
            match &response {
                Response::Ok(Some(text)) => println!("{}", text),
                Response::Ok(None) => {}
                Response::Error(msg) => eprintln!("error: {}", msg),
            }
            std::process::exit(if response.is_ok() { 0 } else { 1 });
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}
