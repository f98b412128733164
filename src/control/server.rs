//! Control socket listener
//!
//! Nonblocking Unix stream socket driven by the main [`EventLoop`]. Each
//! client sends one request line and gets one reply line.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use super::{Request, Response};
use crate::constants::MAX_CONTROL_REQUEST;
use crate::error::{Error, Result};
use crate::mainloop::{EventLoop, Token};

const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

struct ControlClient {
    stream: UnixStream,
    buffer: Vec<u8>,
}

pub struct ControlServer {
    path: PathBuf,
    listener: UnixListener,
    token: Token,
    clients: HashMap<Token, ControlClient>,
}

impl ControlServer {
    /// Bind `path` (mode 0600), replacing a stale socket file
    pub fn bind(path: &Path, event_loop: &mut EventLoop) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Remove stale control socket
        let _ = fs::remove_file(path);

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        listener.set_nonblocking(true)?;

        let token = event_loop.watch_fd(listener.as_raw_fd());
        info!("Control socket listening on {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            listener,
            token,
            clients: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owns(&self, token: Token) -> bool {
        token == self.token || self.clients.contains_key(&token)
    }

    /// Handle readiness on one of our tokens; returns complete requests
    pub fn poll(&mut self, token: Token, event_loop: &mut EventLoop) -> Vec<(Token, Result<Request>)> {
        if token == self.token {
            self.accept(event_loop);
            return Vec::new();
        }

        let Some(client) = self.clients.get_mut(&token) else {
            return Vec::new();
        };
        match read_line(client) {
            Ok(Some(line)) => {
                // No more reads until the reply is written
                event_loop.unwatch_fd(token);
                vec![(token, Request::parse(&line))]
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                debug!("Control client dropped: {}", e);
                self.close(token, event_loop);
                Vec::new()
            }
        }
    }

    /// Write the reply and close the connection
    pub fn respond(&mut self, token: Token, response: &Response, event_loop: &mut EventLoop) {
        let Some(mut client) = self.close(token, event_loop) else {
            return;
        };
        let mut line = response.to_line();
        line.push('\n');

        let sent = client
            .stream
            .set_nonblocking(false)
            .and_then(|_| client.stream.set_write_timeout(Some(REPLY_TIMEOUT)))
            .and_then(|_| client.stream.write_all(line.as_bytes()));
        if let Err(e) = sent {
            debug!("Failed to send control reply: {}", e);
        }
    }

    fn accept(&mut self, event_loop: &mut EventLoop) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("Control client setup failed: {}", e);
                        continue;
                    }
                    let token = event_loop.watch_fd(stream.as_raw_fd());
                    self.clients.insert(
                        token,
                        ControlClient {
                            stream,
                            buffer: Vec::new(),
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Control socket accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn close(&mut self, token: Token, event_loop: &mut EventLoop) -> Option<ControlClient> {
        let client = self.clients.remove(&token)?;
        event_loop.unwatch_fd(token);
        Some(client)
    }

    /// Drop every client and stop watching the listener
    pub fn shutdown(&mut self, event_loop: &mut EventLoop) {
        for token in self.clients.keys().copied().collect::<Vec<_>>() {
            self.close(token, event_loop);
        }
        event_loop.unwatch_fd(self.token);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Read what is available; Some once a full line is buffered
fn read_line(client: &mut ControlClient) -> Result<Option<String>> {
    let mut chunk = [0u8; 512];
    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => {
                if client.buffer.is_empty() {
                    return Err(Error::InvalidInput("connection closed".into()));
                }
                // EOF terminates an unfinished line
                break;
            }
            Ok(n) => {
                client.buffer.extend_from_slice(&chunk[..n]);
                if client.buffer.contains(&b'\n') {
                    break;
                }
                if client.buffer.len() > MAX_CONTROL_REQUEST {
                    return Err(Error::InvalidInput("request too long".into()));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let end = client
        .buffer
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(client.buffer.len());
    let line = String::from_utf8_lossy(&client.buffer[..end]).into_owned();
    client.buffer.clear();
    Ok(Some(line))
}
