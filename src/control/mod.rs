//! Control protocol
//!
//! One request line per connection, one reply line back. Arguments are
//! quoted with [`quote_arg`] and split with [`split_command_line`].
//!
//! ```text
//! login SEAT USER PASSWORD [KEY=VALUE]...
//! switch SEAT [USER PASSWORD [KEY=VALUE]...]
//! logout SEAT
//! seats
//!
//! launch COMMAND [leader]
//! stop PID
//! list
//!
//! ok [TEXT]
//! error MESSAGE
//! ```
//!
//! The daemon serves the seat requests; a session's launcher serves
//! `launch`, `stop` and `list` on its own socket.

pub mod server;

use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::utils::{quote_arg, split_command_line};

pub use server::ControlServer;

#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    Login {
        seat: String,
        username: String,
        password: Zeroizing<String>,
        environment: Vec<(String, String)>,
    },
    /// Without a user the seat's default user is logged in
    Switch {
        seat: String,
        username: Option<String>,
        password: Option<Zeroizing<String>>,
        environment: Vec<(String, String)>,
    },
    Logout {
        seat: String,
    },
    Seats,
    /// Start a helper under the session launcher
    Launch {
        command: String,
        leader: bool,
    },
    Stop {
        pid: i32,
    },
    List,
}

fn parse_environment(args: &[String]) -> Result<Vec<(String, String)>> {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(Error::InvalidInput(format!("expected KEY=VALUE, got {:?}", arg))),
        })
        .collect()
}

fn push_quoted(line: &mut String, arg: &str) -> Result<()> {
    let quoted = quote_arg(arg)
        .ok_or_else(|| Error::InvalidInput(format!("cannot quote argument {:?}", arg)))?;
    line.push(' ');
    line.push_str(&quoted);
    Ok(())
}

impl Request {
    pub fn parse(line: &str) -> Result<Self> {
        let args = split_command_line(line.trim_end_matches(['\r', '\n']));
        let Some((verb, rest)) = args.split_first() else {
            return Err(Error::InvalidInput("empty request".into()));
        };

        match (verb.as_str(), rest) {
            ("login", [seat, username, password, env @ ..]) => Ok(Request::Login {
                seat: seat.clone(),
                username: username.clone(),
                password: Zeroizing::new(password.clone()),
                environment: parse_environment(env)?,
            }),
            ("switch", [seat]) => Ok(Request::Switch {
                seat: seat.clone(),
                username: None,
                password: None,
                environment: Vec::new(),
            }),
            ("switch", [seat, username, password, env @ ..]) => Ok(Request::Switch {
                seat: seat.clone(),
                username: Some(username.clone()),
                password: Some(Zeroizing::new(password.clone())),
                environment: parse_environment(env)?,
            }),
            ("logout", [seat]) => Ok(Request::Logout { seat: seat.clone() }),
            ("seats", []) => Ok(Request::Seats),
            ("launch", [command]) => Ok(Request::Launch {
                command: command.clone(),
                leader: false,
            }),
            ("launch", [command, flag]) if flag == "leader" => Ok(Request::Launch {
                command: command.clone(),
                leader: true,
            }),
            ("stop", [pid]) => match pid.parse::<i32>() {
                Ok(pid) if pid > 0 => Ok(Request::Stop { pid }),
                _ => Err(Error::InvalidInput(format!("invalid pid: {:?}", pid))),
            },
            ("list", []) => Ok(Request::List),
            ("login" | "switch" | "logout" | "seats" | "launch" | "stop" | "list", _) => {
                Err(Error::InvalidInput(format!("wrong arguments for {}", verb)))
            }
            _ => Err(Error::InvalidInput(format!("unknown request: {}", verb))),
        }
    }

    /// Encode as a request line (without the newline)
    pub fn to_line(&self) -> Result<String> {
        let mut line = String::new();
        match self {
            Request::Login {
                seat,
                username,
                password,
                environment,
            } => {
                line.push_str("login");
                push_quoted(&mut line, seat)?;
                push_quoted(&mut line, username)?;
                push_quoted(&mut line, password)?;
                for (key, value) in environment {
                    push_quoted(&mut line, &format!("{}={}", key, value))?;
                }
            }
            Request::Switch {
                seat,
                username,
                password,
                environment,
            } => {
                line.push_str("switch");
                push_quoted(&mut line, seat)?;
                if let Some(username) = username {
                    push_quoted(&mut line, username)?;
                    push_quoted(&mut line, password.as_deref().map_or("", String::as_str))?;
                    for (key, value) in environment {
                        push_quoted(&mut line, &format!("{}={}", key, value))?;
                    }
                }
            }
            Request::Logout { seat } => {
                line.push_str("logout");
                push_quoted(&mut line, seat)?;
            }
            Request::Seats => line.push_str("seats"),
            Request::Launch { command, leader } => {
                line.push_str("launch");
                push_quoted(&mut line, command)?;
                if *leader {
                    line.push_str(" leader");
                }
            }
            Request::Stop { pid } => line.push_str(&format!("stop {}", pid)),
            Request::List => line.push_str("list"),
        }
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(Option<String>),
    Error(String),
}

impl Response {
    pub fn to_line(&self) -> String {
        let (head, text) = match self {
            Response::Ok(None) => return "ok".to_string(),
            Response::Ok(Some(text)) => ("ok", text),
            Response::Error(msg) => ("error", msg),
        };
        // Replies are single lines
        format!("{} {}", head, text.replace('\n', " "))
    }

    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (head, text) = match line.split_once(' ') {
            Some((head, text)) => (head, Some(text)),
            None => (line, None),
        };
        match head {
            "ok" => Ok(Response::Ok(text.map(str::to_string))),
            "error" => Ok(Response::Error(text.unwrap_or_default().to_string())),
            _ => Err(Error::InvalidInput(format!("malformed reply: {:?}", line))),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

impl From<Result<Option<String>>> for Response {
    fn from(result: Result<Option<String>>) -> Self {
        match result {
            Ok(text) => Response::Ok(text),
            Err(e) => Response::Error(e.to_string()),
        }
    }
}
