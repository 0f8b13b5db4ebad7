//! Line protocol between the coordinator and its peers
//!
//! Every message is one line of whitespace separated tokens. Free text
//! (descriptions, reasons, reply messages) takes the rest of the line and
//! may be wrapped in double quotes.

use crate::registry::PeerId;
use nightwatch_core::{DeviceType, PowerState};
use std::fmt;
use thiserror::Error;

/// Signed terminal reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    /// Command succeeded
    Ok,
    /// Command not known
    UnknownCommand,
    /// Wrong number of parameters
    ParamCount,
    /// Parameter could not be parsed or is out of range
    ParamValue,
    /// Hardware reported an error
    Hardware,
    /// Coordinator-side failure
    System,
    /// Priority or authorization missing
    Priority,
    /// No answer within the deadline
    Timeout,
}

impl ReplyCode {
    /// Numeric code on the wire
    pub fn code(self) -> i32 {
        match self {
            ReplyCode::Ok => 0,
            ReplyCode::UnknownCommand => -1,
            ReplyCode::ParamCount => -2,
            ReplyCode::ParamValue => -3,
            ReplyCode::Hardware => -4,
            ReplyCode::System => -5,
            ReplyCode::Priority => -6,
            ReplyCode::Timeout => -7,
        }
    }
}

/// Malformed peer input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Nothing but whitespace
    #[error("empty command")]
    Empty,

    /// First token is not a known command
    #[error("unknown command {0}")]
    UnknownCommand(String),

    /// Wrong arity
    #[error("{command} expects {expected} parameters")]
    ParamCount {
        /// Command name
        command: &'static str,
        /// Human readable arity
        expected: &'static str,
    },

    /// A parameter failed to parse
    #[error("{command}: invalid value {value:?} for {param}")]
    ParamValue {
        /// Command name
        command: &'static str,
        /// Parameter name
        param: &'static str,
        /// Offending token
        value: String,
    },
}

impl ProtocolError {
    /// Reply code for this error
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ProtocolError::Empty | ProtocolError::UnknownCommand(_) => ReplyCode::UnknownCommand,
            ProtocolError::ParamCount { .. } => ReplyCode::ParamCount,
            ProtocolError::ParamValue { .. } => ReplyCode::ParamValue,
        }
    }
}

/// A parsed line received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `register <num> <name> <deviceType> <host> <port>`
    Register {
        num: i32,
        name: String,
        device_type: DeviceType,
        host: String,
        port: u16,
    },
    /// `login <login> <name>`
    Login { login: String, name: String },
    /// `S <statusName> <value> [description]`
    Status {
        name: String,
        value: u32,
        description: String,
    },
    /// `weather_update <device> <reason>`
    WeatherUpdate { device: String, reason: String },
    /// `key <device>`
    Key { device: String },
    /// `authorize <clientId> <key>`
    Authorize { client: PeerId, key: u32 },
    /// `priority`
    Priority,
    /// `priority_done`
    PriorityDone,
    /// `priority_release`
    PriorityRelease,
    /// `on`, `standby`, `off`, `soft_off`
    Power(PowerState),
    /// `open`
    Open,
    /// `close`
    Close,
    /// `status_info`
    StatusInfo,
    /// `info`
    Info,
    /// `<signedCode> <message>`
    Reply { code: i32, message: String },
}

impl Request {
    /// Parse one protocol line
    pub fn parse(line: &str) -> Result<Request, ProtocolError> {
        let line = line.trim();
        let (head, rest) = split_token(line);
        if head.is_empty() {
            return Err(ProtocolError::Empty);
        }

        if head.starts_with(['+', '-']) {
            if let Ok(code) = head.parse::<i32>() {
                return Ok(Request::Reply {
                    code,
                    message: unquote(rest).to_string(),
                });
            }
        }

        let args: Vec<&str> = rest.split_whitespace().collect();
        match head {
            "register" => {
                let [num, name, device_type, host, port] = exact::<5>("register", "5", &args)?;
                Ok(Request::Register {
                    num: parse_num("register", "num", num)?,
                    name: name.to_string(),
                    device_type: DeviceType::from_code(parse_num(
                        "register",
                        "deviceType",
                        device_type,
                    )?),
                    host: host.to_string(),
                    port: parse_num("register", "port", port)?,
                })
            }
            "login" => {
                let [login, name] = exact::<2>("login", "2", &args)?;
                Ok(Request::Login {
                    login: login.to_string(),
                    name: name.to_string(),
                })
            }
            "S" => {
                let (name, rest) = split_token(rest);
                let (value, description) = split_token(rest);
                if value.is_empty() {
                    return Err(ProtocolError::ParamCount {
                        command: "S",
                        expected: "at least 2",
                    });
                }
                Ok(Request::Status {
                    name: name.to_string(),
                    value: parse_num("S", "value", value)?,
                    description: unquote(description).to_string(),
                })
            }
            "weather_update" => {
                let (device, reason) = split_token(rest);
                if device.is_empty() {
                    return Err(ProtocolError::ParamCount {
                        command: "weather_update",
                        expected: "at least 1",
                    });
                }
                Ok(Request::WeatherUpdate {
                    device: device.to_string(),
                    reason: unquote(reason).to_string(),
                })
            }
            "key" => {
                let [device] = exact::<1>("key", "1", &args)?;
                Ok(Request::Key {
                    device: device.to_string(),
                })
            }
            "authorize" => {
                let [client, key] = exact::<2>("authorize", "2", &args)?;
                Ok(Request::Authorize {
                    client: parse_num("authorize", "clientId", client)?,
                    key: parse_num("authorize", "key", key)?,
                })
            }
            _ => {
                let request = match head {
                    "priority" => Request::Priority,
                    "priority_done" => Request::PriorityDone,
                    "priority_release" => Request::PriorityRelease,
                    "on" => Request::Power(PowerState::On),
                    "standby" => Request::Power(PowerState::Standby),
                    "off" => Request::Power(PowerState::HardOff),
                    "soft_off" => Request::Power(PowerState::SoftOff),
                    "open" => Request::Open,
                    "close" => Request::Close,
                    "status_info" => Request::StatusInfo,
                    "info" => Request::Info,
                    other => return Err(ProtocolError::UnknownCommand(other.to_string())),
                };
                if !args.is_empty() {
                    return Err(ProtocolError::ParamCount {
                        command: request.name(),
                        expected: "0",
                    });
                }
                Ok(request)
            }
        }
    }

    /// Command keyword, for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Request::Register { .. } => "register",
            Request::Login { .. } => "login",
            Request::Status { .. } => "S",
            Request::WeatherUpdate { .. } => "weather_update",
            Request::Key { .. } => "key",
            Request::Authorize { .. } => "authorize",
            Request::Priority => "priority",
            Request::PriorityDone => "priority_done",
            Request::PriorityRelease => "priority_release",
            Request::Power(PowerState::On) => "on",
            Request::Power(PowerState::Standby) => "standby",
            Request::Power(PowerState::SoftOff) => "soft_off",
            Request::Power(PowerState::HardOff) => "off",
            Request::Open => "open",
            Request::Close => "close",
            Request::StatusInfo => "status_info",
            Request::Info => "info",
            Request::Reply { .. } => "reply",
        }
    }
}

fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(at) => (&s[..at], s[at..].trim()),
        None => (s, ""),
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

fn exact<'a, const N: usize>(
    command: &'static str,
    expected: &'static str,
    args: &[&'a str],
) -> Result<[&'a str; N], ProtocolError> {
    <[&str; N]>::try_from(args).map_err(|_| ProtocolError::ParamCount { command, expected })
}

fn parse_num<T: std::str::FromStr>(
    command: &'static str,
    param: &'static str,
    value: &str,
) -> Result<T, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::ParamValue {
        command,
        param,
        value: value.to_string(),
    })
}

/// A line sent by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `S <name> <value> "<description>"`
    Status {
        name: String,
        value: u32,
        description: String,
    },
    /// `B <systemState> <effectiveBop>`
    Bop { state: u32, bop: u32 },
    /// `V <name> <value>`
    Value { name: &'static str, value: String },
    /// `A <event> [args]`
    Event { event: &'static str, args: String },
    /// `I status_num <n>`
    StatusNum(usize),
    /// `I status <idx> <name> <value>`
    StatusEntry {
        index: usize,
        name: String,
        value: u32,
    },
    /// `device <id> <name> <host> <port> <type>`
    Device {
        id: PeerId,
        name: String,
        host: String,
        port: u16,
        device_type: i32,
    },
    /// `user <id> <login> <name>`
    User {
        id: PeerId,
        login: String,
        name: String,
    },
    /// Command sent to a device
    Command(&'static str),
    /// Terminal reply
    Reply { code: i32, message: String },
}

impl Message {
    pub fn ok() -> Self {
        Message::Reply {
            code: ReplyCode::Ok.code(),
            message: "OK".to_string(),
        }
    }

    pub fn reply(code: ReplyCode, message: impl Into<String>) -> Self {
        Message::Reply {
            code: code.code(),
            message: message.into(),
        }
    }

    pub fn value(name: &'static str, value: impl fmt::Display) -> Self {
        Message::Value {
            name,
            value: value.to_string(),
        }
    }

    pub fn event(event: &'static str, args: impl fmt::Display) -> Self {
        Message::Event {
            event,
            args: args.to_string(),
        }
    }

    /// True for terminal replies
    pub fn is_reply(&self) -> bool {
        matches!(self, Message::Reply { .. })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Status {
                name,
                value,
                description,
            } => write!(f, "S {} {} \"{}\"", name, value, description),
            Message::Bop { state, bop } => write!(f, "B {} {}", state, bop),
            Message::Value { name, value } => write!(f, "V {} {}", name, value),
            Message::Event { event, args } if args.is_empty() => write!(f, "A {}", event),
            Message::Event { event, args } => write!(f, "A {} {}", event, args),
            Message::StatusNum(n) => write!(f, "I status_num {}", n),
            Message::StatusEntry { index, name, value } => {
                write!(f, "I status {} {} {}", index, name, value)
            }
            Message::Device {
                id,
                name,
                host,
                port,
                device_type,
            } => write!(f, "device {} {} {} {} {}", id, name, host, port, device_type),
            Message::User { id, login, name } => write!(f, "user {} {} {}", id, login, name),
            Message::Command(command) => f.write_str(command),
            Message::Reply { code, message } => write!(f, "{:+04} {}", code, message),
        }
    }
}
