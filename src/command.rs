//! Console command parsing and help text.
//!
//! A line is a command word followed by arguments. The command word is
//! case-insensitive; arguments are kept as typed, and for `send` everything
//! after the id is the message.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use peerchat_core::{ConnectionId, DomainError};
use thiserror::Error;

const LINE_SEP: &str = "-----------------------------------";

// ============================================================================
// Command
// ============================================================================

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `help [command]`
    Help(Option<String>),
    /// `myip`
    MyIp,
    /// `myport`
    MyPort,
    /// `connect <ip> <port>`
    Connect(SocketAddr),
    /// `list`
    List,
    /// `terminate <id>`
    Terminate(ConnectionId),
    /// `send <id> <text...>`
    Send { id: ConnectionId, text: String },
    /// `exit`
    Exit,
}

/// Errors from reading a console line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The command word is not known.
    #[error("Command: {0} does not exist.")]
    UnknownCommand(String),

    /// Wrong number or type of arguments.
    #[error("{reason}\nUsage: {usage}")]
    Malformed {
        command: &'static str,
        reason: String,
        usage: &'static str,
    },
}

impl Command {
    /// Parses one console line.
    ///
    /// Returns `Ok(None)` for a blank line.
    ///
    /// # Errors
    ///
    /// `CommandError::UnknownCommand` for an unknown word, and
    /// `CommandError::Malformed` when the arguments do not fit the usage.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (word, rest) = split_word(line);
        let word = word.to_lowercase();
        let Some(doc) = doc_for(&word) else {
            return Err(CommandError::UnknownCommand(word));
        };

        let command = match doc.name {
            "help" => match args(doc, rest, 0..=1)?.as_slice() {
                [topic] => Self::Help(Some(topic.to_lowercase())),
                _ => Self::Help(None),
            },
            "myip" => {
                args(doc, rest, 0..=0)?;
                Self::MyIp
            }
            "myport" => {
                args(doc, rest, 0..=0)?;
                Self::MyPort
            }
            "list" => {
                args(doc, rest, 0..=0)?;
                Self::List
            }
            "exit" => {
                args(doc, rest, 0..=0)?;
                Self::Exit
            }
            "connect" => match args(doc, rest, 2..=2)?.as_slice() {
                [ip, port] => Self::Connect(SocketAddr::new(
                    parse_ip(doc, ip)?,
                    parse_remote_port(doc, port)?,
                )),
                _ => return Err(malformed(doc, "expected an IP address and a port")),
            },
            "terminate" => match args(doc, rest, 1..=1)?.as_slice() {
                [id] => Self::Terminate(parse_id(doc, id)?),
                _ => return Err(malformed(doc, "expected a connection id")),
            },
            "send" => {
                let (id, text) = split_word(rest);
                if id.is_empty() || text.is_empty() {
                    return Err(malformed(doc, "expected a connection id and a message"));
                }
                Self::Send {
                    id: parse_id(doc, id)?,
                    text: text.to_string(),
                }
            }
            _ => return Err(CommandError::UnknownCommand(word)),
        };
        Ok(Some(command))
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)?.ok_or_else(|| CommandError::UnknownCommand(String::new()))
    }
}

/// Splits off the first whitespace-delimited word; the rest keeps its
/// inner spacing.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

fn args<'a>(
    doc: &CommandDoc,
    rest: &'a str,
    expected: std::ops::RangeInclusive<usize>,
) -> Result<Vec<&'a str>, CommandError> {
    let args: Vec<&str> = rest.split_whitespace().collect();
    if expected.contains(&args.len()) {
        return Ok(args);
    }
    let reason = match (*expected.start(), *expected.end()) {
        (0, 0) => format!("{} takes no arguments", doc.name),
        (min, max) if min == max => format!("{} takes {min} argument(s), got {}", doc.name, args.len()),
        (min, max) => format!(
            "{} takes {min} to {max} argument(s), got {}",
            doc.name,
            args.len()
        ),
    };
    Err(malformed(doc, reason))
}

fn malformed(doc: &CommandDoc, reason: impl Into<String>) -> CommandError {
    CommandError::Malformed {
        command: doc.name,
        reason: reason.into(),
        usage: doc.usage,
    }
}

fn parse_ip(doc: &CommandDoc, raw: &str) -> Result<IpAddr, CommandError> {
    raw.parse()
        .map_err(|_| malformed(doc, format!("invalid IP address: {raw}")))
}

/// Remote peers may listen anywhere except port 0.
fn parse_remote_port(doc: &CommandDoc, raw: &str) -> Result<u16, CommandError> {
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(malformed(doc, format!("invalid port: {raw}"))),
    }
}

fn parse_id(doc: &CommandDoc, raw: &str) -> Result<ConnectionId, CommandError> {
    raw.parse()
        .map_err(|e: DomainError| malformed(doc, e.to_string()))
}

// ============================================================================
// Help
// ============================================================================

/// Manual entry for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDoc {
    pub name: &'static str,
    pub usage: &'static str,
    pub description: &'static str,
    pub example: &'static str,
}

impl CommandDoc {
    pub fn render(&self) -> String {
        format!(
            "Description:\n{}\n\nCommand Line Usage: {}\n\nExample:\n{}",
            self.description, self.usage, self.example
        )
    }
}

/// Every command, in the order `help` lists them.
pub const COMMANDS: &[CommandDoc] = &[
    CommandDoc {
        name: "help",
        usage: "help [command]",
        description: "Display information about the available commands, or the manual of one.",
        example: "> help myip",
    },
    CommandDoc {
        name: "myip",
        usage: "myip",
        description: "Display the IP address of this process.\n\
                      This is the address other peers connect to, never the loopback address.",
        example: "> myip\n192.168.1.8",
    },
    CommandDoc {
        name: "myport",
        usage: "myport",
        description: "Display the port on which this process is listening for incoming connections.",
        example: "> myport\n5000",
    },
    CommandDoc {
        name: "connect",
        usage: "connect <destination> <port no>",
        description: "Establish a new TCP connection to <destination> at <port no>.\n\
                      Invalid addresses, self-connections and duplicate connections are rejected.",
        example: "> connect 192.168.1.9 5000",
    },
    CommandDoc {
        name: "list",
        usage: "list",
        description: "Display a numbered list of all the connections this process is part of,\n\
                      both initiated by this process and accepted from other peers.",
        example: "> list\nid:\tIP address\tPort No.\n1\t192.168.1.9\t5000",
    },
    CommandDoc {
        name: "terminate",
        usage: "terminate <connection id>",
        description: "Terminate the connection listed under <connection id> by `list`.",
        example: "> terminate 2",
    },
    CommandDoc {
        name: "send",
        usage: "send <connection id> <message>",
        description: "Send <message> to the peer listed under <connection id> by `list`.\n\
                      Messages may contain spaces; keep them under 100 characters.",
        example: "> send 3 Oh! This project is a piece of cake",
    },
    CommandDoc {
        name: "exit",
        usage: "exit",
        description: "Close all connections and terminate this process.",
        example: "> exit",
    },
];

/// Looks up the manual entry for a lowercase command word.
pub fn doc_for(name: &str) -> Option<&'static CommandDoc> {
    COMMANDS.iter().find(|doc| doc.name == name)
}

/// Text printed by `help`.
pub fn help_text(topic: Option<&str>) -> String {
    match topic {
        Some(name) => match doc_for(name) {
            Some(doc) => doc.render(),
            None => format!("Help for command ({name}) not found."),
        },
        None => COMMANDS
            .iter()
            .map(CommandDoc::render)
            .collect::<Vec<_>>()
            .join(&format!("\n{LINE_SEP}\n")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        Command::parse(line).unwrap().unwrap()
    }

    #[test]
    fn test_blank_line_is_ignored() {
        assert_eq!(Command::parse("").unwrap(), None);
        assert_eq!(Command::parse("   \t").unwrap(), None);
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("myip"), Command::MyIp);
        assert_eq!(parse("myport"), Command::MyPort);
        assert_eq!(parse("list"), Command::List);
        assert_eq!(parse("exit"), Command::Exit);
        assert_eq!(parse("help"), Command::Help(None));
        assert_eq!(parse("help Connect"), Command::Help(Some("connect".to_string())));
    }

    #[test]
    fn test_command_word_is_case_insensitive() {
        assert_eq!(parse("LIST"), Command::List);
        assert_eq!(parse("  MyIp  "), Command::MyIp);
    }

    #[test]
    fn test_connect() {
        assert_eq!(
            parse("connect 192.168.1.9 6000"),
            Command::Connect("192.168.1.9:6000".parse().unwrap())
        );
        assert_eq!(
            parse("connect ::1 6000"),
            Command::Connect("[::1]:6000".parse().unwrap())
        );
    }

    #[test]
    fn test_connect_rejects_bad_arguments() {
        for line in [
            "connect",
            "connect 10.0.0.1",
            "connect 10.0.0.1 6000 extra",
            "connect not-an-ip 6000",
            "connect 10.0.0.1 0",
            "connect 10.0.0.1 70000",
        ] {
            assert!(
                matches!(
                    Command::parse(line),
                    Err(CommandError::Malformed {
                        command: "connect",
                        ..
                    })
                ),
                "{line} should be malformed"
            );
        }
    }

    #[test]
    fn test_send_keeps_message_spacing() {
        assert_eq!(
            parse("send 3 Oh!  This project is a piece of cake"),
            Command::Send {
                id: ConnectionId::new(3),
                text: "Oh!  This project is a piece of cake".to_string(),
            }
        );
        assert_eq!(
            parse("SEND 1 Hello World"),
            Command::Send {
                id: ConnectionId::new(1),
                text: "Hello World".to_string(),
            }
        );
    }

    #[test]
    fn test_send_requires_id_and_text() {
        assert!(matches!(
            Command::parse("send"),
            Err(CommandError::Malformed { .. })
        ));
        assert!(matches!(
            Command::parse("send 1"),
            Err(CommandError::Malformed { .. })
        ));
        assert!(matches!(
            Command::parse("send one hello"),
            Err(CommandError::Malformed { .. })
        ));
    }

    #[test]
    fn test_terminate() {
        assert_eq!(parse("terminate 2"), Command::Terminate(ConnectionId::new(2)));
        assert!(matches!(
            Command::parse("terminate x"),
            Err(CommandError::Malformed {
                command: "terminate",
                ..
            })
        ));
        assert!(Command::parse("terminate").is_err());
    }

    #[test]
    fn test_extra_arguments_are_malformed() {
        let err = Command::parse("list all").unwrap_err();
        assert_eq!(err.to_string(), "list takes no arguments\nUsage: list");
    }

    #[test]
    fn test_unknown_command() {
        let err = Command::parse("launch rockets").unwrap_err();
        assert_eq!(err, CommandError::UnknownCommand("launch".to_string()));
        assert_eq!(err.to_string(), "Command: launch does not exist.");
    }

    #[test]
    fn test_from_str() {
        assert_eq!("list".parse::<Command>().unwrap(), Command::List);
        assert!("".parse::<Command>().is_err());
    }

    #[test]
    fn test_help_text() {
        let all = help_text(None);
        for doc in COMMANDS {
            assert!(all.contains(doc.usage), "missing {}", doc.name);
        }
        assert!(help_text(Some("send")).contains("send <connection id> <message>"));
        assert_eq!(help_text(Some("fly")), "Help for command (fly) not found.");
    }

    #[test]
    fn test_every_command_has_a_doc() {
        for name in ["help", "myip", "myport", "connect", "list", "terminate", "send", "exit"] {
            assert!(doc_for(name).is_some(), "{name}");
        }
    }
}
