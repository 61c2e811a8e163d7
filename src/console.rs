//! Line commands accepted by the binary on stdin

use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect { host: Option<String>, port: Option<u16> },
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
    UnsubscribeAll,
    Publish { topic: String, body: String },
    Toggle(String),
    Status,
    Help,
    Quit,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

pub const HELP: &str = "\
commands:
  connect [host] [port]   open a session (defaults from config)
  disconnect              close the session
  sub <topic>             subscribe
  unsub <topic>           unsubscribe
  unsub-all               unsubscribe everything and disconnect
  pub <topic> <body...>   publish a raw body
  toggle <device>         send a toggle command
  status                  print the session status
  quit                    leave";

/// Parses one line; `Ok(None)` for blank lines
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb {
        "connect" => {
            let mut parts = rest.split_whitespace();
            let host = parts.next().map(str::to_string);
            let port = parts
                .next()
                .map(|p| {
                    p.parse::<u16>()
                        .map_err(|_| ParseError(format!("invalid port: {}", p)))
                })
                .transpose()?;
            ConsoleCommand::Connect { host, port }
        }
        "disconnect" => ConsoleCommand::Disconnect,
        "sub" => ConsoleCommand::Subscribe(single_arg(verb, rest)?),
        "unsub" => ConsoleCommand::Unsubscribe(single_arg(verb, rest)?),
        "unsub-all" => ConsoleCommand::UnsubscribeAll,
        "pub" => match rest.split_once(char::is_whitespace) {
            Some((topic, body)) => ConsoleCommand::Publish {
                topic: topic.to_string(),
                body: body.trim().to_string(),
            },
            None => return Err(ParseError("usage: pub <topic> <body>".to_string())),
        },
        "toggle" => ConsoleCommand::Toggle(single_arg(verb, rest)?),
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(ParseError(format!("unknown command: {}", other))),
    };
    Ok(Some(command))
}

fn single_arg(verb: &str, rest: &str) -> Result<String, ParseError> {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(arg), None) => Ok(arg.to_string()),
        _ => Err(ParseError(format!("usage: {} <arg>", verb))),
    }
}
