// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Incremental framer for the memcached text protocol.
//!
//! The parser is fed arbitrary byte chunks and accumulates one header line
//! at a time. [`Parser::parse`] reports how many input bytes it consumed and
//! whether a full line is buffered; [`Parser::build`] then tokenises the
//! line into a [`Command`] plus the number of binary argument bytes that
//! still have to be taken from the stream. [`Parser::reset`] prepares the
//! parser for the next command.

use thiserror::Error;

use crate::command::Command;

/// Upper bound on a single command line. Anything longer is a protocol
/// violation, not a legitimate command.
const MAX_LINE: usize = 2048;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("command line exceeds {MAX_LINE} bytes")]
    LineTooLong,

    #[error("command line is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown command verb: {0:?}")]
    UnknownCommand(String),

    #[error("malformed arguments for {verb}")]
    BadArguments { verb: &'static str },

    #[error("no complete command line buffered")]
    Incomplete,
}

#[derive(Debug, Default)]
pub struct Parser {
    line: Vec<u8>,
    complete: bool,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes input up to and including the first `\n`. Returns the number
    /// of bytes taken and whether a complete header line is now buffered.
    pub fn parse(&mut self, input: &[u8]) -> Result<(usize, bool), ParseError> {
        if self.complete {
            return Ok((0, true));
        }
        let consumed = match input.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                self.line.extend_from_slice(&input[..=pos]);
                self.complete = true;
                pos + 1
            },
            None => {
                self.line.extend_from_slice(input);
                input.len()
            },
        };
        if self.line.len() > MAX_LINE {
            return Err(ParseError::LineTooLong);
        }
        Ok((consumed, self.complete))
    }

    /// Tokenises the buffered header line. For storage commands the second
    /// element is the announced argument length; the `\r\n` trailer after
    /// the argument block is accounted for by the caller.
    pub fn build(&self) -> Result<(Command, usize), ParseError> {
        if !self.complete {
            return Err(ParseError::Incomplete);
        }
        let line = std::str::from_utf8(&self.line)
            .map_err(|_| ParseError::InvalidUtf8)?
            .trim_end_matches(['\r', '\n']);
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or("");
        let rest: Vec<&str> = tokens.collect();

        let command = match verb {
            "get" => Command::Get {
                keys: parse_keys(&rest, "get")?,
            },
            "gets" => Command::Gets {
                keys: parse_keys(&rest, "gets")?,
            },
            "set" => parse_store(&rest, "set", |key, bytes, noreply| Command::Set {
                key,
                bytes,
                noreply,
            })?,
            "add" => parse_store(&rest, "add", |key, bytes, noreply| Command::Add {
                key,
                bytes,
                noreply,
            })?,
            "replace" => {
                parse_store(&rest, "replace", |key, bytes, noreply| Command::Replace {
                    key,
                    bytes,
                    noreply,
                })?
            },
            "append" => {
                parse_store(&rest, "append", |key, bytes, noreply| Command::Append {
                    key,
                    bytes,
                    noreply,
                })?
            },
            "prepend" => {
                parse_store(&rest, "prepend", |key, bytes, noreply| Command::Prepend {
                    key,
                    bytes,
                    noreply,
                })?
            },
            "delete" => parse_delete(&rest)?,
            "stats" => Command::Stats,
            "flush_all" => parse_flush_all(&rest)?,
            "version" => Command::Version,
            "verbosity" => parse_verbosity(&rest)?,
            "quit" => Command::Quit,
            other => return Err(ParseError::UnknownCommand(other.to_string())),
        };

        let arg_remains = command.arg_len();
        Ok((command, arg_remains))
    }

    pub fn reset(&mut self) {
        self.line.clear();
        self.complete = false;
    }
}

fn parse_keys(rest: &[&str], verb: &'static str) -> Result<Vec<String>, ParseError> {
    if rest.is_empty() {
        return Err(ParseError::BadArguments { verb });
    }
    Ok(rest.iter().map(|k| (*k).to_string()).collect())
}

/// Storage header: `<verb> <key> <flags> <exptime> <bytes> [noreply]`.
/// Flags and exptime are validated as integers and otherwise ignored; the
/// storage holds raw bytes only.
fn parse_store(
    rest: &[&str],
    verb: &'static str,
    make: impl FnOnce(String, usize, bool) -> Command,
) -> Result<Command, ParseError> {
    let bad = || ParseError::BadArguments { verb };
    let (args, noreply) = split_noreply(rest);
    if args.len() != 4 {
        return Err(bad());
    }
    let key = args[0].to_string();
    let _flags: u32 = args[1].parse().map_err(|_| bad())?;
    let _exptime: i64 = args[2].parse().map_err(|_| bad())?;
    let bytes: usize = args[3].parse().map_err(|_| bad())?;
    Ok(make(key, bytes, noreply))
}

fn parse_delete(rest: &[&str]) -> Result<Command, ParseError> {
    let (args, noreply) = split_noreply(rest);
    if args.len() != 1 {
        return Err(ParseError::BadArguments { verb: "delete" });
    }
    Ok(Command::Delete {
        key: args[0].to_string(),
        noreply,
    })
}

fn parse_flush_all(rest: &[&str]) -> Result<Command, ParseError> {
    let (args, noreply) = split_noreply(rest);
    // An optional numeric delay is accepted for wire compatibility and
    // applied immediately (the store has no timers).
    match args {
        [] => Ok(Command::FlushAll { noreply }),
        [delay] => {
            let _delay: u64 = delay
                .parse()
                .map_err(|_| ParseError::BadArguments { verb: "flush_all" })?;
            Ok(Command::FlushAll { noreply })
        },
        _ => Err(ParseError::BadArguments { verb: "flush_all" }),
    }
}

fn parse_verbosity(rest: &[&str]) -> Result<Command, ParseError> {
    let (args, noreply) = split_noreply(rest);
    if args.len() != 1 {
        return Err(ParseError::BadArguments { verb: "verbosity" });
    }
    let _level: u64 = args[0]
        .parse()
        .map_err(|_| ParseError::BadArguments { verb: "verbosity" })?;
    Ok(Command::Verbosity { noreply })
}

fn split_noreply<'a>(rest: &'a [&'a str]) -> (&'a [&'a str], bool) {
    match rest.split_last() {
        Some((&"noreply", head)) => (head, true),
        _ => (rest, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_one(input: &[u8]) -> (Command, usize) {
        let mut parser = Parser::new();
        let (consumed, complete) = parser.parse(input).expect("parse failed");
        assert_eq!(consumed, input.len());
        assert!(complete);
        parser.build().expect("build failed")
    }

    #[test]
    fn test_parse_get_single_key() {
        let (cmd, arg) = build_one(b"get foo\r\n");
        assert_eq!(cmd, Command::Get {
            keys: vec!["foo".to_string()]
        });
        assert_eq!(arg, 0);
    }

    #[test]
    fn test_parse_get_multiple_keys() {
        let (cmd, _) = build_one(b"get foo bar baz\r\n");
        assert_eq!(cmd, Command::Get {
            keys: vec!["foo".to_string(), "bar".to_string(), "baz".to_string()]
        });
    }

    #[test]
    fn test_parse_set_header() {
        let (cmd, arg) = build_one(b"set foo 0 0 3\r\n");
        assert_eq!(cmd, Command::Set {
            key: "foo".to_string(),
            bytes: 3,
            noreply: false
        });
        assert_eq!(arg, 3);
    }

    #[test]
    fn test_parse_set_noreply() {
        let (cmd, _) = build_one(b"set foo 42 100 3 noreply\r\n");
        assert_eq!(cmd, Command::Set {
            key: "foo".to_string(),
            bytes: 3,
            noreply: true
        });
        assert!(cmd.noreply());
    }

    #[test]
    fn test_parse_incremental_byte_at_a_time() {
        let input = b"delete foo\r\n";
        let mut parser = Parser::new();
        let mut complete = false;
        for (i, byte) in input.iter().enumerate() {
            let (consumed, done) = parser
                .parse(std::slice::from_ref(byte))
                .expect("parse failed");
            assert_eq!(consumed, 1, "byte {i} not consumed");
            complete = done;
        }
        assert!(complete);
        let (cmd, arg) = parser.build().expect("build failed");
        assert_eq!(cmd, Command::Delete {
            key: "foo".to_string(),
            noreply: false
        });
        assert_eq!(arg, 0);
    }

    #[test]
    fn test_parse_stops_after_newline() {
        // Bytes after the first newline belong to the next command.
        let mut parser = Parser::new();
        let (consumed, complete) = parser.parse(b"version\r\nget foo\r\n").expect("parse");
        assert_eq!(consumed, 9);
        assert!(complete);
        let (cmd, _) = parser.build().expect("build failed");
        assert_eq!(cmd, Command::Version);
    }

    #[test]
    fn test_garbage_line_is_rejected() {
        let mut parser = Parser::new();
        parser.parse(b"~~~\r\n").expect("framing still succeeds");
        assert!(matches!(
            parser.build(),
            Err(ParseError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_malformed_store_header_is_rejected() {
        let mut parser = Parser::new();
        parser.parse(b"set foo 0 0 notanumber\r\n").expect("framing");
        assert_eq!(
            parser.build(),
            Err(ParseError::BadArguments { verb: "set" })
        );
    }

    #[test]
    fn test_build_before_complete_line() {
        let mut parser = Parser::new();
        let (consumed, complete) = parser.parse(b"get fo").expect("parse failed");
        assert_eq!(consumed, 6);
        assert!(!complete);
        assert_eq!(parser.build(), Err(ParseError::Incomplete));
    }

    #[test]
    fn test_overlong_line_is_rejected() {
        let mut parser = Parser::new();
        let garbage = vec![b'a'; MAX_LINE + 1];
        assert_eq!(parser.parse(&garbage), Err(ParseError::LineTooLong));
    }

    #[test]
    fn test_reset_clears_buffered_line() {
        let mut parser = Parser::new();
        parser.parse(b"version\r\n").expect("parse failed");
        parser.reset();
        parser.parse(b"quit\r\n").expect("parse failed");
        let (cmd, _) = parser.build().expect("build failed");
        assert_eq!(cmd, Command::Quit);
    }

    #[test]
    fn test_flush_all_with_delay() {
        let (cmd, arg) = build_one(b"flush_all 30\r\n");
        assert_eq!(cmd, Command::FlushAll { noreply: false });
        assert_eq!(arg, 0);
    }

    #[test]
    fn test_verbosity_and_quit() {
        let (cmd, _) = build_one(b"verbosity 1\r\n");
        assert_eq!(cmd, Command::Verbosity { noreply: false });
        let (cmd, _) = build_one(b"quit\r\n");
        assert_eq!(cmd, Command::Quit);
    }
}
