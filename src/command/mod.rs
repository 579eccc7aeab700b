// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Executable representation of the wire commands.
//!
//! [`Command::execute`] applies a command to a [`Storage`] and produces the
//! reply payload *without* the trailing `\r\n`; the connection appends the
//! terminator before queueing the reply for transmission.

use crate::storage::{Storage, StorageError};

/// A command sent by the client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Reads one or more keys, promoting each hit to the MRU head.
    ///
    /// On the wire: `get <key>+`
    Get { keys: Vec<String> },
    /// As `get`; CAS identifiers are not tracked, so the reply is identical.
    ///
    /// On the wire: `gets <key>+`
    Gets { keys: Vec<String> },
    /// Stores a value unconditionally.
    ///
    /// On the wire: `set <key> <flags> <exptime> <bytes> [noreply]`
    Set {
        key: String,
        bytes: usize,
        noreply: bool,
    },
    /// Stores a value only when the key is absent.
    ///
    /// On the wire: `add <key> <flags> <exptime> <bytes> [noreply]`
    Add {
        key: String,
        bytes: usize,
        noreply: bool,
    },
    /// Stores a value only when the key is already present.
    ///
    /// On the wire: `replace <key> <flags> <exptime> <bytes> [noreply]`
    Replace {
        key: String,
        bytes: usize,
        noreply: bool,
    },
    /// Appends the payload to an existing value.
    ///
    /// On the wire: `append <key> <flags> <exptime> <bytes> [noreply]`
    Append {
        key: String,
        bytes: usize,
        noreply: bool,
    },
    /// Prepends the payload to an existing value.
    ///
    /// On the wire: `prepend <key> <flags> <exptime> <bytes> [noreply]`
    Prepend {
        key: String,
        bytes: usize,
        noreply: bool,
    },
    /// Removes a key. Does not touch the recency of other entries.
    ///
    /// On the wire: `delete <key> [noreply]`
    Delete { key: String, noreply: bool },
    /// Reports entry count and byte accounting.
    ///
    /// On the wire: `stats`
    Stats,
    /// Drops every entry.
    ///
    /// On the wire: `flush_all [delay] [noreply]`
    FlushAll { noreply: bool },
    /// Reports the server version.
    ///
    /// On the wire: `version`
    Version,
    /// Accepted for wire compatibility; the logging level is fixed at
    /// startup.
    ///
    /// On the wire: `verbosity <level> [noreply]`
    Verbosity { noreply: bool },
    /// Asks the server to close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

impl Command {
    /// Number of binary argument bytes announced by the header (without the
    /// `\r\n` trailer).
    pub fn arg_len(&self) -> usize {
        match self {
            Command::Set { bytes, .. }
            | Command::Add { bytes, .. }
            | Command::Replace { bytes, .. }
            | Command::Append { bytes, .. }
            | Command::Prepend { bytes, .. } => *bytes,
            _ => 0,
        }
    }

    /// Whether the client asked for the reply to be suppressed.
    pub fn noreply(&self) -> bool {
        match self {
            Command::Set { noreply, .. }
            | Command::Add { noreply, .. }
            | Command::Replace { noreply, .. }
            | Command::Append { noreply, .. }
            | Command::Prepend { noreply, .. }
            | Command::Delete { noreply, .. }
            | Command::FlushAll { noreply }
            | Command::Verbosity { noreply } => *noreply,
            _ => false,
        }
    }

    pub fn is_quit(&self) -> bool {
        matches!(self, Command::Quit)
    }

    /// Applies the command to `store` and returns the reply payload without
    /// the trailing `\r\n`. Storage failures surface as reply codes, never
    /// as errors.
    pub fn execute(&self, store: &mut dyn Storage, args: &[u8]) -> Vec<u8> {
        match self {
            Command::Get { keys } | Command::Gets { keys } => read_keys(store, keys),
            Command::Set { key, .. } => store_reply(store.put(key.as_bytes(), args)),
            Command::Add { key, .. } => {
                store_reply(store.put_if_absent(key.as_bytes(), args))
            },
            Command::Replace { key, .. } => store_reply(store.set(key.as_bytes(), args)),
            Command::Append { key, .. } => concat_value(store, key, args, false),
            Command::Prepend { key, .. } => concat_value(store, key, args, true),
            Command::Delete { key, .. } => match store.delete(key.as_bytes()) {
                Ok(()) => b"DELETED".to_vec(),
                Err(_) => b"NOT_FOUND".to_vec(),
            },
            Command::Stats => stats_reply(store),
            Command::FlushAll { .. } => {
                store.clear();
                b"OK".to_vec()
            },
            Command::Version => {
                format!("VERSION {}", env!("CARGO_PKG_VERSION")).into_bytes()
            },
            Command::Verbosity { .. } => b"OK".to_vec(),
            Command::Quit => Vec::new(),
        }
    }
}

fn store_reply(result: Result<(), StorageError>) -> Vec<u8> {
    match result {
        Ok(()) => b"STORED".to_vec(),
        Err(_) => b"NOT_STORED".to_vec(),
    }
}

/// `VALUE <key> <flags> <bytes>\r\n<data>` per hit, then `END`. Flags are
/// not stored, so `0` is echoed.
fn read_keys(store: &mut dyn Storage, keys: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for key in keys {
        if let Ok(value) = store.get(key.as_bytes()) {
            out.extend_from_slice(format!("VALUE {key} 0 {}\r\n", value.len()).as_bytes());
            out.extend_from_slice(&value);
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"END");
    out
}

fn concat_value(store: &mut dyn Storage, key: &str, args: &[u8], front: bool) -> Vec<u8> {
    let old = match store.get(key.as_bytes()) {
        Ok(v) => v,
        Err(_) => return b"NOT_STORED".to_vec(),
    };
    let mut merged = Vec::with_capacity(old.len() + args.len());
    if front {
        merged.extend_from_slice(args);
        merged.extend_from_slice(&old);
    } else {
        merged.extend_from_slice(&old);
        merged.extend_from_slice(args);
    }
    store_reply(store.set(key.as_bytes(), &merged))
}

fn stats_reply(store: &mut dyn Storage) -> Vec<u8> {
    format!(
        "STAT curr_items {}\r\nSTAT bytes {}\r\nSTAT limit_maxbytes {}\r\nEND",
        store.len(),
        store.current_size(),
        store.max_size()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LruStorage;

    fn run(store: &mut LruStorage, input: &[u8], args: &[u8]) -> Vec<u8> {
        let mut parser = crate::protocol::Parser::new();
        parser.parse(input).expect("parse failed");
        let (cmd, arg_len) = parser.build().expect("build failed");
        assert_eq!(arg_len, args.len());
        cmd.execute(store, args)
    }

    #[test]
    fn test_set_then_get() {
        let mut store = LruStorage::new(100);
        let reply = run(&mut store, b"set foo 0 0 3\r\n", b"bar");
        assert_eq!(reply, b"STORED");
        let reply = run(&mut store, b"get foo\r\n", b"");
        assert_eq!(reply, b"VALUE foo 0 3\r\nbar\r\nEND");
    }

    #[test]
    fn test_get_missing_key_yields_bare_end() {
        let mut store = LruStorage::new(100);
        let reply = run(&mut store, b"get nope\r\n", b"");
        assert_eq!(reply, b"END");
    }

    #[test]
    fn test_get_multiple_keys_skips_misses() {
        let mut store = LruStorage::new(100);
        run(&mut store, b"set a 0 0 1\r\n", b"1");
        run(&mut store, b"set c 0 0 1\r\n", b"3");
        let reply = run(&mut store, b"get a b c\r\n", b"");
        assert_eq!(reply, b"VALUE a 0 1\r\n1\r\nVALUE c 0 1\r\n3\r\nEND");
    }

    #[test]
    fn test_add_twice_fails_second_time() {
        let mut store = LruStorage::new(100);
        let reply = run(&mut store, b"add foo 0 0 3\r\n", b"bar");
        assert_eq!(reply, b"STORED");
        let reply = run(&mut store, b"add foo 0 0 3\r\n", b"baz");
        assert_eq!(reply, b"NOT_STORED");
    }

    #[test]
    fn test_replace_requires_existing_key() {
        let mut store = LruStorage::new(100);
        let reply = run(&mut store, b"replace foo 0 0 3\r\n", b"bar");
        assert_eq!(reply, b"NOT_STORED");
        run(&mut store, b"set foo 0 0 3\r\n", b"bar");
        let reply = run(&mut store, b"replace foo 0 0 3\r\n", b"qux");
        assert_eq!(reply, b"STORED");
    }

    #[test]
    fn test_append_and_prepend() {
        let mut store = LruStorage::new(100);
        run(&mut store, b"set foo 0 0 3\r\n", b"bar");
        let reply = run(&mut store, b"append foo 0 0 3\r\n", b"baz");
        assert_eq!(reply, b"STORED");
        let reply = run(&mut store, b"prepend foo 0 0 3\r\n", b"qux");
        assert_eq!(reply, b"STORED");
        let reply = run(&mut store, b"get foo\r\n", b"");
        assert_eq!(reply, b"VALUE foo 0 9\r\nquxbarbaz\r\nEND");
    }

    #[test]
    fn test_append_missing_key() {
        let mut store = LruStorage::new(100);
        let reply = run(&mut store, b"append foo 0 0 3\r\n", b"bar");
        assert_eq!(reply, b"NOT_STORED");
    }

    #[test]
    fn test_delete_on_empty_cache() {
        let mut store = LruStorage::new(100);
        let reply = run(&mut store, b"delete foo\r\n", b"");
        assert_eq!(reply, b"NOT_FOUND");
    }

    #[test]
    fn test_oversized_set_is_not_stored() {
        let mut store = LruStorage::new(5);
        let reply = run(&mut store, b"set foo 0 0 16\r\n", b"0123456789abcdef");
        assert_eq!(reply, b"NOT_STORED");
    }

    #[test]
    fn test_flush_all_empties_the_store() {
        let mut store = LruStorage::new(100);
        run(&mut store, b"set foo 0 0 3\r\n", b"bar");
        let reply = run(&mut store, b"flush_all\r\n", b"");
        assert_eq!(reply, b"OK");
        let reply = run(&mut store, b"get foo\r\n", b"");
        assert_eq!(reply, b"END");
    }

    #[test]
    fn test_stats_reflect_store_contents() {
        let mut store = LruStorage::new(100);
        run(&mut store, b"set foo 0 0 3\r\n", b"bar");
        let reply = run(&mut store, b"stats\r\n", b"");
        assert_eq!(
            reply,
            b"STAT curr_items 1\r\nSTAT bytes 6\r\nSTAT limit_maxbytes 100\r\nEND"
        );
    }

    #[test]
    fn test_version_and_verbosity() {
        let mut store = LruStorage::new(100);
        let reply = run(&mut store, b"version\r\n", b"");
        assert!(reply.starts_with(b"VERSION "));
        let reply = run(&mut store, b"verbosity 1\r\n", b"");
        assert_eq!(reply, b"OK");
    }
}
