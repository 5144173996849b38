//! Command Dispatcher
//!
//! One framed request in, one reply out. The handler decodes the frame
//! header, resolves the target database, parses the statement with the
//! command's own grammar, and renders the reply bytes.
//!
//! ## Dispatch rules
//!
//! - `SELECT` creates the database on first use and answers a bare `OK`;
//!   the client tracks the selected id locally and stamps it into every
//!   later frame.
//! - Every other command requires the id to exist already; otherwise the
//!   reply is `(error) no such database`.
//! - Read-only commands (`GET`, `GETRANGE`, `EXISTS`, `DUMP`, `TYPE`) take
//!   the database's shared lock; mutations (`DEL`, `SET`, `RENAME`,
//!   `RENAMENX`) take the exclusive lock; `MOVE` takes both ends' exclusive
//!   locks in id order.
//!
//! ## Statement grammar
//!
//! Statements are space-separated UTF-8 tokens. `SET` values are
//! double-quoted and internal quotes are not escaped; anything else after
//! the key is a syntax error. `GETRANGE` bounds are signed and inclusive,
//! negatives counting from the end of the value.
//!
//! The handler never fails across the scheduler boundary: every domain
//! error becomes an `(error) …` reply.

use crate::protocol::{Command, Frame, FrameError, Reply};
use crate::storage::{Database, Entry, Registry};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Executes framed requests against the shared registry.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    registry: Arc<Registry>,
}

impl CommandHandler {
    /// Creates a handler over the shared registry.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Processes one request unit and returns the raw reply bytes.
    pub fn query(&self, request: &[u8]) -> Vec<u8> {
        self.dispatch(request).into_bytes()
    }

    fn dispatch(&self, request: &[u8]) -> Reply {
        let frame = match Frame::parse(request) {
            Ok(frame) => frame,
            Err(FrameError::UnknownTag(_)) => return Reply::error("unknown command"),
            Err(FrameError::Truncated(_)) => return Reply::error("malformed frame"),
        };

        debug!(command = ?frame.command, db = frame.db, "dispatch");

        if frame.command == Command::Select {
            self.registry.select(frame.db);
            return Reply::Simple("OK");
        }

        let database = match self.registry.get(frame.db) {
            Some(database) => database,
            None => return Reply::error("no such database"),
        };

        let statement = match std::str::from_utf8(&frame.statement) {
            Ok(statement) => statement,
            Err(_) => return Reply::error("syntax"),
        };

        match frame.command {
            Command::Del => self.del(&database, statement),
            Command::Dump => self.dump(&database, statement),
            Command::Exists => self.exists(&database, statement),
            Command::Move => self.move_key(&database, statement),
            Command::Rename => self.rename(&database, statement),
            Command::RenameNx => self.rename_nx(&database, statement),
            Command::Type => self.key_type(&database, statement),
            Command::Set => self.set(&database, statement),
            Command::Get => self.get(&database, statement),
            Command::GetRange => self.get_range(&database, statement),
            // Reserved tags decode but have no behavior in v0.
            _ => Reply::error("unknown command"),
        }
    }

    /// DEL key [key ...] — removes keys, answers how many were present.
    fn del(&self, database: &Database, statement: &str) -> Reply {
        let removed = database.remove_keys(statement.split(' ').map(str::as_bytes));
        Reply::Integer(removed)
    }

    /// DUMP key — the entry's serialization bytes in quotes, or nil.
    fn dump(&self, database: &Database, statement: &str) -> Reply {
        match database.find(statement.as_bytes()) {
            Some(entry) => Reply::quoted(entry.serialize()),
            None => Reply::Nil,
        }
    }

    /// EXISTS key [key ...] — counts present keys, duplicates included.
    fn exists(&self, database: &Database, statement: &str) -> Reply {
        let present = database.count_keys(statement.split(' ').map(str::as_bytes));
        Reply::Integer(present)
    }

    /// MOVE key targetId — transfers the key when the target database
    /// exists, holds no such key, and the source does.
    fn move_key(&self, database: &Database, statement: &str) -> Reply {
        let (key, rest) = match statement.split_once(' ') {
            Some(parts) => parts,
            None => return Reply::error("syntax"),
        };
        let target_id: u64 = match rest.parse() {
            Ok(id) => id,
            Err(_) => return Reply::error("syntax"),
        };

        let moved = match self.registry.get(target_id) {
            Some(target) => Database::transfer(database, &target, key.as_bytes()),
            None => false,
        };
        Reply::Integer(moved as u64)
    }

    /// RENAME key newkey — overwrites the destination.
    fn rename(&self, database: &Database, statement: &str) -> Reply {
        let (key, new_key) = match statement.split_once(' ') {
            Some(parts) => parts,
            None => return Reply::error("syntax"),
        };
        if database.rename(key.as_bytes(), new_key.as_bytes()) {
            Reply::ok()
        } else {
            Reply::error("no such key")
        }
    }

    /// RENAMENX key newkey — renames only onto a free destination.
    fn rename_nx(&self, database: &Database, statement: &str) -> Reply {
        let (key, new_key) = match statement.split_once(' ') {
            Some(parts) => parts,
            None => return Reply::error("syntax"),
        };
        let renamed = database.rename_exclusive(key.as_bytes(), new_key.as_bytes());
        Reply::Integer(renamed as u64)
    }

    /// TYPE key — the quoted type name, "none" for missing keys.
    fn key_type(&self, database: &Database, statement: &str) -> Reply {
        let name = match database.find(statement.as_bytes()) {
            Some(entry) => entry.kind().name(),
            None => "none",
        };
        Reply::quoted(name)
    }

    /// SET key "value" — stores a string entry; the value must be quoted.
    fn set(&self, database: &Database, statement: &str) -> Reply {
        let (key, rest) = match statement.split_once(' ') {
            Some(parts) => parts,
            None => return Reply::error("syntax"),
        };
        let value = match quoted_value(rest) {
            Some(value) => value,
            None => return Reply::error("syntax"),
        };

        database.insert(Entry::string(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        ));
        Reply::ok()
    }

    /// GET key — the quoted string value, nil, or WRONGTYPE.
    fn get(&self, database: &Database, statement: &str) -> Reply {
        match database.find(statement.as_bytes()) {
            Some(entry) => match entry.as_string() {
                Some(value) => Reply::Quoted(value.clone()),
                None => Reply::error(
                    "WRONGTYPE Operation against a key holding the wrong kind of value",
                ),
            },
            None => Reply::Nil,
        }
    }

    /// GETRANGE key start end — inclusive signed bounds, negatives from the
    /// end; an empty or inverted range answers `""`.
    fn get_range(&self, database: &Database, statement: &str) -> Reply {
        let mut tokens = statement.split(' ');
        let key = match tokens.next() {
            Some(key) => key,
            None => return Reply::error("syntax"),
        };
        let bounds: Option<(i64, i64)> = (|| {
            let start = tokens.next()?.parse().ok()?;
            let end = tokens.next()?.parse().ok()?;
            tokens.next().is_none().then_some((start, end))
        })();
        let (start, end) = match bounds {
            Some(bounds) => bounds,
            None => return Reply::error("syntax"),
        };

        let value = database
            .find(key.as_bytes())
            .and_then(|entry| entry.as_string().cloned());

        match value {
            Some(value) => Reply::Quoted(slice_range(&value, start, end)),
            None => Reply::quoted(""),
        }
    }
}

/// Cuts an inclusive `[start, end]` window out of `value`.
///
/// Negative bounds count from the end (`-1` is the last byte); the window is
/// clamped into the value and an inverted window is empty.
fn slice_range(value: &Bytes, start: i64, end: i64) -> Bytes {
    let len = value.len() as i64;
    let start = if start < 0 { len + start } else { start }.max(0);
    let end = if end < 0 { len + end } else { end }.min(len - 1);

    if start > end || start >= len {
        return Bytes::new();
    }
    value.slice(start as usize..=end as usize)
}

/// Strips the double quotes around a SET value, rejecting anything that is
/// not `"..."`. Interior quotes pass through unescaped.
fn quoted_value(token: &str) -> Option<&str> {
    let rest = token.strip_prefix('"')?;
    rest.strip_suffix('"')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn handler() -> (TempDir, CommandHandler) {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Registry::open(dir.path()).unwrap());
        (dir, CommandHandler::new(registry))
    }

    fn run(handler: &CommandHandler, command: Command, db: u64, statement: &str) -> Vec<u8> {
        handler.query(&Frame::encode(command, db, statement.as_bytes()))
    }

    #[test]
    fn test_select_set_get() {
        let (_dir, handler) = handler();

        assert_eq!(run(&handler, Command::Select, 0, ""), b"OK");
        assert_eq!(run(&handler, Command::Set, 0, "foo \"bar\""), b"\"OK\"");
        assert_eq!(run(&handler, Command::Get, 0, "foo"), b"\"bar\"");
    }

    #[test]
    fn test_get_missing_and_type_missing() {
        let (_dir, handler) = handler();

        assert_eq!(run(&handler, Command::Get, 0, "missing"), b"(nil)");
        assert_eq!(run(&handler, Command::Type, 0, "missing"), b"\"none\"");
    }

    #[test]
    fn test_type_of_string() {
        let (_dir, handler) = handler();
        run(&handler, Command::Set, 0, "k \"v\"");
        assert_eq!(run(&handler, Command::Type, 0, "k"), b"\"string\"");
    }

    #[test]
    fn test_getrange() {
        let (_dir, handler) = handler();
        assert_eq!(run(&handler, Command::Set, 0, "k \"hello\""), b"\"OK\"");

        assert_eq!(run(&handler, Command::GetRange, 0, "k 0 -1"), b"\"hello\"");
        assert_eq!(run(&handler, Command::GetRange, 0, "k 1 3"), b"\"ell\"");
        assert_eq!(run(&handler, Command::GetRange, 0, "k -3 -2"), b"\"ll\"");
        // Inverted window.
        assert_eq!(run(&handler, Command::GetRange, 0, "k 3 1"), b"\"\"");
        // Negative end beyond the start of the string.
        assert_eq!(run(&handler, Command::GetRange, 0, "k 0 -10"), b"\"\"");
        // Start past the end.
        assert_eq!(run(&handler, Command::GetRange, 0, "k 10 20"), b"\"\"");
        // Absent key.
        assert_eq!(run(&handler, Command::GetRange, 0, "nope 0 -1"), b"\"\"");
        // Bad bounds.
        assert_eq!(
            run(&handler, Command::GetRange, 0, "k one two"),
            b"(error) syntax"
        );
    }

    #[test]
    fn test_exists_and_del_counts() {
        let (_dir, handler) = handler();
        run(&handler, Command::Set, 0, "a \"1\"");
        run(&handler, Command::Set, 0, "b \"2\"");

        assert_eq!(run(&handler, Command::Exists, 0, "a b c"), b"(integer) 2");
        assert_eq!(run(&handler, Command::Exists, 0, "a a"), b"(integer) 2");
        assert_eq!(run(&handler, Command::Del, 0, "a c"), b"(integer) 1");
        assert_eq!(run(&handler, Command::Exists, 0, "a"), b"(integer) 0");
    }

    #[test]
    fn test_del_then_exists_is_zero() {
        let (_dir, handler) = handler();
        run(&handler, Command::Set, 0, "k \"v\"");
        assert_eq!(run(&handler, Command::Del, 0, "k"), b"(integer) 1");
        assert_eq!(run(&handler, Command::Exists, 0, "k"), b"(integer) 0");
    }

    #[test]
    fn test_move_between_databases() {
        let (_dir, handler) = handler();
        run(&handler, Command::Set, 0, "k \"x\"");

        assert_eq!(run(&handler, Command::Move, 0, "k 1"), b"(integer) 1");
        assert_eq!(run(&handler, Command::Exists, 0, "k"), b"(integer) 0");
        assert_eq!(run(&handler, Command::Get, 1, "k"), b"\"x\"");

        // Occupied destination: neither side changes.
        run(&handler, Command::Set, 0, "k \"second\"");
        assert_eq!(run(&handler, Command::Move, 0, "k 1"), b"(integer) 0");
        assert_eq!(run(&handler, Command::Get, 0, "k"), b"\"second\"");
        assert_eq!(run(&handler, Command::Get, 1, "k"), b"\"x\"");

        // Unknown target database.
        assert_eq!(run(&handler, Command::Move, 0, "k 999"), b"(integer) 0");
    }

    #[test]
    fn test_rename() {
        let (_dir, handler) = handler();
        run(&handler, Command::Set, 0, "k \"v\"");

        assert_eq!(run(&handler, Command::Rename, 0, "k j"), b"\"OK\"");
        assert_eq!(run(&handler, Command::Get, 0, "j"), b"\"v\"");
        assert_eq!(
            run(&handler, Command::Rename, 0, "nope j"),
            b"(error) no such key"
        );
    }

    #[test]
    fn test_renamenx_noop_when_destination_exists() {
        let (_dir, handler) = handler();
        run(&handler, Command::Set, 0, "a \"1\"");
        run(&handler, Command::Set, 0, "b \"2\"");

        assert_eq!(run(&handler, Command::RenameNx, 0, "a b"), b"(integer) 0");
        assert_eq!(run(&handler, Command::Get, 0, "a"), b"\"1\"");
        assert_eq!(run(&handler, Command::Get, 0, "b"), b"\"2\"");

        assert_eq!(run(&handler, Command::RenameNx, 0, "a c"), b"(integer) 1");
        assert_eq!(run(&handler, Command::Get, 0, "c"), b"\"1\"");
    }

    #[test]
    fn test_dump() {
        let (_dir, handler) = handler();
        run(&handler, Command::Set, 0, "k \"v\"");

        let mut expected = vec![b'"'];
        expected.extend_from_slice(&Entry::string("k", "v").serialize());
        expected.push(b'"');
        assert_eq!(run(&handler, Command::Dump, 0, "k"), expected);

        assert_eq!(run(&handler, Command::Dump, 0, "missing"), b"(nil)");
    }

    #[test]
    fn test_select_creates_database() {
        let (_dir, handler) = handler();

        assert_eq!(
            run(&handler, Command::Get, 77, "k"),
            b"(error) no such database"
        );
        assert_eq!(run(&handler, Command::Select, 77, ""), b"OK");
        assert_eq!(run(&handler, Command::Get, 77, "k"), b"(nil)");
    }

    #[test]
    fn test_set_requires_quoted_value() {
        let (_dir, handler) = handler();

        assert_eq!(run(&handler, Command::Set, 0, "k bare"), b"(error) syntax");
        assert_eq!(run(&handler, Command::Set, 0, "k \""), b"(error) syntax");
        assert_eq!(run(&handler, Command::Set, 0, "k"), b"(error) syntax");
        assert_eq!(run(&handler, Command::Set, 0, "k \"\""), b"\"OK\"");
        assert_eq!(run(&handler, Command::Get, 0, "k"), b"\"\"");
    }

    #[test]
    fn test_set_value_with_spaces() {
        let (_dir, handler) = handler();
        assert_eq!(
            run(&handler, Command::Set, 0, "k \"two words\""),
            b"\"OK\""
        );
        assert_eq!(run(&handler, Command::Get, 0, "k"), b"\"two words\"");
    }

    #[test]
    fn test_unknown_and_reserved_commands() {
        let (_dir, handler) = handler();

        assert_eq!(
            run(&handler, Command::Incr, 0, "counter"),
            b"(error) unknown command"
        );

        let mut raw = Frame::encode(Command::Get, 0, b"k");
        raw[0] = 0xEE;
        assert_eq!(handler.query(&raw), b"(error) unknown command");
    }

    #[test]
    fn test_malformed_frame() {
        let (_dir, handler) = handler();
        assert_eq!(handler.query(&[7, 0, 0]), b"(error) malformed frame");
    }

    #[test]
    fn test_concurrent_set_get_never_tears() {
        use std::thread;

        let (_dir, handler) = handler();
        let images = ["aaaaaaaa", "bbbbbbbb"];

        let mut handles = vec![];
        for image in images {
            let handler = handler.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    run(&handler, Command::Set, 0, &format!("k \"{}\"", image));
                }
            }));
        }
        {
            let handler = handler.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let reply = run(&handler, Command::Get, 0, "k");
                    assert!(
                        reply == b"(nil)"
                            || reply == b"\"aaaaaaaa\""
                            || reply == b"\"bbbbbbbb\"",
                        "torn read: {:?}",
                        String::from_utf8_lossy(&reply)
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
