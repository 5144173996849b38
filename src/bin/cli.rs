//! tinyredis interactive client.
//!
//! A small REPL over the framed wire protocol: reads a line, splits the
//! command word from the statement, tags it, and prints whatever the server
//! answers. `SELECT` is handled locally — the chosen id is stamped into the
//! header of every following request, which is the whole of the protocol's
//! session state.

use std::io::{self, BufRead, Read, Write};
use std::net::TcpStream;
use tinyredis::protocol::{Command, Frame};

/// Replies never exceed a request's value by more than the reply decoration,
/// and requests are bounded by the line buffer; one read this size always
/// drains a reply.
const REPLY_BUFFER_SIZE: usize = 64 * 1024;

fn main() -> anyhow::Result<()> {
    shield_signals();

    let mut args = std::env::args().skip(1);
    let address = args
        .next()
        .unwrap_or_else(|| format!("{}:{}", tinyredis::DEFAULT_HOST, tinyredis::DEFAULT_PORT));

    let mut connection = TcpStream::connect(&address)?;
    let peer = connection.peer_addr()?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut db: u64 = 0;

    loop {
        if db == 0 {
            print!("tinyRedis {}:{}> ", peer.ip(), peer.port());
        } else {
            print!("tinyRedis {}:{}[{}]> ", peer.ip(), peer.port(), db);
        }
        io::stdout().flush()?;

        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        if line.is_empty() {
            continue;
        }
        if line == "QUIT" {
            println!("OK");
            break;
        }

        let request = match format_request(&line, &mut db) {
            Ok(request) => request,
            Err(message) => {
                println!("(error) {}", message);
                continue;
            }
        };

        connection.write_all(&request)?;

        let mut reply = vec![0u8; REPLY_BUFFER_SIZE];
        let length = connection.read(&mut reply)?;
        if length == 0 {
            println!("(error) server closed the connection");
            break;
        }
        println!("{}", String::from_utf8_lossy(&reply[..length]));
    }

    Ok(())
}

/// Builds the frame for one input line, tracking the selected database.
fn format_request(line: &str, db: &mut u64) -> Result<Vec<u8>, &'static str> {
    let (word, statement) = match line.split_once(' ') {
        Some(parts) => parts,
        None => (line, ""),
    };

    let command = Command::from_name(word).ok_or("unknown command")?;

    let mut statement = statement;
    if command == Command::Select {
        // The id rides in the frame header; the statement stays empty and
        // the prompt reflects the selection from here on.
        *db = statement.trim().parse().map_err(|_| "syntax")?;
        statement = "";
    }

    Ok(Frame::encode(command, *db, statement.as_bytes()))
}

/// A stray Ctrl-C must not kill the REPL; QUIT is the exit path.
fn shield_signals() {
    // Safety: installing SIG_IGN carries no handler code at all.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
}
