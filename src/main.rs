//! emberdb shell - create or open a database and drive it interactively.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use emberdb::{Database, IsolationLevel, Options, RecordId, Xid};

/// Single-file transactional storage engine.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Database path prefix (files <path>.xid, <path>.log, <path>.db)
    path: PathBuf,

    /// Create a new database instead of opening an existing one
    #[arg(long)]
    create: bool,

    /// Page cache budget, e.g. 64MB, 1GB or a raw byte count
    #[arg(long, default_value = "64MB")]
    mem: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let options = Options {
        cache_bytes: parse_mem(&args.mem)?,
    };

    let db = if args.create {
        Database::create(&args.path, options).context("failed to create database")?
    } else {
        Database::open(&args.path, options).context("failed to open database")?
    };

    println!("emberdb shell - commands: begin [rr] | commit | abort | insert <text> | read <id> | delete <id> | quit");
    let result = shell(&db);
    db.close().context("failed to close database")?;
    result
}

/// Parses a memory budget like "64MB", "1GB", "512KB" or raw bytes.
fn parse_mem(s: &str) -> Result<usize> {
    let s = s.trim();
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let n: usize = digits.parse().with_context(|| format!("bad memory size: {s}"))?;
    let factor = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        other => bail!("unknown memory unit: {other}"),
    };
    Ok(n * factor)
}

fn shell(db: &Database) -> Result<()> {
    let stdin = std::io::stdin();
    let mut current: Option<Xid> = None;

    print!("> ");
    std::io::stdout().flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        match run_command(db, &mut current, line.trim()) {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => println!("error: {e}"),
        }
        print!("> ");
        std::io::stdout().flush()?;
    }

    if let Some(xid) = current {
        println!("aborting open transaction {xid}");
        db.abort(xid)?;
    }
    Ok(())
}

fn run_command(db: &Database, current: &mut Option<Xid>, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(false);
    };
    let rest: Vec<&str> = parts.collect();

    match cmd {
        "quit" | "exit" => return Ok(true),
        "begin" => {
            if current.is_some() {
                bail!("a transaction is already open");
            }
            let level = match rest.first() {
                Some(&"rr") => IsolationLevel::RepeatableRead,
                _ => IsolationLevel::ReadCommitted,
            };
            let xid = db.begin(level)?;
            *current = Some(xid);
            println!("{xid}");
        }
        "commit" => {
            let xid = current.take().context("no open transaction")?;
            db.commit(xid)?;
            println!("committed {xid}");
        }
        "abort" => {
            let xid = current.take().context("no open transaction")?;
            db.abort(xid)?;
            println!("aborted {xid}");
        }
        "insert" => {
            let xid = current.context("no open transaction")?;
            let data = rest.join(" ");
            let id = db.insert(xid, data.as_bytes())?;
            println!("{}", id.value());
        }
        "read" => {
            let xid = current.context("no open transaction")?;
            let id = parse_id(&rest)?;
            match db.read(xid, id)? {
                Some(data) => println!("{}", String::from_utf8_lossy(&data)),
                None => println!("(absent)"),
            }
        }
        "delete" => {
            let xid = current.context("no open transaction")?;
            let id = parse_id(&rest)?;
            println!("{}", db.delete(xid, id)?);
        }
        other => bail!("unknown command: {other}"),
    }
    Ok(false)
}

fn parse_id(rest: &[&str]) -> Result<RecordId> {
    let raw = rest.first().context("missing record id")?;
    let value: u64 = raw.parse().with_context(|| format!("bad record id: {raw}"))?;
    Ok(RecordId(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mem() {
        assert_eq!(parse_mem("4096").unwrap(), 4096);
        assert_eq!(parse_mem("64MB").unwrap(), 64 << 20);
        assert_eq!(parse_mem("1GB").unwrap(), 1 << 30);
        assert_eq!(parse_mem("512KB").unwrap(), 512 << 10);
        assert!(parse_mem("12XB").is_err());
        assert!(parse_mem("").is_err());
    }
}
