//! Line-oriented picker and one-shot listing over a [`BrowseSession`]

use anyhow::{bail, Context, Result};
use crossterm::style::{Color, Stylize};
use std::io::{BufRead, Write};
use std::path::Path;

use crate::browse::BrowseSession;
use crate::progress::{prettify_size, Reporter};
use crate::protocol_core::DirEntry;

const HELP: &str = "commands: ls, cd NAME, up, get NAME, pwd, help, quit";

/// Render a listing the way `ls -l` would, directories highlighted.
pub fn format_listing(entries: &[DirEntry], color: bool) -> String {
    let mut out = String::new();
    for e in entries {
        let name = if e.is_dir() {
            format!("{}/", e.name)
        } else {
            e.name.clone()
        };
        let name = if color && e.is_dir() {
            name.with(Color::Blue).bold().to_string()
        } else {
            name
        };
        out.push_str(&format!("{} {}\n", e.mode_string(), name));
    }
    out
}

/// Listing as pretty JSON
pub fn listing_json(entries: &[DirEntry]) -> Result<String> {
    serde_json::to_string_pretty(entries).context("encode listing")
}

/// Read commands from `input` until `quit` or end of input. Fetched entries
/// land in `dest_dir`.
pub fn run_picker<R: BufRead, W: Write>(
    browse: &mut BrowseSession,
    input: R,
    mut out: W,
    dest_dir: &Path,
    reporter: &Reporter,
) -> Result<()> {
    writeln!(out, "{}", HELP)?;
    prompt(&mut out, browse)?;
    for line in input.lines() {
        let line = line.context("read command")?;
        let line = line.trim();
        let (cmd, arg) = match line.split_once(char::is_whitespace) {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };
        match cmd {
            "" => {}
            "ls" | "list" => {
                let entries = browse.list()?;
                write!(out, "{}", format_listing(&entries, false))?;
            }
            "cd" | "enter" => match enter_checked(browse, arg) {
                Ok(()) => {}
                Err(e) => writeln!(out, "{}", e)?,
            },
            "up" => browse.enter_directory("..")?,
            "pwd" => writeln!(out, "{}", browse.current_path())?,
            "get" => {
                if arg.is_empty() {
                    writeln!(out, "usage: get NAME")?;
                } else {
                    let handle = browse.select_file(arg)?;
                    let saved = handle.save_to(dest_dir, reporter)?;
                    let size = std::fs::metadata(&saved).map(|m| m.len()).unwrap_or(0);
                    writeln!(out, "saved {} ({})", saved.display(), prettify_size(size))?;
                }
            }
            "help" | "?" => writeln!(out, "{}", HELP)?,
            "quit" | "exit" | "q" => return Ok(()),
            other => writeln!(out, "unknown command {:?}; {}", other, HELP)?,
        }
        prompt(&mut out, browse)?;
    }
    Ok(())
}

fn prompt<W: Write>(out: &mut W, browse: &BrowseSession) -> Result<()> {
    write!(out, "{}> ", browse.current_path())?;
    out.flush()?;
    Ok(())
}

// Listing first lets the session refuse names that are not directories.
fn enter_checked(browse: &mut BrowseSession, name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("usage: cd NAME");
    }
    if name != ".." {
        browse.list()?;
    }
    browse.enter_directory(name)?;
    Ok(())
}
