//! Pre-launch rewrites of the install script.
//!
//! Install scripts arrive with whatever line endings their packaging left
//! them with, and the command interpreter only copes with the platform's
//! native convention (CRLF under cmd.exe, LF for sh, where a CRLF shebang
//! line won't even exec). Some networks also need the downloader's IPv6
//! support turned off. Both fixes are idempotent in-place text rewrites; failures
//! are the caller's to log and never block installation.

use std::fs;
use std::io;
use std::path::Path;

const DISABLE_IPV6_FLAG: &str = "--disable-ipv6=true";

/// Line ending the platform's command interpreter expects.
const NATIVE_EOL: &str = if cfg!(windows) { "\r\n" } else { "\n" };

/// Rewrite the script in place so every line ending matches the platform's
/// native convention.
///
/// Returns true when the file needed fixing. Running this on an
/// already-normalized file leaves the bytes untouched.
pub fn normalize_line_endings(path: &Path) -> io::Result<bool> {
    let original = fs::read_to_string(path)?;
    let normalized = normalize_to(&original, NATIVE_EOL);
    if normalized == original {
        return Ok(false);
    }
    fs::write(path, normalized)?;
    Ok(true)
}

fn normalize_to(text: &str, eol: &str) -> String {
    // collapse CRLF and stray CR to LF first so the rewrite cannot double up
    let unix = text.replace("\r\n", "\n").replace('\r', "\n");
    if eol == "\n" {
        unix
    } else {
        unix.replace('\n', eol)
    }
}

/// Append the downloader's IPv6-disable flag to every invocation line that
/// lacks it. Returns true when the script was modified; idempotent.
pub fn disable_ipv6(path: &Path) -> io::Result<bool> {
    let original = fs::read_to_string(path)?;
    let eol = if original.contains("\r\n") { "\r\n" } else { "\n" };

    let mut changed = false;
    let lines: Vec<String> = original
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .map(|line| {
            if line.contains("aria2c") && !line.contains("--disable-ipv6") {
                changed = true;
                format!("{line} {DISABLE_IPV6_FLAG}")
            } else {
                line.to_string()
            }
        })
        .collect();

    if !changed {
        return Ok(false);
    }
    fs::write(path, lines.join(eol))?;
    Ok(true)
}
