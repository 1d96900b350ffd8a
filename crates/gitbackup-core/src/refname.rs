//! Escaping of arbitrary paths into valid reference-name components.
//!
//! Git is strict about what a reference name may contain, while repository
//! paths on disk are arbitrary bytes. `escape_path` maps any path to a string
//! git accepts under `refs/`, and `unescape_path` maps it back. The encoding
//! must stay stable forever: escaped paths are stored in `backup.refs` and in
//! the per-pull work namespace, and different tool versions have to agree on
//! them.

use std::fmt::Write;

use crate::error::{BackupError, Result};

/// Escape `path` so that git is happy to use each component as part of a
/// reference name.
///
/// Offending bytes are encoded as `%XX` (uppercase hex). Dot runs are encoded
/// so that `..` never appears while a single `.` and a trailing `.git` stay
/// intact. Trailing empty components (trailing `/`) are stripped.
pub fn escape_path(path: &[u8]) -> String {
    let mut outv: Vec<String> = Vec::new();

    for component in path.split(|&b| b == b'/') {
        let mut out = String::new();
        let mut dots = 0; // length of the current run of '.'
        let mut rest = component;

        while !rest.is_empty() {
            let (ch, size) = decode_utf8(rest);
            if ch == Some('.') {
                dots += 1;
                rest = &rest[size..];
                continue;
            }
            if dots != 0 {
                push_dot_run(&mut out, dots);
                dots = 0;
            }
            match ch {
                Some(c) if !should_escape(c) => out.push(c),
                // escaped character or invalid UTF-8: escape the raw bytes
                _ => {
                    for &b in &rest[..size] {
                        push_escaped(&mut out, b);
                    }
                }
            }
            rest = &rest[size..];
        }
        if dots != 0 {
            push_dot_run(&mut out, dots);
        }

        if !out.is_empty() {
            // ^. not allowed
            if out.starts_with('.') {
                out.replace_range(..1, "%2E");
            }
            // .lock$ not allowed
            if out.ends_with(".lock") {
                let dot = out.len() - ".lock".len();
                out.replace_range(dot..dot + 1, "%2E");
            }
        }
        outv.push(out);
    }

    // strip trailing /
    while outv.last().is_some_and(|c| c.is_empty()) {
        outv.pop();
    }
    outv.join("/")
}

/// Unescape a path encoded by [`escape_path`].
///
/// Decoding is permissive: any `%XX` decodes to the byte, whether or not the
/// encoder would have produced it; every other byte passes through. A `%` not
/// followed by two hex digits fails.
pub fn unescape_path(s: &str) -> Result<Vec<u8>> {
    let raw = s.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let c = raw[i];
        if c == b'%' {
            let hexpair = raw
                .get(i + 1..i + 3)
                .ok_or_else(|| BackupError::Escape(s.to_string()))?;
            let mut b = [0u8; 1];
            hex::decode_to_slice(hexpair, &mut b)
                .map_err(|_| BackupError::Escape(s.to_string()))?;
            out.push(b[0]);
            i += 3;
        } else {
            out.push(c);
            i += 1;
        }
    }
    Ok(out)
}

/// Emit a run of `n` consecutive dots: all but the last one encoded.
///
/// Keeping the last dot literal means a lone `.` and a trailing `.git` stay
/// readable, while `..` can never appear in the output.
fn push_dot_run(out: &mut String, n: usize) {
    for _ in 0..n - 1 {
        out.push_str("%2E");
    }
    out.push('.');
}

fn should_escape(c: char) -> bool {
    if c.is_whitespace() || c.is_control() {
        return true;
    }
    matches!(
        c,
        ':' | '?' | '[' | '\\' | '^' | '~' | '*' | '@' | '%'
    )
}

fn push_escaped(out: &mut String, b: u8) {
    // infallible: writing to a String cannot fail
    let _ = write!(out, "%{b:02X}");
}

/// Decode the first character of `b`: `(Some(char), len)` for valid UTF-8,
/// `(None, 1)` for an invalid byte.
fn decode_utf8(b: &[u8]) -> (Option<char>, usize) {
    match std::str::from_utf8(b) {
        Ok(s) => {
            let c = s.chars().next().expect("non-empty by construction");
            (Some(c), c.len_utf8())
        }
        Err(e) if e.valid_up_to() > 0 => {
            let s = std::str::from_utf8(&b[..e.valid_up_to()]).expect("validated prefix");
            let c = s.chars().next().expect("non-empty valid prefix");
            (Some(c), c.len_utf8())
        }
        Err(_) => (None, 1),
    }
}
