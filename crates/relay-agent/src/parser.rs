// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The "output-parser" half of the orchestrator: turns raw
//! PTY output into outbound commands. Re-implements the three parser
//! tiers over an ANSI-stripped rolling buffer, grounded
//! in the *shape* of a driver's screen-scraping parser (regex-driven
//! tier detectors feeding a single composite resolver) but re-targeted at
//! relay command syntax rather than CLI-state detection.

use regex::Regex;
use std::sync::OnceLock;

/// How many bytes of already-scanned content to re-include on each parse
/// pass, so a fenced block whose open tag landed in one read and whose
/// close tag lands in the next is never missed.
const LOOKBACK_BYTES: usize = 500;

/// Upper bound on how much stripped text we retain; old, fully-scanned
/// content beyond this is dropped so a long-lived agent doesn't grow the
/// buffer unboundedly.
const MAX_RETAINED_BYTES: usize = 64 * 1024;

/// One command an agent emitted through its PTY output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    Send { target: String, thread: Option<String>, body: String },
    Spawn { name: String, cli: String, model: Option<String>, task: Option<String>, cwd: Option<String>, team: Option<String> },
    Release { name: String },
}

#[allow(clippy::expect_used)]
fn fenced_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)→(\S+)(?: \[thread:([^\]]+)\])?<<<(.*?)>>>").expect("fenced regex"))
}

#[allow(clippy::expect_used)]
fn single_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^→(\S+)(?: \[thread:([^\]]+)\])? (.+)$").expect("single-line regex"))
}

/// Matches just the *opening* half of a fenced command, with no
/// requirement that a closing `>>>` follows — used to find a fence that
/// is still incomplete so the scan pointer never advances past it.
#[allow(clippy::expect_used)]
fn open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"→(\S+)(?: \[thread:([^\]]+)\])?<<<").expect("open-tag regex"))
}

/// Strip ANSI/VT escape sequences (CSI, OSC, simple two-byte escapes) so
/// command parsing runs over plain text.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

/// Incremental parser over an agent's tailed PTY output.
pub struct CommandParser {
    buf: String,
    scanned_upto: usize,
}

impl CommandParser {
    pub fn new() -> Self {
        Self { buf: String::new(), scanned_upto: 0 }
    }

    /// Feed newly-read raw bytes (pre-ANSI-stripping) and return every
    /// complete command found since the last call.
    ///
    /// Each call re-scans the last [`LOOKBACK_BYTES`] bytes of already
    /// scanned content alongside whatever is new, so a fence whose open tag
    /// landed in one read and whose close tag lands in a later one is never
    /// missed. To avoid re-emitting what the lookback re-scan turns back
    /// up, only matches ending beyond the previous scan boundary count.
    /// `scanned_upto` itself is never advanced past an unterminated fence's
    /// open tag, otherwise a close arriving after the fence has aged out of
    /// the lookback window would never be seen.
    pub fn feed(&mut self, raw: &[u8]) -> Vec<ParsedCommand> {
        let text = String::from_utf8_lossy(raw);
        let stripped = strip_ansi(&text);
        self.buf.push_str(&stripped);

        let prev_scanned_upto = self.scanned_upto;
        let lookback_start = prev_scanned_upto.saturating_sub(LOOKBACK_BYTES);
        let window = &self.buf[lookback_start..];

        let mut commands = Vec::new();
        let mut claimed_end = lookback_start;

        for m in fenced_re().captures_iter(window) {
            #[allow(clippy::expect_used)]
            let whole = m.get(0).expect("group 0 always matches");
            let abs_end = lookback_start + whole.end();
            claimed_end = claimed_end.max(abs_end);
            if abs_end <= prev_scanned_upto {
                continue;
            }
            let target = m.get(1).map(|g| g.as_str()).unwrap_or_default();
            let thread = m.get(2).map(|g| g.as_str().to_owned());
            let body = m.get(3).map(|g| g.as_str()).unwrap_or_default();
            commands.push(to_command(target, thread, body));
        }

        // An unterminated fence open tag pins the scan boundary at its
        // start so it stays inside every future window until it closes.
        let pending_open = open_re()
            .find_iter(window)
            .map(|m| lookback_start + m.start())
            .filter(|&abs_start| abs_start >= claimed_end)
            .find(|&abs_start| {
                let rest_start = (abs_start - lookback_start + 1).min(window.len());
                !window[rest_start..].contains(">>>")
            });

        let mut advance_to = claimed_end.max(prev_scanned_upto);

        // Single-line commands over complete lines only, skipping text
        // already claimed by a fenced match so a `→name text` line inside a
        // fenced body is not double-parsed.
        if let Some(last_newline) = window.rfind('\n') {
            let complete = &window[..=last_newline];
            for m in single_line_re().captures_iter(complete) {
                #[allow(clippy::expect_used)]
                let whole = m.get(0).expect("group 0 always matches");
                let abs_start = lookback_start + whole.start();
                let abs_end = lookback_start + whole.end();
                if abs_start < claimed_end || abs_end <= prev_scanned_upto {
                    continue;
                }
                let target = m.get(1).map(|g| g.as_str()).unwrap_or_default();
                let thread = m.get(2).map(|g| g.as_str().to_owned());
                let body = m.get(3).map(|g| g.as_str()).unwrap_or_default();
                commands.push(to_command(target, thread, body));
            }
            advance_to = advance_to.max(lookback_start + last_newline + 1);
        }

        if let Some(open_pos) = pending_open {
            advance_to = advance_to.min(open_pos).max(prev_scanned_upto);
        }

        self.scanned_upto = advance_to;
        self.truncate_if_needed();
        commands
    }

    /// Drop fully-scanned content beyond `MAX_RETAINED_BYTES` so a
    /// long-lived agent's buffer doesn't grow without bound.
    fn truncate_if_needed(&mut self) {
        if self.buf.len() <= MAX_RETAINED_BYTES {
            return;
        }
        let drop_upto = self.scanned_upto.saturating_sub(LOOKBACK_BYTES);
        if drop_upto == 0 {
            return;
        }
        // Only drop at a char boundary.
        let mut cut = drop_upto;
        while cut > 0 && !self.buf.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buf.drain(..cut);
        self.scanned_upto -= cut;
    }
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

fn to_command(target: &str, thread: Option<String>, body: &str) -> ParsedCommand {
    match target {
        "spawn" => parse_spawn(body),
        "release" => parse_release(body),
        _ => ParsedCommand::Send { target: target.to_owned(), thread, body: body.trim().to_owned() },
    }
}

/// Parse a spawn/release command body as `KEY: value` header lines, the
/// same texture as the file-ledger outbox protocol.
fn headers(body: &str) -> std::collections::HashMap<String, String> {
    body.lines()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            Some((k.trim().to_ascii_uppercase(), v.trim().to_owned()))
        })
        .collect()
}

fn parse_spawn(body: &str) -> ParsedCommand {
    let h = headers(body);
    ParsedCommand::Spawn {
        name: h.get("NAME").cloned().unwrap_or_default(),
        cli: h.get("CLI").cloned().unwrap_or_default(),
        model: h.get("MODEL").cloned(),
        task: h.get("TASK").cloned(),
        cwd: h.get("CWD").cloned(),
        team: h.get("TEAM").cloned(),
    }
}

fn parse_release(body: &str) -> ParsedCommand {
    let h = headers(body);
    let name = h.get("NAME").cloned().unwrap_or_else(|| body.trim().to_owned());
    ParsedCommand::Release { name }
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
