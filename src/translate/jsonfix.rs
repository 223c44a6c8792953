//! Heuristic repair for malformed JSON emitted by LLMs in tool call arguments.

use regex::Regex;
use std::sync::OnceLock;

fn trailing_comma_obj() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*\}").expect("static regex"))
}

fn trailing_comma_arr() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*\]").expect("static regex"))
}

/// Attempt to repair malformed JSON from LLM output.
///
/// Uses a 3-tier approach: standard parse, relaxed fixups, bracket repair.
/// Falls back to `"{}"` if nothing works.
pub fn fix_json(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() {
        return "{}".to_string();
    }

    // Tier 1: already valid
    if is_valid(s) {
        return s.to_string();
    }

    // Tier 2: relaxed fixups
    let fixed = relaxed_fix(s);
    if is_valid(&fixed) {
        return fixed;
    }

    // Tier 3: close unclosed brackets
    let fixed = close_brackets(&fixed);
    if is_valid(&fixed) {
        return fixed;
    }

    "{}".to_string()
}

fn is_valid(s: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(s).is_ok()
}

/// Common repairs: trailing commas and single-quoted strings.
fn relaxed_fix(s: &str) -> String {
    let s = trailing_comma_obj().replace_all(s, "}");
    let s = trailing_comma_arr().replace_all(&s, "]");
    replace_single_quotes(&s)
}

/// Convert single-quoted strings to double-quoted, honoring escapes and
/// leaving single quotes inside double-quoted strings alone.
fn replace_single_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\\' && (in_double || in_single) {
            out.push(c);
            if let Some(next) = chars.next() {
                out.push(next);
            }
            continue;
        }
        match c {
            '"' if !in_single => {
                in_double = !in_double;
                out.push(c);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Count unmatched `{` and `[` outside strings and append closers in reverse.
fn close_brackets(s: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\\' && in_string {
            chars.next();
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = String::from(s);
    while let Some(c) = stack.pop() {
        out.push(c);
    }
    out
}
