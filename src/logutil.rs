//! Logging helpers for modem traffic.
//!
//! AT responses and SMS bodies arrive with embedded `\r`, `\n` and the Ctrl+Z
//! terminator; these helpers keep every log record on one line and make sure
//! the SIM PIN never reaches a log file.

use std::fmt::Write;

const MAX_PREVIEW: usize = 300;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters (notably Ctrl+Z) => `\\xNN`
///
/// Long strings are cut at 300 characters with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Render an outgoing command for the log, hiding the PIN argument of `AT+CPIN`.
pub fn redact_command(command: &str) -> String {
    if command
        .get(..8)
        .is_some_and(|head| head.eq_ignore_ascii_case("AT+CPIN="))
    {
        return "AT+CPIN=\"****\"".to_string();
    }
    escape_log(command)
}

/// Shorten a message body for log previews without splitting a UTF-8 character.
pub fn preview(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return escape_log(body);
    }
    let cut: String = body.chars().take(max_chars).collect();
    format!("{}...", escape_log(&cut))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_line_endings_and_ctrl_z() {
        let esc = escape_log("+CMGR: \"REC READ\"\r\nhello\x1A");
        assert_eq!(esc, "+CMGR: \"REC READ\"\\r\\nhello\\x1A");
    }

    #[test]
    fn pin_is_redacted() {
        assert_eq!(redact_command("AT+CPIN=\"1234\""), "AT+CPIN=\"****\"");
        assert_eq!(redact_command("at+cpin=0000"), "AT+CPIN=\"****\"");
        assert_eq!(redact_command("AT+CSQ"), "AT+CSQ");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo wörld", 5), "héllo...");
        assert_eq!(preview("short", 40), "short");
    }
}
