//! Command-line splitting and quoting.
//!
//! Splitting follows POSIX shell word rules closely enough for the command
//! lines found in build recipes (whitespace separation, single/double
//! quotes, backslash escapes). Quoting is the inverse, used when rendering
//! a failed command for diagnostics.

use crate::error::{KilnError, KilnResult};

/// Split a command line into words.
///
/// # Errors
///
/// [`KilnError::Validation`] on an unterminated quote or a trailing
/// backslash.
pub fn split(line: &str) -> KilnResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(KilnError::validation(format!(
                                "unterminated single quote in command line {line:?}"
                            )));
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            // Inside double quotes, backslash only escapes
                            // the characters it has meaning for.
                            Some(e @ ('"' | '\\' | '$' | '`')) => current.push(e),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(KilnError::validation(format!(
                                    "unterminated double quote in command line {line:?}"
                                )));
                            }
                        },
                        Some(c) => current.push(c),
                        None => {
                            return Err(KilnError::validation(format!(
                                "unterminated double quote in command line {line:?}"
                            )));
                        }
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => {
                        return Err(KilnError::validation(format!(
                            "trailing backslash in command line {line:?}"
                        )));
                    }
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Quote a single argument for display in error messages.
#[must_use]
pub fn quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_owned();
    }
    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | ',' | '=' | '+' | '@' | '%'));
    if safe {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Render an argv as a shell-quoted command line.
#[must_use]
pub fn render<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
