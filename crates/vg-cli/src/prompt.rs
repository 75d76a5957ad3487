//! Reading secrets from the terminal or standard input

use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;

/// Environment variable consulted before prompting for a password
pub const PASSWORD_ENV: &str = "VIGIL_PASSWORD";

/// Get an SSH password from standard input, the environment or a prompt
pub fn obtain_password(from_stdin: bool, prompt: &str) -> Result<String> {
    if from_stdin {
        return read_stdin_line(std::io::stdin().lock());
    }
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        if !password.is_empty() {
            return Ok(password);
        }
    }
    read_secret(prompt)
}

/// Prompt on stderr and read a line without echoing it
pub fn read_secret(prompt: &str) -> Result<String> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{}", prompt)?;
    stderr.flush()?;

    terminal::enable_raw_mode().context("Standard input is not a terminal")?;
    let result = read_hidden();
    let _ = terminal::disable_raw_mode();
    eprintln!();
    result
}

fn read_hidden() -> Result<String> {
    let mut secret = String::new();
    loop {
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event::read()?
        else {
            continue;
        };
        if kind == KeyEventKind::Release {
            continue;
        }
        match code {
            KeyCode::Enter => return Ok(secret),
            KeyCode::Backspace => {
                secret.pop();
            }
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => bail!("Cancelled"),
            KeyCode::Esc => bail!("Cancelled"),
            KeyCode::Char(c) => secret.push(c),
            _ => {}
        }
    }
}

/// Read one line, without its line ending, from `input`
pub fn read_stdin_line(mut input: impl BufRead) -> Result<String> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("Failed to read standard input")?;
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        bail!("Nothing was given on standard input");
    }
    Ok(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdin_line_strips_line_ending_only() {
        let line = read_stdin_line(&b" hunter2 \r\nignored\n"[..]).unwrap();
        assert_eq!(line, " hunter2 ");
    }

    #[test]
    fn test_empty_stdin_is_an_error() {
        assert!(read_stdin_line(&b""[..]).is_err());
        assert!(read_stdin_line(&b"\n"[..]).is_err());
    }
}
