//! CLI utilities for the docwire shell.
//!
//! The utilities present in this module read and parse shell input; see
//! [`Command`] for what can be typed at the prompt.
use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::command::{Command, CommandError};

#[derive(Debug, Error)]
pub enum PromptError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Prompt the user for a command.
///
/// Returns `Ok(None)` once the input is exhausted.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Option<Command>, PromptError>
where
    R: BufRead,
    W: Write,
{
    write!(&mut writer, "> ")?;
    writer.flush()?;

    let mut line = String::default();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(Command::try_from(line.as_str())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        let command = prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
        assert_eq!(command, Some(Command::Exit));
    }

    #[test]
    fn prompt_returns_none_at_end_of_input() {
        let mut output = Vec::new();

        assert!(prompt(&b""[..], &mut output).unwrap().is_none());
    }

    #[test]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        let err = prompt(&input[..], &mut output).unwrap_err();
        assert_eq!(err.to_string(), "unrecognized command '.something_wrong'");
    }
}
