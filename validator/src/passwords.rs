// Copyright (c) 2024 Botho Foundation

//! Where unlock passphrases come from: a preloaded password file, or an
//! echo-free terminal prompt.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use zeroize::Zeroizing;

/// Reads one passphrase from the operator.
pub trait PasswordPrompt: Send {
    fn read_password(&mut self, prompt: &str) -> io::Result<Zeroizing<String>>;
}

/// Prompts on the controlling terminal without echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl PasswordPrompt for TerminalPrompt {
    fn read_password(&mut self, prompt: &str) -> io::Result<Zeroizing<String>> {
        eprint!("{}", prompt);
        io::stderr().flush()?;
        rpassword::read_password().map(Zeroizing::new)
    }
}

/// Passphrases for the unlocker.
pub enum PasswordSource {
    /// Passwords read ahead of time, indexed by unlock list position
    Preloaded(Vec<Zeroizing<String>>),
    /// Ask the operator for every attempt
    Interactive(Box<dyn PasswordPrompt>),
}

impl std::fmt::Debug for PasswordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preloaded(list) => write!(f, "Preloaded({} passwords)", list.len()),
            Self::Interactive(_) => f.write_str("Interactive"),
        }
    }
}

impl PasswordSource {
    /// A preloaded list when `password_file` is set, otherwise the terminal.
    pub fn from_file(password_file: Option<&Path>) -> io::Result<Self> {
        match password_file {
            Some(path) => Ok(Self::Preloaded(load_password_list(path)?)),
            None => Ok(Self::Interactive(Box::new(TerminalPrompt))),
        }
    }

    /// Passphrase for the entry at `index` of the unlock list.
    ///
    /// A preloaded list shorter than the unlock list keeps yielding its last
    /// entry. `prompt` is only shown when asking interactively.
    pub fn passphrase(&mut self, prompt: &str, index: usize) -> io::Result<Zeroizing<String>> {
        match self {
            Self::Preloaded(list) => match list.get(index).or_else(|| list.last()) {
                Some(password) => Ok(password.clone()),
                None => Ok(Zeroizing::new(String::new())),
            },
            Self::Interactive(prompt_impl) => {
                eprintln!("{}", prompt);
                prompt_impl.read_password("Passphrase: ")
            }
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Interactive(_))
    }
}

/// Read a password file: one password per line, DOS line endings accepted.
/// A trailing newline does not add an empty password.
pub fn load_password_list(path: &Path) -> io::Result<Vec<Zeroizing<String>>> {
    let text = Zeroizing::new(fs::read_to_string(path)?);
    let mut lines: Vec<Zeroizing<String>> = text
        .split('\n')
        .map(|line| Zeroizing::new(line.trim_end_matches('\r').to_string()))
        .collect();
    if lines.len() > 1 && lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    Ok(lines)
}

/// Ask for a new passphrase twice and require both to match.
pub fn prompt_new_passphrase(prompt: &mut dyn PasswordPrompt) -> io::Result<Zeroizing<String>> {
    let password = prompt.read_password("Passphrase: ")?;
    let confirm = prompt.read_password("Repeat passphrase: ")?;
    if *password != *confirm {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Passphrases do not match",
        ));
    }
    Ok(password)
}
