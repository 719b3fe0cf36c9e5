//! Credential acquisition: flags, piped stdin, or interactive prompt.

use std::io::BufRead;

use crate::error::{Error, Result};

use super::{Credentials, SecretSource};

/// Resolve credentials for `registry` from flag values, piped stdin, or an
/// interactive prompt, in that precedence order.
///
/// * `password_from_stdin` reads exactly one line from stdin as the secret
///   and requires `username`.
/// * Otherwise, when both flags are present they are used directly.
/// * Otherwise any missing field is prompted for, with echo suppressed for
///   the secret; this fails when stdin is not a terminal.
pub fn resolve_credentials(
    registry: &str,
    username: Option<&str>,
    password: Option<&str>,
    password_from_stdin: bool,
) -> Result<Credentials> {
    if password_from_stdin {
        let username = match username {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => return Err(Error::MissingUsername),
        };
        let secret = read_secret_line(&mut std::io::stdin().lock())?;
        return Ok(Credentials {
            registry: registry.to_string(),
            username,
            secret,
            secret_source: SecretSource::Stdin,
        });
    }

    if let (Some(u), Some(p)) = (username, password)
        && !u.is_empty()
        && !p.is_empty()
    {
        return Ok(Credentials {
            registry: registry.to_string(),
            username: u.to_string(),
            secret: p.to_string(),
            secret_source: SecretSource::Flag,
        });
    }

    prompt_credentials(registry, username)
}

/// Read one line from `reader`, trimming a single trailing line terminator.
fn read_secret_line(reader: &mut impl BufRead) -> Result<String> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| Error::CredentialInput(format!("failed to read stdin: {e}")))?;
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(line)
}

/// Prompt for any missing field on the terminal.
fn prompt_credentials(registry: &str, username: Option<&str>) -> Result<Credentials> {
    if !console::user_attended() {
        return Err(Error::CredentialInput(
            "stdin is not a terminal; pass --username/--password or --password-stdin".to_string(),
        ));
    }

    let username = match username {
        Some(u) if !u.is_empty() => u.to_string(),
        _ => dialoguer::Input::new()
            .with_prompt("Username")
            .interact_text()
            .map_err(|e| Error::CredentialInput(e.to_string()))?,
    };

    let secret: String = dialoguer::Password::new()
        .with_prompt("Password")
        .interact()
        .map_err(|e| Error::CredentialInput(e.to_string()))?;

    Ok(Credentials {
        registry: registry.to_string(),
        username,
        secret,
        secret_source: SecretSource::Interactive,
    })
}
