//! Interactive confirmation for destructive commands.

use anyhow::{Context, Result};
use std::io::{BufRead, Write};

/// Print `question` and read one line from stdin. Returns `true` only if the
/// trimmed answer equals one of `accepted`.
pub fn confirm(question: &str, accepted: &[&str]) -> Result<bool> {
    let stdin = std::io::stdin();
    confirm_with(question, accepted, &mut stdin.lock(), &mut std::io::stdout())
}

pub fn confirm_with<R: BufRead, W: Write>(
    question: &str,
    accepted: &[&str],
    input: &mut R,
    output: &mut W,
) -> Result<bool> {
    write!(output, "{} ", question)?;
    output.flush()?;
    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(accepted.contains(&answer.trim()))
}
