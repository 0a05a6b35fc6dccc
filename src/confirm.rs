//! Interactive gate in front of destructive runs.

use std::io::{BufRead, Write};

use crate::error::{Result, RetireError};

/// Print `warning`, then require the literal answer `yes` (any case).
///
/// Anything else, including end of input, aborts.
pub fn confirm<R: BufRead, W: Write>(warning: &str, input: &mut R, output: &mut W) -> Result<()> {
    let io = |e| RetireError::io("<terminal>", e);
    writeln!(output, "{warning}").map_err(io)?;
    write!(output, "Type 'yes' to confirm: ").map_err(io)?;
    output.flush().map_err(io)?;

    let mut answer = String::new();
    input.read_line(&mut answer).map_err(io)?;
    if answer.trim().eq_ignore_ascii_case("yes") {
        Ok(())
    } else {
        Err(RetireError::Aborted)
    }
}

/// [`confirm`] on stdin/stdout, skipped when `assume_yes` is set.
pub fn confirm_on_terminal(warning: &str, assume_yes: bool) -> Result<()> {
    if assume_yes {
        return Ok(());
    }
    let stdin = std::io::stdin();
    confirm(warning, &mut stdin.lock(), &mut std::io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_yes_passes() {
        let mut out = Vec::new();
        assert!(confirm("Danger", &mut "YES\n".as_bytes(), &mut out).is_ok());
        assert!(String::from_utf8(out).unwrap().contains("Danger"));

        for answer in ["y\n", "no\n", ""] {
            let err = confirm("Danger", &mut answer.as_bytes(), &mut Vec::new()).unwrap_err();
            assert!(matches!(err, RetireError::Aborted));
        }
    }
}
