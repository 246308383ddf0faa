//! Load triggers: an external script, or a human pressing Enter

use gremlin_core::LoadTrigger;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::Command;

/// Runs a load-generation script and waits for it to exit
#[derive(Debug, Clone)]
pub(crate) struct ScriptLoad {
    script: PathBuf,
}

impl ScriptLoad {
    pub(crate) fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl LoadTrigger for ScriptLoad {
    fn trigger(&mut self) -> Result<(), String> {
        tracing::info!(script = %self.script.display(), "running load script");
        let status = Command::new(&self.script)
            .status()
            .map_err(|e| format!("cannot run {}: {e}", self.script.display()))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("{} exited with {status}", self.script.display()))
        }
    }
}

/// Asks the operator to send traffic, then waits for a line on `input`
pub(crate) struct ManualLoad<R> {
    input: R,
    header: String,
    pattern: String,
}

impl<R: BufRead> ManualLoad<R> {
    pub(crate) fn new(input: R, header: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            input,
            header: header.into(),
            pattern: pattern.into(),
        }
    }
}

impl<R: BufRead> LoadTrigger for ManualLoad<R> {
    fn trigger(&mut self) -> Result<(), String> {
        let mut stderr = std::io::stderr();
        let _ = writeln!(
            stderr,
            "Inject test requests with HTTP header {} matching the pattern {}",
            self.header, self.pattern
        );
        let _ = writeln!(stderr, "When done, press Enter to continue to the validation phase");
        let mut line = String::new();
        self.input
            .read_line(&mut line)
            .map(|_| ())
            .map_err(|e| format!("cannot read confirmation: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_script_exit_status_decides() {
        assert!(ScriptLoad::new("true").trigger().is_ok());
        let err = ScriptLoad::new("false").trigger().unwrap_err();
        assert!(err.starts_with("false exited with"), "{err}");
        let err = ScriptLoad::new("/nonexistent/load.sh").trigger().unwrap_err();
        assert!(err.starts_with("cannot run"), "{err}");
    }

    #[test]
    fn test_manual_load_waits_for_a_line() {
        let mut load = ManualLoad::new(Cursor::new(b"\n".to_vec()), "X-Request-ID", "*");
        assert!(load.trigger().is_ok());
    }
}
