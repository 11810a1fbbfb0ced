use std::ffi::OsStr;
use std::path::Path;

use log::debug;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// stdout followed by stderr.
    pub output: String,
}

impl ProcessOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `program` to completion and capture its exit code and combined
/// output.
///
/// Returns `Ok(None)` if `cancel` fires first; the child is killed when the
/// wait is abandoned.
///
/// # Errors
/// Returns an error if the process cannot be spawned or its output cannot be
/// collected.
pub async fn run_process<I, S>(
    program: &Path,
    args: I,
    working_dir: Option<&Path>,
    cancel: &CancellationToken,
) -> std::io::Result<Option<ProcessOutput>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    hide_console(&mut command);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    debug!("Running {}", program.display());

    let output = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!("Cancelled while running {}", program.display());
            return Ok(None);
        }
        output = command.output() => output?,
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(Some(ProcessOutput {
        exit_code: output.status.code(),
        output: combined,
    }))
}

/// Keep helper processes from flashing a console window.
#[cfg(windows)]
fn hide_console(command: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_command: &mut Command) {}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use tokio_util::sync::CancellationToken;

    use super::run_process;

    #[tokio::test]
    async fn captures_exit_code_and_combined_output() {
        let output = run_process(
            Path::new("sh"),
            ["-c", "echo out; echo err 1>&2; exit 3"],
            None,
            &CancellationToken::new(),
        )
        .await
        .expect("sh should spawn")
        .expect("not cancelled");

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert!(output.output.contains("out"));
        assert!(output.output.contains("err"));
    }

    #[tokio::test]
    async fn cancellation_abandons_running_process() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let output = run_process(Path::new("sh"), ["-c", "sleep 30"], None, &cancel)
            .await
            .expect("sh should spawn");

        assert!(output.is_none());
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let result = run_process(
            Path::new("/nonexistent/tgs-engine-test-binary"),
            Vec::<&str>::new(),
            None,
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
    }
}
