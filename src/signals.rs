/// Signal naming and shell-style exit status for a finished child.
///
/// A child killed by signal N maps to 128 + N, as shells report it.
/// A child that never started maps to 1.
use crate::session::ExitOutcome;
use nix::sys::signal::Signal;

/// Symbolic name for a signal number, e.g. `SIGKILL`.
pub fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {signal}"),
    }
}

/// Exit status this process should report for the child's outcome.
pub fn shell_exit_code(outcome: &ExitOutcome) -> u8 {
    match (outcome.code, outcome.signal) {
        (_, Some(signal)) => u8::try_from(signal)
            .ok()
            .and_then(|s| s.checked_add(128))
            .unwrap_or(255),
        (Some(code), None) => u8::try_from(code).unwrap_or(1),
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(code: Option<i32>, signal: Option<i32>) -> ExitOutcome {
        ExitOutcome { code, signal }
    }

    #[test]
    fn test_signal_name_known() {
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(15), "SIGTERM");
    }

    #[test]
    fn test_signal_name_unknown() {
        assert_eq!(signal_name(999), "signal 999");
    }

    #[test]
    fn test_exit_code_passthrough() {
        assert_eq!(shell_exit_code(&outcome(Some(0), None)), 0);
        assert_eq!(shell_exit_code(&outcome(Some(42), None)), 42);
    }

    #[test]
    fn test_signal_maps_to_128_plus() {
        assert_eq!(shell_exit_code(&outcome(None, Some(9))), 137);
        assert_eq!(shell_exit_code(&outcome(None, Some(15))), 143);
    }

    #[test]
    fn test_launch_failure_maps_to_one() {
        // Negative errno from a failed spawn.
        assert_eq!(shell_exit_code(&outcome(Some(-2), None)), 1);
        assert_eq!(shell_exit_code(&outcome(None, None)), 1);
    }
}
