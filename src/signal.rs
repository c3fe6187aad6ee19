use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Ask the `child` to terminate gracefully.
/// This signal is typically sent to a process when the operating system requests a termination.
///
/// Sends a `SIGTERM` to the process. A process that is already gone is not an error.
pub(crate) fn send_terminate(child: &tokio::process::Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        // Returns `None` if child was already "polled to completion".
        return Ok(());
    };

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

/// Whether a process with the given id exists (zombies included).
///
/// Ids that do not name a single process (`0` and anything beyond `i32::MAX`) are never alive.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw == 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // The process exists, we are just not allowed to signal it.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertr::prelude::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn terminate_ends_a_sleeping_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("1000")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert_that(is_alive(pid)).is_true();

        send_terminate(&child).unwrap();
        let status = child.wait().await.unwrap();

        assert_that(status.success()).is_false();
        assert_that(is_alive(pid)).is_false();
    }

    #[test]
    fn ids_naming_process_groups_are_not_alive() {
        assert_that(is_alive(0)).is_false();
        assert_that(is_alive(u32::MAX)).is_false();
        assert_that(is_alive(i32::MAX as u32 + 1)).is_false();
        assert_that(is_alive(std::process::id())).is_true();
    }

    #[tokio::test]
    async fn terminate_after_completion_is_a_no_op() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let _ = child.wait().await.unwrap();

        assert_that(send_terminate(&child).is_ok()).is_true();
    }
}
