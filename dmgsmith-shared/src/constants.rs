//! Values both sides of the progress socket agree on.

/// Helper exit statuses.
pub mod exit_status {
    /// Lowest status the install script uses for failures it has already
    /// announced with `notify_failure`.
    pub const REPORTED_FAILURE_MIN: i32 = 100;

    pub const REPORTED_FAILURE_MAX: i32 = 199;

    /// Returned by the helper when it cannot run the wrapped program.
    pub const SOFTWARE: i32 = 70;

    /// True when the failure was already reported through the socket.
    pub fn is_reported_failure(status: i32) -> bool {
        (REPORTED_FAILURE_MIN..=REPORTED_FAILURE_MAX).contains(&status)
    }
}

/// Helper command-line vocabulary.
pub mod helper_cli {
    pub const SOCKET_FLAG: &str = "--socket";
    pub const CD_FLAG: &str = "--cd";
    pub const INSTALL_SUBCOMMAND: &str = "installesdtodmg";
    pub const SCAN_SUBCOMMAND: &str = "imagescan";
}
