//! Authorization service result codes, as reported by the prompt backends.

/// The user dismissed the prompt.
pub const CANCELLED: i32 = -60006;

/// AppleScript's "User canceled." error number.
pub const APPLESCRIPT_CANCELLED: i32 = -128;

/// pkexec exit status when the dialog was dismissed or authorization failed.
pub const PKEXEC_NOT_AUTHORIZED: i32 = 126;

/// pkexec exit status when no authentication agent is available.
pub const PKEXEC_NO_AGENT: i32 = 127;

/// Text for an authorization result code.
pub fn describe(code: i32) -> String {
    let text = match code {
        -60001 => "The authorization rights are invalid.",
        -60002 => "The authorization reference is invalid.",
        -60003 => "The authorization tag is invalid.",
        -60004 => "The returned authorization is invalid.",
        -60005 => "The authorization was denied.",
        -60006 => "The authorization was cancelled by the user.",
        -60007 => "The authorization was denied since no user interaction was possible.",
        -60008 => "Unable to obtain authorization for this operation.",
        -60009 => "The authorization is not allowed to be converted to an external format.",
        -60010 => "The authorization is not allowed to be created from an external format.",
        -60011 => "The provided option flag(s) are invalid for this authorization operation.",
        -60031 => "The specified program could not be executed.",
        -60032 => "An invalid status was returned during execution of a privileged tool.",
        -60033 => "The requested socket address is invalid (must be 0-1023 inclusive).",
        _ => return format!("Unknown error ({}).", code),
    };
    text.to_string()
}

/// Pull the trailing `(-NNNN)` error number out of osascript's stderr, e.g.
/// `execution error: User canceled. (-128)`.
pub fn applescript_error_number(stderr: &str) -> Option<i32> {
    let open = stderr.rfind('(')?;
    let close = open + stderr[open..].find(')')?;
    stderr[open + 1..close].trim().parse().ok()
}
