//! Human-readable reasons for WebSocket close codes.

/// Code reported when a close carries no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Describes a close code.
///
/// Codes 1000 through 1015 map to their registered names; anything else
/// reads as `"Unknown reason: <code>"`.
pub fn close_reason(code: u16) -> String {
    let known = match code {
        1000 => "Normal Closure",
        1001 => "Going Away",
        1002 => "Protocol Error",
        1003 => "Unsupported Data",
        1004 => "Reserved",
        1005 => "No Status Received",
        1006 => "Abnormal Closure",
        1007 => "Invalid Frame Payload Data",
        1008 => "Policy Violation",
        1009 => "Message Too Big",
        1010 => "Missing Extension",
        1011 => "Internal Error",
        1012 => "Service Restart",
        1013 => "Try Again Later",
        1014 => "Bad Gateway",
        1015 => "TLS Handshake",
        other => return format!("Unknown reason: {other}"),
    };
    known.to_owned()
}
