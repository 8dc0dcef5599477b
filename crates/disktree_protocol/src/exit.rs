//! Process exit codes shared by the CLI and the scan worker.

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const INVALID_INPUT: i32 = 2;
pub const UNSUPPORTED_SCHEME: i32 = 3;
pub const ACCESS_DENIED: i32 = 4;
pub const ABORTED: i32 = 5;

use crate::types::ErrorKind;

/// Exit code for a failed operation of the given kind.
pub fn code_for(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::InvalidUri => INVALID_INPUT,
        ErrorKind::UnsupportedScheme => UNSUPPORTED_SCHEME,
        ErrorKind::SourcePermission => ACCESS_DENIED,
        ErrorKind::Aborted => ABORTED,
        _ => FAILURE,
    }
}
