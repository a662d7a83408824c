//! Status codes returned to clients.
//!
//! A status packs a message number and a severity into one `u32`:
//! `number << 3 | severity`.  Clients decode the severity bits to decide
//! whether a reply is a warning, an error or fatal.

/// Severity bits of a status code.
pub mod severity {
    pub const WARNING: u32 = 0;
    pub const SUCCESS: u32 = 1;
    pub const ERROR: u32 = 2;
    pub const INFO: u32 = 3;
    pub const SEVERE: u32 = 4;
    pub const FATAL: u32 = 6;
}

const fn code(number: u32, sev: u32) -> u32 {
    (number << 3) | sev
}

pub const NORMAL: u32 = code(0, severity::SUCCESS);
pub const ALLOCMEM: u32 = code(6, severity::WARNING);
pub const TOLARGE: u32 = code(9, severity::WARNING);
pub const TIMEOUT: u32 = code(10, severity::WARNING);
pub const BADTYPE: u32 = code(14, severity::ERROR);
pub const INTERNAL: u32 = code(17, severity::FATAL);
pub const GETFAIL: u32 = code(19, severity::WARNING);
pub const PUTFAIL: u32 = code(20, severity::WARNING);
pub const BADCOUNT: u32 = code(22, severity::WARNING);
pub const DISCONN: u32 = code(24, severity::WARNING);
pub const BADMONID: u32 = code(30, severity::ERROR);
pub const DEFUNCT: u32 = code(34, severity::FATAL);
pub const BADMASK: u32 = code(41, severity::ERROR);
pub const PUTCBINPROG: u32 = code(45, severity::ERROR);
pub const NORDACCESS: u32 = code(46, severity::WARNING);
pub const NOWTACCESS: u32 = code(47, severity::WARNING);
pub const BADCHID: u32 = code(51, severity::ERROR);
pub const BADPRIORITY: u32 = code(56, severity::ERROR);
pub const ARRAY_16K_CLIENT: u32 = code(58, severity::WARNING);

/// Severity bits of `status`.
pub fn severity_of(status: u32) -> u32 {
    status & 0x7
}

/// Whether `status` reports success.
pub fn is_success(status: u32) -> bool {
    severity_of(status) == severity::SUCCESS || severity_of(status) == severity::INFO
}

/// Human-readable text for log lines.
pub fn message(status: u32) -> &'static str {
    match status {
        NORMAL => "Normal successful completion",
        ALLOCMEM => "Unable to allocate additional dynamic memory",
        TOLARGE => "The requested transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES",
        TIMEOUT => "User specified timeout on IO operation expired",
        BADTYPE => "The data type specified is invalid",
        INTERNAL => "Channel Access Internal Failure",
        GETFAIL => "Channel read request failed",
        PUTFAIL => "Channel write request failed",
        BADCOUNT => "Invalid element count requested",
        DISCONN => "Virtual circuit disconnect",
        BADMONID => "Invalid event id",
        DEFUNCT => "Defunct client protocol version",
        BADMASK => "Invalid event selection mask",
        PUTCBINPROG => "Put callback timed out",
        NORDACCESS => "Read access denied",
        NOWTACCESS => "Write access denied",
        BADCHID => "Invalid channel identifier",
        BADPRIORITY => "Invalid channel priority",
        ARRAY_16K_CLIENT => "Unable to send array larger than 16K to pre R3.14 client",
        _ => "unknown status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_published_values() {
        assert_eq!(NORMAL, 1);
        assert_eq!(ALLOCMEM, 48);
        assert_eq!(BADTYPE, 114);
        assert_eq!(INTERNAL, 142);
        assert_eq!(DEFUNCT, 278);
        assert_eq!(NORDACCESS, 368);
        assert_eq!(ARRAY_16K_CLIENT, 464);
    }

    #[test]
    fn test_severity_decoding() {
        assert!(is_success(NORMAL));
        assert!(!is_success(PUTFAIL));
        assert_eq!(severity_of(INTERNAL), severity::FATAL);
    }
}
