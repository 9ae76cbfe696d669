//! Common driver error types
//!
//! One error enum covers the whole platform management core; recoverable
//! conditions are returned synchronously, loss conditions are only visible
//! through statistics counters and log entries.

/// Common platform-management error type
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PmcError {
    /// Sensor channel index out of range
    InvalidChannel,

    /// Management zone index out of range
    InvalidZone,

    /// Power enable pin index out of range
    InvalidPin,

    /// Stored section version does not match the requested version
    VersionMismatch,

    /// Requested more space than the stored section holds
    SizeOverflow,

    /// No contiguous page range left for a new section
    AllocationFailed,

    /// IPMB send finished without a complete-send verdict
    SendNotComplete,

    /// Inbound IPMB frame failed checksum or length validation
    InvalidFrame,

    /// Bounded ISR queue was full, element dropped
    QueueOverflow,

    /// Storage canary overwritten; flushing permanently refused
    CanaryCorrupted,

    /// EEPROM page write failed; retried on the next flush cycle
    EepromWriteFailed,

    /// Hardware not initialized
    NotInitialized,

    /// Operation timed out
    Timeout,
}

impl PmcError {
    /// Get error code for logging
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidChannel => 1,
            Self::InvalidZone => 2,
            Self::InvalidPin => 3,
            Self::VersionMismatch => 4,
            Self::SizeOverflow => 5,
            Self::AllocationFailed => 6,
            Self::SendNotComplete => 7,
            Self::InvalidFrame => 8,
            Self::QueueOverflow => 9,
            Self::CanaryCorrupted => 10,
            Self::EepromWriteFailed => 11,
            Self::NotInitialized => 12,
            Self::Timeout => 13,
        }
    }

    /// Get error name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidChannel => "InvalidChannel",
            Self::InvalidZone => "InvalidZone",
            Self::InvalidPin => "InvalidPin",
            Self::VersionMismatch => "VersionMismatch",
            Self::SizeOverflow => "SizeOverflow",
            Self::AllocationFailed => "AllocationFailed",
            Self::SendNotComplete => "SendNotComplete",
            Self::InvalidFrame => "InvalidFrame",
            Self::QueueOverflow => "QueueOverflow",
            Self::CanaryCorrupted => "CanaryCorrupted",
            Self::EepromWriteFailed => "EepromWriteFailed",
            Self::NotInitialized => "NotInitialized",
            Self::Timeout => "Timeout",
        }
    }
}

/// Result type for driver operations
pub type PmcResult<T> = Result<T, PmcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            PmcError::InvalidChannel,
            PmcError::InvalidZone,
            PmcError::InvalidPin,
            PmcError::VersionMismatch,
            PmcError::SizeOverflow,
            PmcError::AllocationFailed,
            PmcError::SendNotComplete,
            PmcError::InvalidFrame,
            PmcError::QueueOverflow,
            PmcError::CanaryCorrupted,
            PmcError::EepromWriteFailed,
            PmcError::NotInitialized,
            PmcError::Timeout,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
                assert_ne!(a.name(), b.name());
            }
        }
    }
}
