//! Macro for implementing Display and FromStr for status enums
//!
//! Status enums are persisted as lowercase text columns. The macro keeps the
//! column representation and the parser in one place so they cannot drift.
//!
//! # Example
//!
//! ```rust
//! use calsync_domain::impl_domain_status_conversions;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum PassStatus {
//!     Queued,
//!     Running,
//!     Done,
//! }
//!
//! impl_domain_status_conversions!(PassStatus {
//!     Queued => "queued",
//!     Running => "running",
//!     Done => "done",
//! });
//!
//! assert_eq!(PassStatus::Running.to_string(), "running");
//! assert_eq!("DONE".parse::<PassStatus>(), Ok(PassStatus::Done));
//! ```

/// Implements Display and FromStr traits for status enums
///
/// Parsing is case-insensitive; output is always the mapped string.
#[macro_export]
macro_rules! impl_domain_status_conversions {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, $str),)+
                }
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($enum_name), s)),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestStatus {
        Pending,
        InFlight,
        Abandoned,
    }

    impl_domain_status_conversions!(TestStatus {
        Pending => "pending",
        InFlight => "in_flight",
        Abandoned => "abandoned",
    });

    #[test]
    fn test_display_conversion() {
        assert_eq!(TestStatus::Pending.to_string(), "pending");
        assert_eq!(TestStatus::InFlight.to_string(), "in_flight");
        assert_eq!(TestStatus::Abandoned.to_string(), "abandoned");
    }

    #[test]
    fn test_fromstr_mixed_case() {
        assert_eq!(TestStatus::from_str("PENDING").unwrap(), TestStatus::Pending);
        assert_eq!(TestStatus::from_str("In_Flight").unwrap(), TestStatus::InFlight);
    }

    #[test]
    fn test_fromstr_invalid() {
        let result = TestStatus::from_str("sent");
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("Invalid TestStatus: sent"));
    }
}
