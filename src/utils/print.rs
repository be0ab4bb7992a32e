//! Logging front end: prefix-tagging wrappers over the `log` facade.
//!
//! Several engines of one process can share a single logger (every
//! multi-node test does), so each line carries a parenthesized prefix
//! naming the node or subsystem it came from:
//!
//! ```text
//! pf_warn!(my_id; "member {} now suspected", peer);
//! ```

/// Logs at TRACE with a `(prefix)` tag.
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $($arg:tt)*) => {
        log::trace!("({}) {}", $prefix, format_args!($($arg)*))
    };
}

/// Logs at DEBUG with a `(prefix)` tag.
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $($arg:tt)*) => {
        log::debug!("({}) {}", $prefix, format_args!($($arg)*))
    };
}

/// Logs at INFO with a `(prefix)` tag.
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $($arg:tt)*) => {
        log::info!("({}) {}", $prefix, format_args!($($arg)*))
    };
}

/// Logs at WARN with a `(prefix)` tag.
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $($arg:tt)*) => {
        log::warn!("({}) {}", $prefix, format_args!($($arg)*))
    };
}

/// Logs at ERROR with a `(prefix)` tag.
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $($arg:tt)*) => {
        log::error!("({}) {}", $prefix, format_args!($($arg)*))
    };
}

/// Logs the message at ERROR, then hands back the same tagged text as
/// an `Err(SquallError)` ready to return:
///
/// ```text
/// return logged_err!(my_id; "peer {} not connected", peer);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $($arg:tt)*) => {{
        pf_error!($prefix; $($arg)*);
        Err($crate::utils::SquallError(format!(
            "({}) {}",
            $prefix,
            format_args!($($arg)*)
        )))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::SquallError;

    #[test]
    fn logged_err_carries_the_tagged_text() {
        let e: Result<(), SquallError> =
            logged_err!(3; "beat {} went unanswered", 7);
        assert_eq!(
            e,
            Err(SquallError("(3) beat 7 went unanswered".into()))
        );
    }

    #[test]
    fn subsystem_prefixes_format_the_same_way() {
        let e: Result<(), SquallError> =
            logged_err!("gms"; "no view installed");
        assert_eq!(
            e,
            Err(SquallError("(gms) no view installed".into()))
        );
    }
}
