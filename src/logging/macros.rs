// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Logging macros. Format arguments are only evaluated when the message
//! passes the severity filter.

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $facility:expr, $($arg:tt)+) => {
        if $logger.enabled($crate::logging::Severity::Error, $facility) {
            $logger.log($crate::logging::Severity::Error, $facility, &format!($($arg)+));
        }
    };
}

#[macro_export]
macro_rules! log_warning {
    ($logger:expr, $facility:expr, $($arg:tt)+) => {
        if $logger.enabled($crate::logging::Severity::Warning, $facility) {
            $logger.log($crate::logging::Severity::Warning, $facility, &format!($($arg)+));
        }
    };
}

#[macro_export]
macro_rules! log_notice {
    ($logger:expr, $facility:expr, $($arg:tt)+) => {
        if $logger.enabled($crate::logging::Severity::Notice, $facility) {
            $logger.log($crate::logging::Severity::Notice, $facility, &format!($($arg)+));
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $facility:expr, $($arg:tt)+) => {
        if $logger.enabled($crate::logging::Severity::Info, $facility) {
            $logger.log($crate::logging::Severity::Info, $facility, &format!($($arg)+));
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $facility:expr, $($arg:tt)+) => {
        if $logger.enabled($crate::logging::Severity::Debug, $facility) {
            $logger.log($crate::logging::Severity::Debug, $facility, &format!($($arg)+));
        }
    };
}
