// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Debug-logging functionality.
//!
//! This module is still present when the `log` feature is disabled, but all
//! logging operations are redacted. Redaction completely compiles out log
//! statements: not even the format strings remain in the final binary.
//!
//! `firmstore` code *should not* call into the [`log`] crate directly outside
//! of this module.

#[cfg(doc)]
use __raw_log as log;

/// Checks a condition, logging if it fails.
///
/// If the condition does not hold, constructs the given error, logs it, and
/// returns out of the current function with it.
macro_rules! check {
    ($cond:expr, $error:expr) => {
        if !$cond {
            let error = $error;
            return fail!(
                error,
                "check failure: `{}`; returned {:?}",
                stringify!($cond),
                error,
            );
        }
    };
}

/// Logs a newly-created error value and returns it, wrapped in `Err`.
///
/// This macro is the main way to generate error values that indicate a
/// genuine failure, as opposed to an expected outcome such as a lookup miss.
///
/// For example, instead of writing `foo.ok_or(MyError)`, instead write
/// `foo.ok_or_else(|| fail!(MyError))`.
macro_rules! fail {
    ($error:expr, $($format:tt)+) => {{
        error!($($format)+);
        Err($error.into())
    }};
    ($error:expr) => {{
        let error = $error;
        error!("generated error: `{:?}`", error);
        Err(error.into())
    }};
}

/// Redactable version of [`log::trace!()`].
macro_rules! trace {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        let _ = __raw_log::trace!($($args)*);
    }
}

/// Redactable version of [`log::info!()`].
macro_rules! info {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        let _ = __raw_log::info!($($args)*);
    }
}

/// Redactable version of [`log::warn!()`].
macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        let _ = __raw_log::warn!($($args)*);
    }
}

/// Redactable version of [`log::error!()`].
macro_rules! error {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        let _ = __raw_log::error!($($args)*);
    }
}

/// Set up some life-before-main code that initializes a basic logger for the
/// test binary.
///
/// This needs to happen here, since the test binary's main() cannot be
/// overridden.
#[cfg(test)]
#[ctor::ctor]
fn init_test_logger() {
    env_logger::builder()
        .format(move |_, record| {
            let thread = std::thread::current();
            let name = thread.name().unwrap_or("<unknown>");
            for line in record.args().to_string().trim().lines() {
                // NOTE: we explicitly print to stderr, since this allows the
                // Rust test harness to suppress log statements originating from
                // passing tests.
                eprintln!(
                    "[{level}({thread}) {file}:{line}] {msg}",
                    level = record.level(),
                    thread = name,
                    file = record.file().unwrap_or("<unknown>"),
                    line = record.line().unwrap_or(0),
                    msg = line,
                )
            }
            Ok(())
        })
        .is_test(true)
        .try_init()
        .ok();
}
