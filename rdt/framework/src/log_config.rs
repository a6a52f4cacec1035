// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types specifying how the harness's logs should be formatted.

/// Specifies how the harness's logging should be managed.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    pub log_format: LogFormat,

    /// Whether plain output may contain terminal control codes.
    pub ansi: bool,
}

/// Specifies how log output should be structured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Format logs as plain hopefully human-readable output.
    Plain,

    /// Format logs as Bunyan output, more suitable for machine processing (such
    /// as in CI).
    Bunyan,
}

impl LogConfig {
    pub fn new(emit_bunyan: bool, disable_ansi: bool) -> Self {
        Self {
            log_format: if emit_bunyan {
                LogFormat::Bunyan
            } else {
                LogFormat::Plain
            },
            ansi: !disable_ansi && !emit_bunyan,
        }
    }
}
