// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Logger handle with severity filtering.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{Facility, Severity};

struct Inner {
    /// Global minimum severity, stored as the enum discriminant
    global_level: AtomicU8,
    /// Per-facility overrides; take precedence over the global level
    facility_levels: RwLock<HashMap<Facility, Severity>>,
    /// Serialized output sink
    sink: Mutex<Box<dyn Write + Send>>,
}

/// Cheaply cloneable logger handle shared by all engine components.
pub struct Logger {
    inner: Arc<Inner>,
}

impl Logger {
    /// Create a logger writing to stderr with the given minimum severity.
    pub fn stderr(level: Severity) -> Self {
        Self::with_sink(level, Box::new(std::io::stderr()))
    }

    /// Create a logger with an arbitrary sink. Used by tests to capture
    /// output.
    pub fn with_sink(level: Severity, sink: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Inner {
                global_level: AtomicU8::new(level as u8),
                facility_levels: RwLock::new(HashMap::new()),
                sink: Mutex::new(sink),
            }),
        }
    }

    /// Change the global minimum severity.
    pub fn set_global_level(&self, level: Severity) {
        self.inner.global_level.store(level as u8, Ordering::Relaxed);
    }

    /// Override the minimum severity for one facility.
    pub fn set_facility_level(&self, facility: Facility, level: Severity) {
        self.inner
            .facility_levels
            .write()
            .unwrap()
            .insert(facility, level);
    }

    /// Whether a message at this severity/facility would reach the sink.
    /// Call sites use this to skip formatting for filtered messages.
    #[inline]
    pub fn enabled(&self, severity: Severity, facility: Facility) -> bool {
        if let Some(level) = self.inner.facility_levels.read().unwrap().get(&facility) {
            return severity <= *level;
        }
        severity as u8 <= self.inner.global_level.load(Ordering::Relaxed)
    }

    /// Write a log line. Filtering is the caller's job (via `enabled` or the
    /// `log_*` macros); this always emits.
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut sink = self.inner.sink.lock().unwrap();
        // A broken sink must never take the engine down with it.
        let _ = writeln!(
            sink,
            "{}.{:03} {:7} [{}] {}",
            now.as_secs(),
            now.subsec_millis(),
            severity.as_str(),
            facility.as_str(),
            message
        );
    }

    pub fn error(&self, facility: Facility, message: &str) {
        if self.enabled(Severity::Error, facility) {
            self.log(Severity::Error, facility, message);
        }
    }

    pub fn warning(&self, facility: Facility, message: &str) {
        if self.enabled(Severity::Warning, facility) {
            self.log(Severity::Warning, facility, message);
        }
    }

    pub fn notice(&self, facility: Facility, message: &str) {
        if self.enabled(Severity::Notice, facility) {
            self.log(Severity::Notice, facility, message);
        }
    }

    pub fn info(&self, facility: Facility, message: &str) {
        if self.enabled(Severity::Info, facility) {
            self.log(Severity::Info, facility, message);
        }
    }

    pub fn debug(&self, facility: Facility, message: &str) {
        if self.enabled(Severity::Debug, facility) {
            self.log(Severity::Debug, facility, message);
        }
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
