//! Publication sinks for accepted origins
//!
//! The engine hands every origin that passes its publication policy to a
//! [`ReportSink`]. A sink returning `false` keeps the origin queued and the
//! engine retries on the next flush.

pub mod jsonl;

pub use jsonl::{ArrivalRecord, JsonlOriginWriter, OriginRecord};

use crate::model::Origin;

/// Destination for published origins
pub trait ReportSink: Send {
    /// Publish one origin. Returns whether it was accepted.
    fn report(&mut self, origin: &Origin) -> bool;

    /// Flush buffered output
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    /// Sink type for logging
    fn sink_type(&self) -> &'static str;
}

/// Sink that only writes the origin summary to the log
#[derive(Debug, Default)]
pub struct LogSink {
    sent: usize,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent
    }
}

impl ReportSink for LogSink {
    fn report(&mut self, origin: &Origin) -> bool {
        self.sent += 1;
        log::info!("REPORT {}", origin.oneliner());
        true
    }

    fn sink_type(&self) -> &'static str {
        "log"
    }
}
