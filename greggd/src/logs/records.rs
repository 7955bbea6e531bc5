use crate::tracer::schema::Record;
use tracing::{error, info};

/// Consumer of decoded records.
pub(crate) trait RecordSink: Send + Sync {
    fn emit(&self, program: &str, output: &str, record: &Record);
}

/// Writes each record as a JSON object to the "event" log target.
pub(crate) struct LogSink;

impl RecordSink for LogSink {
    fn emit(&self, program: &str, output: &str, record: &Record) {
        match serde_json::to_string(record) {
            Ok(json) => info!(target: "event", program, output, "{}", json),
            Err(e) => {
                error!(target: "error", "Could not serialize record from {}. Err: {}", output, e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) use memory::MemorySink;
