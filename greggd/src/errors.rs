use std::fmt;
use thiserror::Error;

/// Descriptor problems, caught before any kernel resource exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing attribute: {field} ({context})")]
    MissingField { field: &'static str, context: String },
    #[error("Event type {0:?} is not supported")]
    UnsupportedEventKind(String),
    #[error("Output {output:?} has unsupported type {kind:?}")]
    UnsupportedOutputKind { output: String, kind: String },
    #[error("Field {field:?} has unsupported type {kind:?}")]
    UnsupportedFieldType { field: String, kind: String },
    #[error("Field name {0:?} is used more than once")]
    DuplicateFieldName(String),
    #[error("Field {0:?} is a second unsized char[]; only one field may take its length from the record")]
    AmbiguousLayout(String),
}

impl ConfigError {
    pub fn identifier(&self) -> &str {
        match self {
            ConfigError::MissingField { context, .. } => context,
            ConfigError::UnsupportedEventKind(kind) => kind,
            ConfigError::UnsupportedOutputKind { output, .. } => output,
            ConfigError::UnsupportedFieldType { field, .. } => field,
            ConfigError::DuplicateFieldName(name) => name,
            ConfigError::AmbiguousLayout(name) => name,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short for field {field:?}: need {needed} bytes, got {available}")]
    Truncated {
        field: String,
        needed: usize,
        available: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    Load,
    Attach,
    Poll,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Config => "config",
            Stage::Load => "load",
            Stage::Attach => "attach",
            Stage::Poll => "poll",
        };
        f.write_str(s)
    }
}

/// Fatal error of one program run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Could not load program {source_ref}: {cause}")]
    Load { source_ref: String, cause: String },
    #[error("Could not load {entry} for {target}: {cause}")]
    ProbeLoad {
        entry: String,
        target: String,
        cause: String,
    },
    #[error("Could not attach {entry} to {target}: {cause}")]
    Attach {
        entry: String,
        target: String,
        cause: String,
    },
    #[error("Could not decode record from {output}: {error}")]
    Decode {
        output: String,
        #[source]
        error: DecodeError,
    },
    #[error("Output {output} failed: {cause}")]
    Runtime { output: String, cause: String },
    #[error("Program {0} has already run")]
    AlreadyRun(String),
}

impl TraceError {
    pub fn stage(&self) -> Stage {
        match self {
            TraceError::Config(_) | TraceError::AlreadyRun(_) => Stage::Config,
            TraceError::Load { .. } => Stage::Load,
            TraceError::ProbeLoad { .. } | TraceError::Attach { .. } => Stage::Attach,
            TraceError::Decode { .. } | TraceError::Runtime { .. } => Stage::Poll,
        }
    }

    /// Source path, event target or output id the failure is about.
    pub fn identifier(&self) -> &str {
        match self {
            TraceError::Config(e) => e.identifier(),
            TraceError::Load { source_ref, .. } => source_ref,
            TraceError::ProbeLoad { target, .. } | TraceError::Attach { target, .. } => target,
            TraceError::Decode { output, .. } | TraceError::Runtime { output, .. } => output,
            TraceError::AlreadyRun(name) => name,
        }
    }
}
