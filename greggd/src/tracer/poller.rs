use super::schema::RecordSchema;
use crate::errors::{ConfigError, TraceError};
use crate::logs::RecordSink;
use crate::probes::{ProbeModule, RingReader};
use greggd_common::{GreggdVar, OutputKind, OutputSpec};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Checks an output descriptor and resolves its table kind.
pub(crate) fn validate_output(output: &OutputSpec) -> Result<OutputKind, ConfigError> {
    if output.id.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "id",
            context: format!("output of type {:?}", output.kind),
        });
    }
    if output.kind.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "type",
            context: output.id.clone(),
        });
    }

    let mut kind = output.kind.clone();
    match OutputKind::from_str(kind.as_mut_str()) {
        OutputKind::Undefined => Err(ConfigError::UnsupportedOutputKind {
            output: output.id.clone(),
            kind: output.kind.clone(),
        }),
        kind => Ok(kind),
    }
}

/// Hands an error to the program's error channel. The first error wins; once
/// the channel is full or gone, shutdown is already under way.
pub(crate) fn report(errors: &mpsc::Sender<TraceError>, err: TraceError) {
    if let Err(e) = errors.try_send(err) {
        debug!("Dropping error reported during shutdown: {}", e.into_inner());
    }
}

/// Drains one kernel table and decodes every record with its schema.
pub(crate) struct OutputPoller {
    program: String,
    output: String,
    schema: Arc<RecordSchema>,
    reader: Box<dyn RingReader>,
    batches: mpsc::Receiver<Vec<u8>>,
}

impl OutputPoller {
    pub fn open(
        program: &str,
        output: &OutputSpec,
        schema: Arc<RecordSchema>,
        module: &mut dyn ProbeModule,
        batch_capacity: usize,
    ) -> Result<OutputPoller, TraceError> {
        validate_output(output)?;

        let runtime_err = |e: anyhow::Error| TraceError::Runtime {
            output: output.id.clone(),
            cause: format!("{:#}", e),
        };

        let table = module.open_table(&output.id).map_err(runtime_err)?;
        let (snd, batches) = mpsc::channel(batch_capacity.max(1));
        let reader = table.init_reader(snd).map_err(runtime_err)?;

        Ok(OutputPoller {
            program: program.to_string(),
            output: output.id.clone(),
            schema,
            reader,
            batches,
        })
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Runs until `cancel` fires or the output fails. A failure is reported on
    /// `errors` and raises `cancel` for the rest of the program.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        errors: mpsc::Sender<TraceError>,
        sink: Arc<dyn RecordSink>,
    ) {
        if let Err(e) = self.reader.start() {
            report(
                &errors,
                TraceError::Runtime {
                    output: self.output.clone(),
                    cause: format!("{:#}", e),
                },
            );
            cancel.cancel();
            return;
        }
        info!(
            "Polling {} ({} fields, at least {} bytes per record)",
            self.output,
            self.schema.field_names().count(),
            self.schema.min_size()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Poller for {} cancelled", self.output);
                    break;
                }
                batch = self.batches.recv() => {
                    let failure = match batch {
                        Some(bytes) => match self.schema.decode(&bytes) {
                            Ok(record) => {
                                sink.emit(&self.program, &self.output, &record);
                                continue;
                            }
                            Err(error) => TraceError::Decode {
                                output: self.output.clone(),
                                error,
                            },
                        },
                        None => TraceError::Runtime {
                            output: self.output.clone(),
                            cause: "ring buffer reader stopped delivering".to_string(),
                        },
                    };
                    report(&errors, failure);
                    cancel.cancel();
                    break;
                }
            }
        }

        self.reader.stop();
    }
}
