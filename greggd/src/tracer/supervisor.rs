use super::attach::{attach, validate_event};
use super::poller::{validate_output, OutputPoller};
use super::schema::RecordSchema;
use crate::config::GreggdLimits;
use crate::errors::{ConfigError, TraceError};
use crate::logs::RecordSink;
use crate::probes::{HookLink, ProbeModule, ProbeRuntime};
use greggd_common::{FieldSpec, ProgramSpec};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Clean,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProgramState {
    Idle,
    BytecodeLoaded,
    HooksAttached,
    Polling,
    Stopped(StopReason),
}

/// Owns one program from load to release.
pub(crate) struct Supervisor<R: ProbeRuntime> {
    name: String,
    program: ProgramSpec,
    runtime: R,
    sink: Arc<dyn RecordSink>,
    limits: GreggdLimits,
    state: ProgramState,
    module: Option<Box<dyn ProbeModule>>,
    hooks: Vec<HookLink>,
}

impl<R: ProbeRuntime> Supervisor<R> {
    pub fn new(
        program: ProgramSpec,
        runtime: R,
        sink: Arc<dyn RecordSink>,
        limits: GreggdLimits,
    ) -> Supervisor<R> {
        Supervisor {
            name: program.display_name(),
            program,
            runtime,
            sink,
            limits,
            state: ProgramState::Idle,
            module: None,
            hooks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    /// Runs the program until `shutdown` fires or something fails. Hooks and
    /// bytecode are released on every exit path.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<(), TraceError> {
        if self.state != ProgramState::Idle {
            return Err(TraceError::AlreadyRun(self.name.clone()));
        }

        let result = self.drive(shutdown).await;
        self.teardown();

        match &result {
            Ok(()) => {
                self.state = ProgramState::Stopped(StopReason::Clean);
                info!("Program {} stopped", self.name);
            }
            Err(e) => {
                self.state = ProgramState::Stopped(StopReason::Error);
                error!(
                    target: "error",
                    program = self.name.as_str(),
                    stage = %e.stage(),
                    identifier = e.identifier(),
                    "Program {} failed: {}",
                    self.name,
                    e
                );
            }
        }
        result
    }

    /// Detaches hooks in reverse order and releases the module.
    pub fn teardown(&mut self) {
        let Some(mut module) = self.module.take() else {
            return;
        };
        while let Some(link) = self.hooks.pop() {
            if let Err(e) = module.detach(link) {
                warn!(target: "error", "Could not detach hook of {}. Err: {:#}", self.name, e);
            }
        }
        module.release();
        debug!("Released {}", self.name);
    }

    async fn drive(&mut self, shutdown: &CancellationToken) -> Result<(), TraceError> {
        let schemas = self.prepare()?;
        self.load().await?;
        self.attach_hooks()?;
        let pollers = self.open_outputs(schemas)?;
        self.poll(pollers, shutdown).await
    }

    /// Resolves every kind and schema up front. Outputs with identical
    /// formats share one schema.
    fn prepare(&self) -> Result<Vec<Arc<RecordSchema>>, ConfigError> {
        if self.program.source.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "source",
                context: self.name.clone(),
            });
        }
        for event in &self.program.events {
            validate_event(event)?;
        }

        let mut built: HashMap<&[FieldSpec], Arc<RecordSchema>> = HashMap::new();
        let mut schemas = Vec::with_capacity(self.program.outputs.len());
        for output in &self.program.outputs {
            validate_output(output)?;
            let schema = match built.get(output.format.as_slice()) {
                Some(schema) => schema.clone(),
                None => {
                    let schema = Arc::new(RecordSchema::build(&output.format)?);
                    built.insert(output.format.as_slice(), schema.clone());
                    schema
                }
            };
            schemas.push(schema);
        }
        Ok(schemas)
    }

    async fn load(&mut self) -> Result<(), TraceError> {
        let source = &self.program.source;
        let load_err = |cause: String| TraceError::Load {
            source_ref: source.clone(),
            cause,
        };

        let bytecode = tokio::fs::read(source)
            .await
            .map_err(|e| load_err(e.to_string()))?;
        let module = self
            .runtime
            .compile_and_load(&bytecode, &self.program.cflags)
            .map_err(|e| load_err(format!("{:#}", e)))?;

        info!("Loaded {} from {}", self.name, source);
        self.module = Some(module);
        self.state = ProgramState::BytecodeLoaded;
        Ok(())
    }

    fn attach_hooks(&mut self) -> Result<(), TraceError> {
        let Supervisor {
            program,
            module,
            hooks,
            state,
            ..
        } = self;
        let module = loaded(module, &program.source)?;

        for event in &program.events {
            hooks.push(attach(event, module)?);
        }
        *state = ProgramState::HooksAttached;
        Ok(())
    }

    fn open_outputs(
        &mut self,
        schemas: Vec<Arc<RecordSchema>>,
    ) -> Result<Vec<OutputPoller>, TraceError> {
        let module = loaded(&mut self.module, &self.program.source)?;

        self.program
            .outputs
            .iter()
            .zip(schemas)
            .map(|(output, schema)| {
                OutputPoller::open(
                    &self.name,
                    output,
                    schema,
                    module,
                    self.limits.batch_capacity,
                )
            })
            .collect()
    }

    async fn poll(
        &mut self,
        pollers: Vec<OutputPoller>,
        shutdown: &CancellationToken,
    ) -> Result<(), TraceError> {
        self.state = ProgramState::Polling;

        let cancel = shutdown.child_token();
        let (errors, mut failures) = mpsc::channel(pollers.len().max(1));
        let mut tasks = JoinSet::new();
        for poller in pollers {
            debug!("Starting poller for {}", poller.output());
            tasks.spawn(poller.run(cancel.clone(), errors.clone(), self.sink.clone()));
        }
        drop(errors);

        let mut failure = tokio::select! {
            _ = cancel.cancelled() => None,
            Some(err) = failures.recv() => Some(err),
        };
        cancel.cancel();

        let grace = self.limits.shutdown_grace();
        let joined = timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!(target: "error", "Pollers of {} still running after {:?}, aborting", self.name, grace);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        if failure.is_none() {
            failure = failures.try_recv().ok();
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn loaded<'a>(
    module: &'a mut Option<Box<dyn ProbeModule>>,
    source: &str,
) -> Result<&'a mut dyn ProbeModule, TraceError> {
    match module {
        Some(module) => Ok(module.as_mut()),
        None => Err(TraceError::Load {
            source_ref: source.to_string(),
            cause: "bytecode is not loaded".to_string(),
        }),
    }
}
