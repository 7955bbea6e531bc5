pub mod kernel;
pub mod perf;

#[cfg(test)]
pub(crate) mod fake;

use tokio::sync::mpsc;

/// A program function loaded into the kernel, not yet bound to a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoadedProbe {
    pub entry: String,
}

impl LoadedProbe {
    pub fn new(entry: &str) -> LoadedProbe {
        LoadedProbe {
            entry: entry.to_string(),
        }
    }
}

/// Handle of an attached hook, valid for the module that returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HookLink(pub usize);

/// Compiles or loads program bytecode. One instance per program run.
pub(crate) trait ProbeRuntime: Send + 'static {
    fn compile_and_load(
        &mut self,
        source: &[u8],
        flags: &[String],
    ) -> Result<Box<dyn ProbeModule>, anyhow::Error>;
}

/// Bytecode loaded into the kernel together with everything attached from it.
pub(crate) trait ProbeModule: Send {
    fn load_kprobe(&mut self, entry: &str) -> Result<LoadedProbe, anyhow::Error>;
    fn load_tracepoint(&mut self, entry: &str) -> Result<LoadedProbe, anyhow::Error>;
    fn load_raw_tracepoint(&mut self, entry: &str) -> Result<LoadedProbe, anyhow::Error>;

    fn attach_kprobe(&mut self, probe: &LoadedProbe, target: &str)
        -> Result<HookLink, anyhow::Error>;
    fn attach_kretprobe(
        &mut self,
        probe: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error>;
    fn attach_tracepoint(
        &mut self,
        probe: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error>;
    fn attach_raw_tracepoint(
        &mut self,
        probe: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error>;

    /// Removes one hook. Detaching an unknown or already detached link is an error.
    fn detach(&mut self, link: HookLink) -> Result<(), anyhow::Error>;

    fn open_table(&mut self, table_id: &str) -> Result<Box<dyn PerfTable>, anyhow::Error>;

    /// Detaches every remaining hook and unloads the bytecode. Safe to call twice.
    fn release(&mut self);
}

pub(crate) trait PerfTable: Send {
    /// Binds a reader that pushes every raw record it drains into `batches`.
    fn init_reader(
        self: Box<Self>,
        batches: mpsc::Sender<Vec<u8>>,
    ) -> Result<Box<dyn RingReader>, anyhow::Error>;
}

pub(crate) trait RingReader: Send {
    fn start(&mut self) -> Result<(), anyhow::Error>;
    fn stop(&mut self);
}
