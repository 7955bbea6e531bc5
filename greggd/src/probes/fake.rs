use super::{HookLink, LoadedProbe, PerfTable, ProbeModule, ProbeRuntime, RingReader};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Compile,
    LoadKprobe(String),
    LoadTracepoint(String),
    LoadRawTracepoint(String),
    AttachKprobe(String),
    AttachKretprobe(String),
    AttachTracepoint(String),
    AttachRawTracepoint(String),
    Detach(String),
    OpenTable(String),
    StartReader(String),
    StopReader(String),
    Release,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    fail_compile: bool,
    fail_attach: Option<String>,
    feeds: HashMap<String, mpsc::Sender<Vec<u8>>>,
}

/// Probe runtime that records every call instead of touching the kernel.
#[derive(Clone, Default)]
pub(crate) struct FakeProbes {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProbes {
    pub fn failing_attach(target: &str) -> FakeProbes {
        let probes = FakeProbes::default();
        probes.state.lock().fail_attach = Some(target.to_string());
        probes
    }

    pub fn failing_compile() -> FakeProbes {
        let probes = FakeProbes::default();
        probes.state.lock().fail_compile = true;
        probes
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn module(&self) -> Box<dyn ProbeModule> {
        Box::new(FakeModule {
            state: self.state.clone(),
            links: Vec::new(),
            released: false,
        })
    }

    /// Waits until a reader for `table` has started and returns its feed.
    pub async fn feed(&self, table: &str) -> mpsc::Sender<Vec<u8>> {
        loop {
            if let Some(feed) = self.state.lock().feeds.get(table) {
                return feed.clone();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Drops the stored feed so the reader's channel closes.
    pub fn close_feed(&self, table: &str) {
        self.state.lock().feeds.remove(table);
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }
}

/// Writes a stand-in object file and returns its path.
pub(crate) fn object_file(tag: &str) -> String {
    let path = std::env::temp_dir().join(format!("greggd-{}-{}.o", std::process::id(), tag));
    std::fs::write(&path, b"\x7fELF").unwrap();
    path.to_string_lossy().into_owned()
}

impl ProbeRuntime for FakeProbes {
    fn compile_and_load(
        &mut self,
        _source: &[u8],
        _flags: &[String],
    ) -> Result<Box<dyn ProbeModule>, anyhow::Error> {
        self.record(Call::Compile);
        if self.state.lock().fail_compile {
            return Err(anyhow!("invalid ELF header"));
        }
        Ok(self.module())
    }
}

struct FakeModule {
    state: Arc<Mutex<FakeState>>,
    links: Vec<Option<String>>,
    released: bool,
}

impl FakeModule {
    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    fn attach(&mut self, call: Call, target: &str) -> Result<HookLink, anyhow::Error> {
        self.record(call);
        if self.state.lock().fail_attach.as_deref() == Some(target) {
            return Err(anyhow!("no such symbol: {}", target));
        }
        self.links.push(Some(target.to_string()));
        Ok(HookLink(self.links.len() - 1))
    }
}

impl ProbeModule for FakeModule {
    fn load_kprobe(&mut self, entry: &str) -> Result<LoadedProbe, anyhow::Error> {
        self.record(Call::LoadKprobe(entry.to_string()));
        Ok(LoadedProbe::new(entry))
    }

    fn load_tracepoint(&mut self, entry: &str) -> Result<LoadedProbe, anyhow::Error> {
        self.record(Call::LoadTracepoint(entry.to_string()));
        Ok(LoadedProbe::new(entry))
    }

    fn load_raw_tracepoint(&mut self, entry: &str) -> Result<LoadedProbe, anyhow::Error> {
        self.record(Call::LoadRawTracepoint(entry.to_string()));
        Ok(LoadedProbe::new(entry))
    }

    fn attach_kprobe(&mut self, _: &LoadedProbe, target: &str) -> Result<HookLink, anyhow::Error> {
        self.attach(Call::AttachKprobe(target.to_string()), target)
    }

    fn attach_kretprobe(
        &mut self,
        _: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error> {
        self.attach(Call::AttachKretprobe(target.to_string()), target)
    }

    fn attach_tracepoint(
        &mut self,
        _: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error> {
        self.attach(Call::AttachTracepoint(target.to_string()), target)
    }

    fn attach_raw_tracepoint(
        &mut self,
        _: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error> {
        self.attach(Call::AttachRawTracepoint(target.to_string()), target)
    }

    fn detach(&mut self, link: HookLink) -> Result<(), anyhow::Error> {
        let target = self
            .links
            .get_mut(link.0)
            .and_then(Option::take)
            .ok_or_else(|| anyhow!("hook {} is not attached", link.0))?;
        self.record(Call::Detach(target));
        Ok(())
    }

    fn open_table(&mut self, table_id: &str) -> Result<Box<dyn PerfTable>, anyhow::Error> {
        self.record(Call::OpenTable(table_id.to_string()));
        Ok(Box::new(FakeTable {
            id: table_id.to_string(),
            state: self.state.clone(),
        }))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let remaining: Vec<String> = self.links.drain(..).rev().flatten().collect();
        for target in remaining {
            self.record(Call::Detach(target));
        }
        self.record(Call::Release);
    }
}

struct FakeTable {
    id: String,
    state: Arc<Mutex<FakeState>>,
}

impl PerfTable for FakeTable {
    fn init_reader(
        self: Box<Self>,
        batches: mpsc::Sender<Vec<u8>>,
    ) -> Result<Box<dyn RingReader>, anyhow::Error> {
        Ok(Box::new(FakeReader {
            id: self.id,
            state: self.state,
            batches: Some(batches),
            running: false,
        }))
    }
}

struct FakeReader {
    id: String,
    state: Arc<Mutex<FakeState>>,
    batches: Option<mpsc::Sender<Vec<u8>>>,
    running: bool,
}

impl RingReader for FakeReader {
    fn start(&mut self) -> Result<(), anyhow::Error> {
        let batches = self
            .batches
            .take()
            .ok_or_else(|| anyhow!("reader for {} was stopped", self.id))?;
        let mut state = self.state.lock();
        state.calls.push(Call::StartReader(self.id.clone()));
        state.feeds.insert(self.id.clone(), batches);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.batches = None;
        if self.running {
            self.running = false;
            let mut state = self.state.lock();
            state.calls.push(Call::StopReader(self.id.clone()));
            state.feeds.remove(&self.id);
        }
    }
}
