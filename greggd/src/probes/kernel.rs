use super::perf::AyaPerfTable;
use super::{HookLink, LoadedProbe, PerfTable, ProbeModule, ProbeRuntime};
use anyhow::{anyhow, Context};
use aya::maps::AsyncPerfEventArray;
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::raw_trace_point::RawTracePointLinkId;
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::{KProbe, Program, ProgramError, RawTracePoint, TracePoint};
use aya::{Bpf, BpfLoader};
use aya_log::BpfLogger;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Loads compiled BPF objects through aya.
pub(crate) struct AyaRuntime {
    ebpf_logs: bool,
    perf_pages: usize,
}

impl AyaRuntime {
    pub fn new(ebpf_logs: bool, perf_pages: usize) -> AyaRuntime {
        AyaRuntime {
            ebpf_logs,
            perf_pages,
        }
    }
}

impl ProbeRuntime for AyaRuntime {
    fn compile_and_load(
        &mut self,
        source: &[u8],
        flags: &[String],
    ) -> Result<Box<dyn ProbeModule>, anyhow::Error> {
        let globals = parse_globals(flags)?;

        let mut loader = BpfLoader::new();
        for (name, value) in &globals {
            loader.set_global(name.as_str(), value, true);
        }
        let mut bpf = loader.load(source)?;

        // Costs a perf buffer per CPU; only on request.
        if self.ebpf_logs {
            if let Err(e) = BpfLogger::init(&mut bpf) {
                warn!("Failed to initialize eBPF logger. Err: {}", e);
            }
        }

        Ok(Box::new(AyaModule::new(bpf, self.perf_pages)))
    }
}

/// `NAME=VALUE` flags become global overrides in the object's .rodata/.data.
fn parse_globals(flags: &[String]) -> Result<Vec<(String, u64)>, anyhow::Error> {
    let mut globals = Vec::with_capacity(flags.len());
    for flag in flags {
        let (name, value) = flag
            .split_once('=')
            .ok_or_else(|| anyhow!("flag {:?} is not NAME=VALUE", flag))?;
        let value = value.trim();
        let parsed = match value.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => value.parse::<u64>(),
        }
        .with_context(|| format!("flag {:?} has a non-numeric value", flag))?;
        globals.push((name.trim().to_string(), parsed));
    }
    Ok(globals)
}

fn split_tracepoint(target: &str) -> Result<(&str, &str), anyhow::Error> {
    target
        .split_once(':')
        .or_else(|| target.split_once('/'))
        .filter(|(category, name)| !category.is_empty() && !name.is_empty())
        .ok_or_else(|| anyhow!("tracepoint {:?} is not category:name", target))
}

fn program_mut<'a, T>(bpf: &'a mut Bpf, entry: &str) -> Result<&'a mut T, anyhow::Error>
where
    &'a mut T: TryFrom<&'a mut Program, Error = ProgramError>,
{
    let program = bpf
        .program_mut(entry)
        .ok_or_else(|| anyhow!("program {} not found", entry))?;
    Ok(program.try_into()?)
}

enum KernelLink {
    Probe { entry: String, id: KProbeLinkId },
    TracePoint { entry: String, id: TracePointLinkId },
    RawTracePoint { entry: String, id: RawTracePointLinkId },
}

pub(crate) struct AyaModule {
    bpf: Option<Bpf>,
    loaded: HashSet<String>,
    links: Vec<Option<KernelLink>>,
    perf_pages: usize,
}

impl AyaModule {
    fn new(bpf: Bpf, perf_pages: usize) -> AyaModule {
        AyaModule {
            bpf: Some(bpf),
            loaded: HashSet::new(),
            links: Vec::new(),
            perf_pages,
        }
    }

    fn bpf(&mut self) -> Result<&mut Bpf, anyhow::Error> {
        self.bpf
            .as_mut()
            .ok_or_else(|| anyhow!("program was already released"))
    }

    fn push_link(&mut self, link: KernelLink) -> HookLink {
        self.links.push(Some(link));
        HookLink(self.links.len() - 1)
    }

    fn detach_link(bpf: &mut Bpf, link: KernelLink) -> Result<(), anyhow::Error> {
        match link {
            KernelLink::Probe { entry, id } => program_mut::<KProbe>(bpf, &entry)?.detach(id)?,
            KernelLink::TracePoint { entry, id } => {
                program_mut::<TracePoint>(bpf, &entry)?.detach(id)?
            }
            KernelLink::RawTracePoint { entry, id } => {
                program_mut::<RawTracePoint>(bpf, &entry)?.detach(id)?
            }
        }
        Ok(())
    }

    // Several events may share one entry function; it is loaded once.
    fn load_once<T, F>(&mut self, entry: &str, load: F) -> Result<LoadedProbe, anyhow::Error>
    where
        T: 'static,
        for<'a> &'a mut T: TryFrom<&'a mut Program, Error = ProgramError>,
        F: FnOnce(&mut T) -> Result<(), ProgramError>,
    {
        if !self.loaded.contains(entry) {
            let program = program_mut::<T>(self.bpf()?, entry)?;
            load(program)?;
            self.loaded.insert(entry.to_string());
        }
        Ok(LoadedProbe::new(entry))
    }

    fn attach_probe(
        &mut self,
        probe: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error> {
        let program = program_mut::<KProbe>(self.bpf()?, &probe.entry)?;
        let id = program.attach(target, 0)?;
        Ok(self.push_link(KernelLink::Probe {
            entry: probe.entry.clone(),
            id,
        }))
    }
}

impl ProbeModule for AyaModule {
    fn load_kprobe(&mut self, entry: &str) -> Result<LoadedProbe, anyhow::Error> {
        self.load_once::<KProbe, _>(entry, |p| p.load())
    }

    fn load_tracepoint(&mut self, entry: &str) -> Result<LoadedProbe, anyhow::Error> {
        self.load_once::<TracePoint, _>(entry, |p| p.load())
    }

    fn load_raw_tracepoint(&mut self, entry: &str) -> Result<LoadedProbe, anyhow::Error> {
        self.load_once::<RawTracePoint, _>(entry, |p| p.load())
    }

    fn attach_kprobe(
        &mut self,
        probe: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error> {
        self.attach_probe(probe, target)
    }

    // Entry or return flavour comes from the program's ELF section, the
    // attach call is the same.
    fn attach_kretprobe(
        &mut self,
        probe: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error> {
        self.attach_probe(probe, target)
    }

    fn attach_tracepoint(
        &mut self,
        probe: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error> {
        let (category, name) = split_tracepoint(target)?;
        let program = program_mut::<TracePoint>(self.bpf()?, &probe.entry)?;
        let id = program.attach(category, name)?;
        Ok(self.push_link(KernelLink::TracePoint {
            entry: probe.entry.clone(),
            id,
        }))
    }

    fn attach_raw_tracepoint(
        &mut self,
        probe: &LoadedProbe,
        target: &str,
    ) -> Result<HookLink, anyhow::Error> {
        let program = program_mut::<RawTracePoint>(self.bpf()?, &probe.entry)?;
        let id = program.attach(target)?;
        Ok(self.push_link(KernelLink::RawTracePoint {
            entry: probe.entry.clone(),
            id,
        }))
    }

    fn detach(&mut self, link: HookLink) -> Result<(), anyhow::Error> {
        let record = self
            .links
            .get_mut(link.0)
            .and_then(Option::take)
            .ok_or_else(|| anyhow!("hook {} is not attached", link.0))?;
        AyaModule::detach_link(self.bpf()?, record)
    }

    fn open_table(&mut self, table_id: &str) -> Result<Box<dyn PerfTable>, anyhow::Error> {
        let perf_pages = self.perf_pages;
        let map = self
            .bpf()?
            .take_map(table_id)
            .ok_or_else(|| anyhow!("table {} not found", table_id))?;
        let array = AsyncPerfEventArray::try_from(map)?;
        Ok(Box::new(AyaPerfTable::new(table_id, array, perf_pages)))
    }

    fn release(&mut self) {
        let Some(mut bpf) = self.bpf.take() else {
            return;
        };

        for link in self.links.drain(..).rev().flatten() {
            if let Err(e) = AyaModule::detach_link(&mut bpf, link) {
                warn!(target: "error", "Could not detach hook. Err: {}", e);
            }
        }
        self.loaded.clear();

        // Dropping the object unloads the programs and closes the maps.
        drop(bpf);
        debug!("BPF object released");
    }
}

impl Drop for AyaModule {
    fn drop(&mut self) {
        self.release();
    }
}
