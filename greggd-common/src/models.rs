use std::path::Path;

/// One configured tracing program.
#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct ProgramSpec {
    pub name: Option<String>,
    /// Compiled BPF object to load.
    pub source: String,
    #[serde(default)]
    pub cflags: Vec<String>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

impl ProgramSpec {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(n) if !n.is_empty() => n.clone(),
            _ => Path::new(&self.source)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.source.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct EventSpec {
    /// kprobe, kretprobe, tracepoint or rawtracepoint
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Program function loaded into the hook.
    #[serde(default)]
    pub load_func: String,
    /// Kernel symbol or tracepoint the function is attached to.
    #[serde(default)]
    pub attach_to: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct OutputSpec {
    /// Name of the table in the program.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Record layout, in byte order.
    #[serde(default)]
    pub format: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq, Hash)]
pub struct FieldSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl FieldSpec {
    pub fn new(name: &str, kind: &str) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            kind: kind.to_string(),
        }
    }
}
