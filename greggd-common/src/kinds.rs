pub trait GreggdVar {
    fn from_str(_: &mut str) -> Self;
    fn is_undefined(&self) -> bool {
        false
    }
}

/// Hook flavour of a configured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Undefined,
    Kprobe,
    Kretprobe,
    Tracepoint,
    RawTracepoint,
}

impl GreggdVar for EventKind {
    fn from_str(s: &mut str) -> Self {
        s.make_ascii_lowercase();
        match s.trim() {
            "kprobe" => EventKind::Kprobe,
            "kretprobe" => EventKind::Kretprobe,
            "tracepoint" => EventKind::Tracepoint,
            "rawtracepoint" | "raw_tracepoint" => EventKind::RawTracepoint,
            _ => EventKind::Undefined,
        }
    }

    fn is_undefined(&self) -> bool {
        matches!(self, EventKind::Undefined)
    }
}

/// Kernel table flavour an output is read from. Only perf ring buffers exist so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Undefined,
    PerfRingBuffer,
}

impl GreggdVar for OutputKind {
    fn from_str(s: &mut str) -> Self {
        s.make_ascii_lowercase();
        match s.trim() {
            "bpf_perf_output" | "perf_output" | "perf_event_array" | "perfringbuffer" => {
                OutputKind::PerfRingBuffer
            }
            _ => OutputKind::Undefined,
        }
    }

    fn is_undefined(&self) -> bool {
        matches!(self, OutputKind::Undefined)
    }
}

/// Primitive type of one record field.
///
/// `ByteArray(None)` is sized by the wire record, `ByteArray(Some(n))` is a
/// fixed `char[n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Undefined,
    U64,
    U32,
    Int,
    ByteArray(Option<usize>),
}

impl GreggdVar for FieldType {
    fn from_str(s: &mut str) -> Self {
        s.make_ascii_lowercase();
        match s.trim() {
            "u64" => FieldType::U64,
            "u32" => FieldType::U32,
            "int" => FieldType::Int,
            "char[]" | "bytes" => FieldType::ByteArray(None),
            other => match other
                .strip_prefix("char[")
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|len| len.trim().parse::<usize>().ok())
            {
                Some(len) if len > 0 => FieldType::ByteArray(Some(len)),
                _ => FieldType::Undefined,
            },
        }
    }

    fn is_undefined(&self) -> bool {
        matches!(self, FieldType::Undefined)
    }
}
