use crate::errors::{ConfigError, TraceError};
use crate::probes::{HookLink, ProbeModule};
use greggd_common::{EventKind, EventSpec, GreggdVar};
use tracing::info;

/// Checks an event without touching the runtime and resolves its kind.
pub(crate) fn validate_event(event: &EventSpec) -> Result<EventKind, ConfigError> {
    let missing: Option<(&'static str, &String)> = [
        ("type", &event.kind),
        ("load_func", &event.load_func),
        ("attach_to", &event.attach_to),
    ]
    .into_iter()
    .find(|(_, v)| v.trim().is_empty());

    if let Some((field, _)) = missing {
        return Err(ConfigError::MissingField {
            field,
            context: format!("event {:?} -> {:?}", event.load_func, event.attach_to),
        });
    }

    let mut kind = event.kind.clone();
    match EventKind::from_str(kind.as_mut_str()) {
        EventKind::Undefined => Err(ConfigError::UnsupportedEventKind(event.kind.clone())),
        kind => Ok(kind),
    }
}

/// Loads the event's entry function and binds it to its target.
pub(crate) fn attach(
    event: &EventSpec,
    module: &mut dyn ProbeModule,
) -> Result<HookLink, TraceError> {
    let kind = validate_event(event)?;
    let entry = event.load_func.as_str();
    let target = event.attach_to.as_str();

    let load_err = |e: anyhow::Error| TraceError::ProbeLoad {
        entry: entry.to_string(),
        target: target.to_string(),
        cause: format!("{:#}", e),
    };
    let attach_err = |e: anyhow::Error| TraceError::Attach {
        entry: entry.to_string(),
        target: target.to_string(),
        cause: format!("{:#}", e),
    };

    let link = match kind {
        EventKind::Kprobe => {
            let probe = module.load_kprobe(entry).map_err(load_err)?;
            module.attach_kprobe(&probe, target)
        }
        EventKind::Kretprobe => {
            let probe = module.load_kprobe(entry).map_err(load_err)?;
            module.attach_kretprobe(&probe, target)
        }
        EventKind::Tracepoint => {
            let probe = module.load_tracepoint(entry).map_err(load_err)?;
            module.attach_tracepoint(&probe, target)
        }
        EventKind::RawTracepoint => {
            let probe = module.load_raw_tracepoint(entry).map_err(load_err)?;
            module.attach_raw_tracepoint(&probe, target)
        }
        EventKind::Undefined => {
            return Err(ConfigError::UnsupportedEventKind(event.kind.clone()).into());
        }
    }
    .map_err(attach_err)?;

    info!("Attached {:?} {} to {}", kind, entry, target);
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::{attach, validate_event};
    use crate::errors::{ConfigError, TraceError};
    use crate::probes::fake::{Call, FakeProbes};

    fn event(kind: &str, load_func: &str, attach_to: &str) -> greggd_common::EventSpec {
        greggd_common::EventSpec {
            kind: kind.to_string(),
            load_func: load_func.to_string(),
            attach_to: attach_to.to_string(),
        }
    }

    #[test]
    fn missing_fields_never_reach_the_runtime() {
        let probes = FakeProbes::default();
        let mut module = probes.module();

        for (ev, field) in [
            (event("", "trace_exec", "sys_enter_execve"), "type"),
            (event("kprobe", "", "tcp_set_state"), "load_func"),
            (event("kprobe", "trace_state", ""), "attach_to"),
        ] {
            match attach(&ev, module.as_mut()) {
                Err(TraceError::Config(ConfigError::MissingField { field: f, .. })) => {
                    assert_eq!(f, field)
                }
                other => panic!("expected MissingField, got {:?}", other),
            }
        }
        assert!(probes.calls().is_empty());
    }

    #[test]
    fn each_kind_uses_its_own_pair() {
        let cases = [
            (
                "Kprobe",
                Call::LoadKprobe("f".into()),
                Call::AttachKprobe("t".into()),
            ),
            (
                "kprobe",
                Call::LoadKprobe("f".into()),
                Call::AttachKprobe("t".into()),
            ),
            (
                "KRETPROBE",
                Call::LoadKprobe("f".into()),
                Call::AttachKretprobe("t".into()),
            ),
            (
                "tracepoint",
                Call::LoadTracepoint("f".into()),
                Call::AttachTracepoint("t".into()),
            ),
            (
                "RawTracepoint",
                Call::LoadRawTracepoint("f".into()),
                Call::AttachRawTracepoint("t".into()),
            ),
        ];

        for (kind, load, bind) in cases {
            let probes = FakeProbes::default();
            let mut module = probes.module();
            attach(&event(kind, "f", "t"), module.as_mut()).unwrap();
            assert_eq!(probes.calls(), vec![load, bind], "kind {}", kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let probes = FakeProbes::default();
        let mut module = probes.module();
        let err = attach(&event("uprobe", "f", "t"), module.as_mut()).unwrap_err();
        assert_eq!(
            err,
            TraceError::Config(ConfigError::UnsupportedEventKind("uprobe".to_string()))
        );
        assert!(probes.calls().is_empty());
        assert!(validate_event(&event("kprobe", "f", "t")).is_ok());
    }

    #[test]
    fn attach_failure_names_target() {
        let probes = FakeProbes::failing_attach("tcp_v4_connect");
        let mut module = probes.module();
        let err = attach(
            &event("kprobe", "trace_connect", "tcp_v4_connect"),
            module.as_mut(),
        )
        .unwrap_err();
        assert!(matches!(err, TraceError::Attach { .. }));
        assert_eq!(err.identifier(), "tcp_v4_connect");
    }
}
