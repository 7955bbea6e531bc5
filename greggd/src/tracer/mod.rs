pub mod attach;
pub mod poller;
pub mod schema;
pub mod supervisor;

use crate::config::GreggdLimits;
use crate::errors::TraceError;
use crate::logs::RecordSink;
use crate::probes::ProbeRuntime;
use greggd_common::ProgramSpec;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Outcome of one program run.
#[derive(Debug)]
pub(crate) struct ProgramReport {
    pub program: String,
    pub result: Result<(), TraceError>,
}

/// Runs every program under its own supervisor until `shutdown` fires. A
/// failing program does not stop the others. Reports keep the input order.
pub(crate) async fn trace_all<R, F>(
    programs: Vec<ProgramSpec>,
    mut make_runtime: F,
    sink: Arc<dyn RecordSink>,
    limits: &GreggdLimits,
    shutdown: &CancellationToken,
) -> Vec<ProgramReport>
where
    R: ProbeRuntime,
    F: FnMut() -> R,
{
    let mut tasks = JoinSet::new();
    let mut reports: Vec<Option<ProgramReport>> = Vec::with_capacity(programs.len());

    for (idx, program) in programs.into_iter().enumerate() {
        let mut supervisor =
            Supervisor::new(program, make_runtime(), sink.clone(), limits.clone());
        let shutdown = shutdown.clone();
        reports.push(None);

        tasks.spawn(async move {
            let result = supervisor.run(&shutdown).await;
            debug!("{} finished as {:?}", supervisor.name(), supervisor.state());
            let report = ProgramReport {
                program: supervisor.name().to_string(),
                result,
            };
            (idx, report)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, report)) => reports[idx] = Some(report),
            Err(e) => error!(target: "error", "Program task did not finish. Err: {}", e),
        }
    }

    reports.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::trace_all;
    use crate::config::GreggdLimits;
    use crate::errors::TraceError;
    use crate::logs::records::MemorySink;
    use crate::probes::fake::{object_file, FakeProbes};
    use greggd_common::{EventSpec, FieldSpec, OutputSpec, ProgramSpec};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn program(name: &str, source: String, output: &str) -> ProgramSpec {
        ProgramSpec {
            name: Some(name.to_string()),
            source,
            cflags: Vec::new(),
            events: vec![EventSpec {
                kind: "kprobe".to_string(),
                load_func: "trace_close".to_string(),
                attach_to: "tcp_close".to_string(),
            }],
            outputs: vec![OutputSpec {
                id: output.to_string(),
                kind: "BPF_PERF_OUTPUT".to_string(),
                format: vec![FieldSpec::new("pid", "u32")],
            }],
        }
    }

    #[tokio::test]
    async fn failing_program_does_not_stop_the_others() {
        let probes = FakeProbes::default();
        let sink = Arc::new(MemorySink::default());
        let shutdown = CancellationToken::new();

        let programs = vec![
            program("broken", "/nonexistent/greggd/broken.o".to_string(), "broken_events"),
            program("tcpclose", object_file("tcpclose"), "close_events"),
        ];

        let task = {
            let probes = probes.clone();
            let sink = sink.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                trace_all(
                    programs,
                    || probes.clone(),
                    sink,
                    &GreggdLimits::default(),
                    &shutdown,
                )
                .await
            })
        };

        let feed = probes.feed("close_events").await;
        feed.send(99u32.to_le_bytes().to_vec()).await.unwrap();
        sink.wait_for(1).await;
        shutdown.cancel();

        let reports = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].program, "broken");
        assert!(matches!(reports[0].result, Err(TraceError::Load { .. })));
        assert_eq!(reports[1].program, "tcpclose");
        assert_eq!(reports[1].result, Ok(()));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "tcpclose");
        assert_eq!(records[0].2.get("pid").unwrap().to_string(), "99");
    }
}
