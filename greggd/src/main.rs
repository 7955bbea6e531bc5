extern crate serde_derive;
extern crate serde_json;

mod config;
mod errors;
mod logs;
pub mod probes;
mod tracer;

use anyhow::anyhow;
use clap::Parser;
use logs::{GreggdLogs, LogSink, RecordSink, SocketSink};
use probes::kernel::AyaRuntime;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(version, about = "Loads eBPF tracing programs and streams their records")]
struct Args {
    /// Directory holding config.json5
    #[arg(long)]
    config_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = config::load_config(args.config_dir)?;

    let _logs = GreggdLogs::new(&config.logs)?;

    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {}", ret);
    }

    let sink: Arc<dyn RecordSink> = match config.socket_path {
        Some(ref path) => {
            Arc::new(SocketSink::connect(path, config.limits.batch_capacity).await?)
        }
        None => Arc::new(LogSink),
    };

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(target: "error", "Could not listen for Ctrl-C. Err: {}", e);
        }
        info!("Exiting...");
        ctrl_c.cancel();
    });

    info!("Tracing {} programs", config.programs.len());
    let total = config.programs.len();
    let ebpf_logs = config.ebpf_logs;
    let perf_pages = config.limits.perf_pages;
    let reports = tracer::trace_all(
        config.programs,
        || AyaRuntime::new(ebpf_logs, perf_pages),
        sink,
        &config.limits,
        &shutdown,
    )
    .await;

    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| r.result.is_err())
        .map(|r| r.program.as_str())
        .collect();
    if !failed.is_empty() || reports.len() < total {
        return Err(anyhow!("Programs failed: {}", failed.join(", ")));
    }

    Ok(())
}
