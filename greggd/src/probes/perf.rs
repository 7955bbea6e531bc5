use super::{PerfTable, RingReader};
use anyhow::anyhow;
use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer};
use aya::maps::MapData;
use aya::util::online_cpus;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const READ_BATCH: usize = 64;
const RECORD_CAPACITY: usize = 256;

pub(crate) struct AyaPerfTable {
    id: String,
    array: AsyncPerfEventArray<MapData>,
    pages: usize,
}

impl AyaPerfTable {
    pub fn new(id: &str, array: AsyncPerfEventArray<MapData>, pages: usize) -> AyaPerfTable {
        AyaPerfTable {
            id: id.to_string(),
            array,
            pages,
        }
    }
}

impl PerfTable for AyaPerfTable {
    fn init_reader(
        self: Box<Self>,
        batches: mpsc::Sender<Vec<u8>>,
    ) -> Result<Box<dyn RingReader>, anyhow::Error> {
        let table = *self;
        Ok(Box::new(AyaPerfReader {
            id: table.id,
            array: table.array,
            pages: table.pages,
            batches: Some(batches),
            pump: None,
        }))
    }
}

/// One pump task per online CPU, all feeding the same batch channel.
pub(crate) struct AyaPerfReader {
    id: String,
    array: AsyncPerfEventArray<MapData>,
    pages: usize,
    batches: Option<mpsc::Sender<Vec<u8>>>,
    pump: Option<CancellationToken>,
}

impl RingReader for AyaPerfReader {
    fn start(&mut self) -> Result<(), anyhow::Error> {
        if self.pump.is_some() {
            return Ok(());
        }
        let batches = self
            .batches
            .take()
            .ok_or_else(|| anyhow!("reader for {} was stopped", self.id))?;

        let stop = CancellationToken::new();
        self.pump = Some(stop.clone());

        for cpu_id in online_cpus()? {
            let buf = self.array.open(cpu_id, Some(self.pages))?;
            tokio::spawn(pump(
                self.id.clone(),
                cpu_id,
                buf,
                batches.clone(),
                stop.clone(),
            ));
        }
        debug!("Started perf reader for {}", self.id);
        Ok(())
    }

    fn stop(&mut self) {
        self.batches = None;
        if let Some(stop) = self.pump.take() {
            stop.cancel();
            debug!("Stopped perf reader for {}", self.id);
        }
    }
}

impl Drop for AyaPerfReader {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump(
    table: String,
    cpu_id: u32,
    mut perf_buf: AsyncPerfEventArrayBuffer<MapData>,
    batches: mpsc::Sender<Vec<u8>>,
    stop: CancellationToken,
) {
    let mut buffers = vec![BytesMut::with_capacity(RECORD_CAPACITY); READ_BATCH];

    loop {
        let events = tokio::select! {
            _ = stop.cancelled() => break,
            events = perf_buf.read_events(&mut buffers) => events,
        };

        let events = match events {
            Ok(events) => events,
            Err(e) => {
                error!(target: "error", "Could not read {} on CPU {}. Err: {}", table, cpu_id, e);
                break;
            }
        };
        if events.lost > 0 {
            warn!(target: "error", "Events lost in {} on CPU {}: {}", table, cpu_id, events.lost);
        }

        for record in buffers.iter().take(events.read) {
            if batches.send(record.to_vec()).await.is_err() {
                return;
            }
        }
    }
}
