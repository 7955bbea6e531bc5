use super::RecordSink;
use crate::tracer::schema::Record;
use anyhow::Context;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Streams records as JSON lines to a Unix socket.
pub(crate) struct SocketSink {
    snd: mpsc::Sender<String>,
}

impl SocketSink {
    pub async fn connect(path: &str, capacity: usize) -> Result<SocketSink, anyhow::Error> {
        let mut stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting to {}", path))?;
        let (snd, mut recv) = mpsc::channel::<String>(capacity.max(1));

        let socket_path = path.to_string();
        tokio::spawn(async move {
            while let Some(line) = recv.recv().await {
                if let Err(e) = stream.write_all(line.as_bytes()).await {
                    error!(target: "error", "Could not write to {}. Err: {}", socket_path, e);
                    break;
                }
            }
        });

        Ok(SocketSink { snd })
    }
}

impl RecordSink for SocketSink {
    fn emit(&self, program: &str, output: &str, record: &Record) {
        let line = json!({
            "program": program,
            "output": output,
            "time": record.received.to_rfc3339(),
            "record": record,
        });
        let mut line = line.to_string();
        line.push('\n');

        if let Err(e) = self.snd.try_send(line) {
            warn!(target: "error", "Dropping record from {}. Err: {}", output, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SocketSink;
    use crate::logs::RecordSink;
    use crate::tracer::schema::RecordSchema;
    use greggd_common::FieldSpec;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn writes_one_line_per_record() {
        let path = std::env::temp_dir().join(format!("greggd-sink-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let sink = SocketSink::connect(path.to_str().unwrap(), 8).await.unwrap();
        let (conn, _) = listener.accept().await.unwrap();

        let schema = RecordSchema::build(&[
            FieldSpec::new("pid", "u32"),
            FieldSpec::new("comm", "char[4]"),
        ])
        .unwrap();
        let record = schema.decode(&[7, 0, 0, 0, b'b', b'a', b's', b'h']).unwrap();
        sink.emit("tcplife", "ipv4_events", &record);

        let mut lines = BufReader::new(conn).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["program"], "tcplife");
        assert_eq!(value["output"], "ipv4_events");
        assert_eq!(value["record"]["pid"], 7);
        assert_eq!(value["record"]["comm"], "bash");

        let _ = std::fs::remove_file(&path);
    }
}
