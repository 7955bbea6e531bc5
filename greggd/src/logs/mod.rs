mod logs;
pub(crate) mod records;
mod socket;

pub(crate) use logs::GreggdLogs;
pub(crate) use records::{LogSink, RecordSink};
pub(crate) use socket::SocketSink;
