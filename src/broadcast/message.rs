use serde::Serialize;

use crate::analysis::PacketRecord;

pub const PACKET_EVENT: &str = "packet_data";

/// Server-to-viewer envelope: `{"event": ..., "data": {...}}`.
#[derive(Debug, Serialize)]
pub struct ViewerEvent<'a> {
    event: &'static str,
    data: &'a PacketRecord,
}

impl<'a> ViewerEvent<'a> {
    pub fn packet(record: &'a PacketRecord) -> Self {
        Self { event: PACKET_EVENT, data: record }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
