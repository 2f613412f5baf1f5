use serde::Serialize;
use std::fmt;

/// Transport protocol as reported to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Other,
}

const IPPROTO_TCP: usize = 6;
const IPPROTO_UDP: usize = 17;

static PROTOCOL_TABLE: [TransportProtocol; 256] = build_protocol_table();

const fn build_protocol_table() -> [TransportProtocol; 256] {
    let mut table = [TransportProtocol::Other; 256];
    table[IPPROTO_TCP] = TransportProtocol::Tcp;
    table[IPPROTO_UDP] = TransportProtocol::Udp;
    table
}

impl TransportProtocol {
    /// Maps an IP protocol / next-header number. Total over `u8`.
    pub fn from_ip_number(number: u8) -> Self {
        PROTOCOL_TABLE[number as usize]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Other => "OTHER",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
