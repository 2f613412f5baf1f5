pub mod header_parser;
pub mod protocols;

pub use header_parser::{HeaderParser, PacketRecord, ParseOutcome, SkipReason};
pub use protocols::TransportProtocol;
