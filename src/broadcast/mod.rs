pub mod hub;
pub mod message;

pub use hub::{BroadcastHub, HubStats, Outbound, PublishOutcome, Subscriber, SubscriberId};
pub use message::{ViewerEvent, PACKET_EVENT};
