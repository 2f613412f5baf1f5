pub mod subscriber_session;

pub use subscriber_session::{CloseReason, SessionError, SessionState, SessionSummary, SubscriberSession};
