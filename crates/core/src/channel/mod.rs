//! Progress/question channel: wire events, the session/job registry, the
//! pending-answer waiter table, and the hub that routes between them.

pub mod events;
pub mod hub;
pub mod registry;
pub mod waiters;

pub use events::{AnswerReceipt, BrowserCommand, ClientEvent, WorkerEvent};
pub use hub::ChannelHub;
pub use registry::SessionRegistry;
pub use waiters::AnswerWaiters;
