pub mod chat;
pub mod directory;
pub mod fanout;
pub mod history;

pub use chat::{ChatError, ChatOrchestrator, SendOutcome};
pub use fanout::{Channel, FanoutRegistry};
pub use history::{HistoryReader, ReplayError};
