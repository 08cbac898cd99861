//! View models for the terminal front end

mod chat;
mod inbox;

pub use chat::{render_lines, ConversationView, SyncFault};
pub use inbox::render_inbox;
