mod commands;
mod intent;

pub use commands::CHAT_HELP_COMMANDS;
pub use intent::{parse_intent, CommandInvocation, QueryIntent};
