pub mod errors;
pub mod events;
pub mod models;
pub mod providers;
pub mod query;
pub mod session;
pub mod summary;

pub use errors::LanternError;
pub use events::{EventPayload, EventWriter};
pub use query::{parse_intent, QueryIntent, CHAT_HELP_COMMANDS};
pub use session::{
    FileAnalysisResult, GeneratedImageResult, SearchSession, SessionState, SourceItem,
};
