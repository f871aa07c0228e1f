//! OpenAI Assistants (v2) client for Quietline.
//!
//! Pure HTTP client over `reqwest`: threads, messages and runs. No knowledge of
//! the coordination layer.

mod client;
mod error;
mod types;

pub use client::{AssistantsClient, DEFAULT_BASE_URL, ThreadSeed};
pub use error::{LlmError, Result};
pub use types::{ContentBlock, Run, RunStatus, ThreadMessage, TranscriptEntry, latest_assistant_text};
