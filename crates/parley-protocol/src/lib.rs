//! Wire vocabulary and transcript types for Parley agent conversations.
//!
//! This crate defines the formats shared by every boundary in a Parley
//! deployment:
//!
//! ```text
//! Browser client <--[text/event-stream + JSON commands]--> Gateway <--[same stream]--> Upstream agent
//! ```
//!
//! The gateway is a transparent pipe for the stream; the client folds the
//! decoded events into a transcript.
//!
//! ## Design Principles
//!
//! 1. **Messages are persistent, events are ephemeral.** Messages are replayed
//!    from history. Events drive the transcript but are never stored as-is.
//! 2. **The event vocabulary is closed.** Anything outside it is dropped by the
//!    parser rather than surfaced as an error.
//! 3. **Chunk boundaries never influence decoding.** Framing is left to
//!    `eventsource-stream`; only complete frames are decoded.

pub mod commands;
pub mod events;
pub mod messages;
pub mod sse;

pub use commands::{
    Attachment, CommandAck, HistoryResponse, InterruptRequest, RetryRequest, SendMessageRequest,
    SubjectSessionResponse,
};
pub use events::{ApprovalRequest, PipelineProgress, ProgressStatus, StreamEvent, encode_frame};
pub use messages::{ArtifactRef, Message, MessageAttachment, Role, ToolCall};
pub use sse::{HEARTBEAT_FRAME, HEARTBEAT_LINE, decode_events, decode_frame};
