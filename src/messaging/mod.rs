//! In-app chat (client side).
//!
//! ```text
//!   hub pushes ──► MessagingService ──broadcast──► ConversationState (badge, list)
//!                                               └─► ChatTimeline (open screen)
//! ```
//!
//! Hub pushes and REST responses overlap; every consumer de-duplicates by
//! message id.

// Rust guideline compliant 2026-02

pub mod service;
pub mod state;
pub mod timeline;

pub use service::{MessagingService, MessagingState};
pub use state::{ConversationState, ConversationSummary};
pub use timeline::ChatTimeline;
