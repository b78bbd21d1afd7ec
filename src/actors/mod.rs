//! Long-running actors of the daemon
//!
//! Each actor runs as an independent async task and is controlled through a
//! cloneable handle wrapping its mpsc command channel.
//!
//! ```text
//!              ┌──────────────────┐
//!              │  watch (daemon)  │
//!              └────────┬─────────┘
//!                       │ spawns
//!          ┌────────────┴─────────────┐
//!          │                          │
//!  ┌───────▼────────┐        ┌────────▼────────┐
//!  │ SchedulerActor │        │ RetentionActor  │
//!  └───────┬────────┘        └────────┬────────┘
//!          │ check_now (bounded)      │ delete_*_before
//!  ┌───────▼────────┐        ┌────────▼────────┐
//!  │     Engine     │───────►│     Stores      │
//!  └────────────────┘        └─────────────────┘
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Request/Response**: oneshot channels for synchronous queries
//! 3. **Shutdown**: a shared `CancellationToken` stops every actor

pub mod messages;
pub mod retention;
pub mod scheduler;

pub use messages::{RetentionReport, TickReport};
pub use retention::RetentionHandle;
pub use scheduler::SchedulerHandle;
