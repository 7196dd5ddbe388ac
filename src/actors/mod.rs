//! Actor-based probe scheduling
//!
//! The scheduler runs as an independent async task controlled through a
//! cloneable handle over an mpsc command channel.
//!
//! ## Architecture Overview
//!
//! ```text
//!          ┌──────────────────┐   TargetChange    ┌──────────────────┐
//!          │  TargetRegistry  │ ────────────────▶ │  SchedulerActor  │ ◀── SchedulerCommand
//!          └──────────────────┘    (broadcast)    └────────┬─────────┘     (TickNow, GetMetrics,
//!                                                          │ spawns         Shutdown)
//!                                   ┌──────────────────────┼──────────────────────┐
//!                                   │                      │                      │
//!                           ┌───────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!                           │ probe task 1 │       │ probe task 2 │  ...  │ probe task N │
//!                           └───────┬──────┘       └───────┬──────┘       └───────┬──────┘
//!                                   └──────────────────────┼──────────────────────┘
//!                                                          ▼
//!                                              MonitoringOrchestrator
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: the scheduler has an mpsc command channel for control messages
//! 2. **Events**: registry changes arrive on a broadcast channel
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod messages;
pub mod scheduler;

pub use messages::{SchedulerCommand, SchedulerMetrics, TickReport};
pub use scheduler::{SchedulerActor, SchedulerHandle};
