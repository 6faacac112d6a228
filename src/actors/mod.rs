//! Actor-based sampling pipeline
//!
//! Each actor runs as an independent async task communicating via Tokio channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │   SamplerActor   │ owns settings + ticker
//!                 └────────┬─────────┘
//!                          │ publish
//!                 ┌────────▼─────────┐
//!                 │     EventBus     │ one queue per subscriber
//!                 └────────┬─────────┘
//!                          │ Topic::Kind(..)
//!              ┌───────────┴───────────┐
//!              │                       │
//!      ┌───────▼───────┐       ┌───────▼───────┐
//!      │ StorageActor  │       │   LiveActor   │◄── settings (watch)
//!      └───────┬───────┘       └───────┬───────┘
//!              │                       │
//!       TelemetryStore             LiveSink(s)
//! ```
//!
//! ## Actor Types
//!
//! - **SamplerActor**: Samples every enabled source on a fixed cadence
//! - **StorageActor**: Batches samples into the storage backend
//! - **LiveActor**: Keeps the windowed history and relays to live sinks
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Events**: Samples fan out through the [`bus::EventBus`]
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod bus;
pub mod live;
pub mod messages;
pub mod sampler;
pub mod storage;
