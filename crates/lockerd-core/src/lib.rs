//! Core runtime for `lockerd`.
//!
//! Contains the Modbus RTU framing and serialized bus transport, the
//! locker-id address mapper, the relay command pipeline, the ownership
//! state machine, zone validation and extension, the heartbeat manager,
//! the durable kiosk command queue, VIP contracts, the audit event logger,
//! and the versioned config store. This crate depends on `lockerd-store`
//! for persistence and knows nothing about HTTP.

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod heartbeat;
pub mod mapper;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod state;
pub mod vip;
pub mod zones;
