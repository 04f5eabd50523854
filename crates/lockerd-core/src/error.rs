//! Error types for `lockerd-core`.
//!
//! One enum per subsystem; each variant carries enough context to diagnose
//! the problem from a log line. Card identifiers never appear here, only
//! their salted hashes.

use lockerd_store::StoreError;

/// Errors from Modbus RTU frame encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The request itself is malformed (bad slave, empty bit list, ...).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The reply is shorter than the smallest valid frame.
    #[error("reply too short: {actual} bytes")]
    TooShort { actual: usize },

    /// The reply CRC does not match its payload.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// The reply came from a different slave than addressed.
    #[error("slave mismatch: expected {expected}, got {actual}")]
    SlaveMismatch { expected: u8, actual: u8 },

    /// The reply carries an unexpected function code.
    #[error("function mismatch: expected {expected:#04x}, got {actual:#04x}")]
    FunctionMismatch { expected: u8, actual: u8 },

    /// The slave answered with a Modbus exception.
    #[error("modbus exception {code} for function {function:#04x}")]
    Exception { function: u8, code: u8 },

    /// The reply does not echo the request as the function requires.
    #[error("reply does not match request: {reason}")]
    EchoMismatch { reason: String },
}

/// Errors from the serial bus transport.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No (complete) reply within the deadline.
    #[error("bus timeout")]
    Timeout,

    /// The serial port failed.
    #[error("bus I/O error: {reason}")]
    Io { reason: String },

    /// Framing or protocol error in the reply.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The bus worker is gone (shutdown).
    #[error("bus worker unavailable")]
    WorkerGone,
}

/// Errors from locker-id to (slave, coil) mapping.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// No zone covers the locker and the legacy fallback cannot either.
    #[error("unknown locker {locker_id}")]
    UnknownLocker { locker_id: i64 },

    /// The zone table is inconsistent with the relay card list.
    #[error("hardware config error for locker {locker_id}: {reason}")]
    HardwareConfig { locker_id: i64, reason: String },
}

/// Errors from the relay command pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Address resolution failed.
    #[error(transparent)]
    Map(#[from] MapError),

    /// The slave is quarantined after repeated failures.
    #[error("slave {slave} is quarantined")]
    Quarantined { slave: u8 },

    /// The transport kept failing after all retries.
    #[error("hardware error on slave {slave}: {source}")]
    Hardware {
        slave: u8,
        #[source]
        source: BusError,
    },

    /// A burst ran out of time without a single successful pulse.
    #[error("burst exhausted for locker {locker_id} after {attempts} pulses")]
    BurstExhausted { locker_id: i64, attempts: u32 },
}

/// Errors from zone validation and extension.
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    /// A zone's range list is malformed.
    #[error("bad range in zone '{zone}': {reason}")]
    BadRange { zone: String, reason: String },

    /// A relay card address is outside 1–247.
    #[error("bad slave address {slave} in zone '{zone}'")]
    BadSlave { zone: String, slave: u8 },

    /// Two enabled zones cover the same locker id.
    #[error("zones '{a}' and '{b}' overlap")]
    Overlap { a: String, b: String },

    /// Two enabled zones share a relay card.
    #[error("zones '{a}' and '{b}' both use slave {slave}")]
    DuplicateSlave { a: String, b: String, slave: u8 },

    /// Covered lockers do not equal 16 × relay cards.
    #[error("zone '{zone}' covers {lockers} lockers but has {cards} relay cards")]
    CapacityMismatch { zone: String, lockers: i64, cards: usize },

    /// Extension needs more relay cards than the free pool offers.
    #[error("zone '{zone}' needs {needed} more relay cards, {available} available")]
    CapacityExceeded {
        zone: String,
        needed: usize,
        available: usize,
    },

    /// The referenced zone does not exist or is disabled.
    #[error("unknown zone '{zone}'")]
    UnknownZone { zone: String },
}

/// Errors from the versioned config store.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document failed validation.
    #[error("invalid config: {reason}")]
    Invalid { reason: String },

    /// Zone validation or extension rejected the document.
    #[error(transparent)]
    Zones(#[from] ZoneError),

    /// The requested version does not exist.
    #[error("config version {version} not found")]
    VersionNotFound { version: i64 },

    /// Rollback requested but there is no earlier version.
    #[error("no previous config version to roll back to")]
    NoPreviousVersion,

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the locker ownership state machine.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The locker row does not exist.
    #[error("locker {locker_id} on kiosk '{kiosk_id}' not found")]
    NotFound { kiosk_id: String, locker_id: i64 },

    /// The locker is held by someone else or otherwise not assignable.
    #[error("locker {locker_id} on kiosk '{kiosk_id}' is busy")]
    Busy { kiosk_id: String, locker_id: i64 },

    /// The locker is administratively blocked.
    #[error("locker {locker_id} on kiosk '{kiosk_id}' is blocked")]
    Blocked { kiosk_id: String, locker_id: i64 },

    /// The operation would touch a VIP locker without `force_vip`.
    #[error("locker {locker_id} on kiosk '{kiosk_id}' is VIP protected")]
    VipProtected { kiosk_id: String, locker_id: i64 },

    /// Confirm was called on a locker that is not reserved by this owner.
    #[error("locker {locker_id} on kiosk '{kiosk_id}' is not reserved by this owner")]
    NotReserved { kiosk_id: String, locker_id: i64 },

    /// The owner already holds a different locker.
    #[error("owner already holds locker {locker_id} on kiosk '{kiosk_id}'")]
    OwnerHoldsAnother { kiosk_id: String, locker_id: i64 },

    /// Optimistic concurrency kept losing after retries.
    #[error("concurrent update conflict, retries exhausted")]
    Conflict,

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the kiosk command queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The command does not exist.
    #[error("command '{command_id}' not found")]
    NotFound { command_id: String },

    /// Complete was called on a command that is not in flight.
    #[error("command '{command_id}' is not in flight")]
    NotInFlight { command_id: String },

    /// Cancel was called on a command that is not pending.
    #[error("command '{command_id}' is not pending")]
    NotPending { command_id: String },

    /// The stored payload could not be decoded.
    #[error("bad command payload: {reason}")]
    BadPayload { reason: String },

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the heartbeat manager.
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the audit event logger.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from VIP contract operations.
#[derive(Debug, thiserror::Error)]
pub enum VipError {
    /// The contract does not exist.
    #[error("VIP contract '{contract_id}' not found")]
    ContractNotFound { contract_id: String },

    /// The contract is not active.
    #[error("VIP contract '{contract_id}' is not active")]
    NotActive { contract_id: String },

    /// The locker already has an active contract.
    #[error("locker {locker_id} on kiosk '{kiosk_id}' already has an active VIP contract")]
    LockerContracted { kiosk_id: String, locker_id: i64 },

    /// The card already has an active contract.
    #[error("card already has an active VIP contract")]
    CardContracted,

    /// No transfer is pending on the contract.
    #[error("VIP contract '{contract_id}' has no pending transfer")]
    NoTransferPending { contract_id: String },

    /// The locker state machine rejected the bind/unbind.
    #[error(transparent)]
    State(#[from] StateError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the end-of-day report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// CSV serialization failed.
    #[error("csv error: {reason}")]
    Csv { reason: String },

    /// The state machine failed while walking lockers.
    #[error(transparent)]
    State(#[from] StateError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
