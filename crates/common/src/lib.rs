// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Shared vocabulary of the task distribution protocol: the task model and
//! its status machine, the JSON shapes exchanged between `taskd` and its
//! agents, and the host token scheme both sides must agree on.

pub mod task;
pub mod token;
pub mod wire;

pub use task::{
    Channel, LogKind, Outcome, ParseError, Task, TaskId, TaskKind, TaskLog, TaskStatus,
    TerminalStatus,
};
pub use token::{derive_token, verify, SecretRing, TOKEN_HEX_LEN};
pub use wire::{
    ConfirmAck, ConfirmRequest, DispatchedTask, NewTask, ObservationRequest, UserTaskView,
};
