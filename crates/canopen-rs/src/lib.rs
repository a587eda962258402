#![cfg_attr(not(feature = "std"), no_std)]

// 'alloc' is used for the dictionary, transfer buffers and timer pools.
extern crate alloc;

// --- Foundation Modules ---
pub mod frame;
pub mod hal;
pub mod types;

// --- Infrastructure ---
pub mod od;
pub mod tmr;

// --- Protocol Services ---
pub mod emcy;
pub mod nmt;
pub mod pdo;
pub mod sdo;
pub mod sync;

// --- Node Abstraction ---
pub mod node;

// --- Top-level Exports ---
pub use frame::CanFrame;
pub use hal::{CanDriver, CanopenError, NvmStorage};
pub use nmt::NmtState;
pub use node::{CanopenNode, NodeConfig};
pub use od::{ObjectDictionary, ObjectEntry, ObjectFlags, ObjectKey, ObjectValue};
pub use types::NodeId;
