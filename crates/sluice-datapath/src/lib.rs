//! # SLUICE Datapath
//!
//! Packet classification and delivery on top of the `sluice-core` rings.
//!
//! This crate provides:
//! - Interface driver contract and an in-process software interface
//! - Ordered rule programs with first-match-wins classification
//! - RX queue pipeline with lock-free program swaps and redirect batching
//! - TX queue pipeline with in-order and out-of-order completion
//! - Zero-copy sockets (XSK) with UMEM, four shared rings and TX bounce
//!   buffers
//! - Per-interface serialized control work queues
//!
//! ```no_run
//! use sluice_datapath::{DatapathConfig, Privilege, Program, ProgramFlags, Rule, RuleAction, RuleMatch};
//! use sluice_datapath::interface::HookId;
//! use sluice_datapath::soft::{SoftInterface, SoftInterfaceConfig};
//! use sluice_datapath::state::State;
//!
//! # fn main() -> sluice_datapath::Result<()> {
//! let state = State::new(DatapathConfig::default())?;
//! let soft = SoftInterface::new(SoftInterfaceConfig::default());
//! state.register_interface(soft.clone())?;
//!
//! let _program = Program::create(
//!     &state,
//!     1,
//!     HookId::RX_INSPECT,
//!     0,
//!     ProgramFlags::empty(),
//!     vec![Rule::new(RuleMatch::UdpDst(53), RuleAction::Drop)],
//!     Privilege::User,
//! )?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Configuration and errors
pub mod config;
pub mod error;
pub mod stats;

// Driver contract
pub mod interface;
pub mod soft;

// Classification
pub mod packet;
pub mod program;
mod redirect;

// Queues and sockets
pub mod rx;
pub mod state;
pub mod tx;
pub mod xsk;

// Control plumbing
mod sync;
pub mod workqueue;

pub use config::DatapathConfig;
pub use error::{DatapathError, Result};
pub use program::{
    Privilege, Program, ProgramFlags, ProgramHandle, RedirectTarget, Rule, RuleAction, RuleMatch,
};
pub use redirect::REDIRECT_BATCH_CAPACITY;
pub use rx::{RxQueue, RxQueueNotification};
pub use state::{InterfaceBinding, State};
pub use tx::TxQueue;
pub use xsk::{
    NotifyResult, UmemReg, Xsk, XskBindFlags, XskBufferAddress, XskBufferDescriptor,
    XskError, XskNotifyFlags, XskRingKind, XskState,
};
