// SPDX-License-Identifier: GPL-3.0-only

//! Partition mutation planner and transaction engine
//!
//! Intents are turned into [`Plan`]s by the planner without touching the
//! device. A [`Disk`] commits a plan through a [`Transaction`], which checks
//! the live table first and writes through a staging [`Journal`] so a failed
//! write never leaves a mixture of old and new table behind.

pub mod disk;
pub mod error;
pub mod journal;
mod locks;
pub mod plan;
pub mod planner;
pub mod transaction;

pub use disk::Disk;
pub use error::{Error, Result};
pub use journal::{JOURNAL_FILE_LEN, Journal, StagedImage};
pub use plan::{Edit, Intent, Invariant, InvariantCheck, Plan, PlanWarning, check_layout};
pub use planner::{plan, plan_all};
pub use transaction::{Transaction, TransactionOutcome, TransactionState};
