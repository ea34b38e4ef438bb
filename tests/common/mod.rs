//! Common test infrastructure
//!
//! Fakes for the chat transport, the transfer capabilities and the task
//! store, plus a scheduler harness wired to them. Tests should only import
//! from this module, not from internal submodules.

#![allow(dead_code)]

mod fakes;
mod harness;

pub use fakes::{
    FaultyStore, MemoryStorage, RecordingSink, Script, ScriptedFetcher, ScriptedTransport,
};
pub use harness::{
    destination, payload, wait_until, SchedulerHarness, ADMIN_ID, TEST_KIND, WAIT_TIMEOUT,
};
