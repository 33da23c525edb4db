//! Test support for `eventkeep` backends
//!
//! - [`contract`]: acceptance scenarios every backend must pass, wired into
//!   test binaries with [`event_store_contract_tests!`].
//! - [`chaos`]: a backend wrapper that fails primitives on demand.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(
    bad_style,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    rust_2018_idioms,
    unreachable_code,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_variables
)]

pub mod chaos;
pub mod contract;

pub use chaos::{ChaosBackend, ChaosBackendExt, ChaosConfig, ChaosSession, InjectedFault, Probability};
pub use contract::{ContractEvent, ContractTestFailure, ContractTestResult, CONTRACT_EVENT_TYPE};
