//! A Stratum mining pool.
//!
//! The pool turns block templates from a coin daemon into jobs, hands them
//! to miners over Stratum v1, validates the shares that come back and
//! submits blocks when a share meets the network target.

pub mod ban;
pub mod coin;
pub mod config;
pub mod error;
pub mod job;
pub mod job_manager;
pub mod pool;
pub mod rpc;
pub mod share;
pub mod stats;
pub mod stratum;
pub mod tracing;
pub mod types;
pub mod u256;
pub mod validator;
pub mod vardiff;
pub mod worker;
