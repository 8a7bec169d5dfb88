//! Platform seams for the companion trust agent.
//!
//! The core library never talks to a keystore or the filesystem directly; it
//! goes through the traits in this crate. Mobile targets provide hardware
//! backed implementations (TEE/StrongBox, Secure Enclave), while the
//! `software` implementations here back tests and host prototyping.

pub mod keystore;
pub mod utils;
