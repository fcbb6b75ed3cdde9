//! # ORB-RS
//!
//! Rust implementation of a microkernel-style, capability-oriented object
//! runtime. A process image ("protection domain") schedules cooperative
//! execution domains by deadline, dispatches requests through a Portable
//! Object Adapter tree, marshals GIOP/CDR on the wire, and exchanges
//! messages with sibling domains over a shared-memory transport.
//!
//! The workspace is organized as layered crates:
//!
//! - [`orb_core`] — scheduler, execution domains, sync contexts, waitable
//!   references, system exceptions, configuration
//! - [`orb_io`] — CDR streams, GIOP framing, TypeCodes, object keys, IORs
//! - [`orb_poa`] — POA tree, policies, managers, servant proxies, local
//!   references and requests
//! - [`orb_esiop`] — post office, shared-memory streams, peer helpers
//! - [`orb_runtime`] — binder, initial services, peer domains, remote
//!   references, GIOP request objects

pub use orb_core as core;
pub use orb_esiop as esiop;
pub use orb_io as io;
pub use orb_poa as poa;
pub use orb_runtime as runtime;
