//! Runtime services for the ORB.
//!
//! This crate assembles a protection domain out of the lower layers: the
//! binder with its module and object maps, the initial-service table, peer
//! domains with DGC heartbeat batching, remote references, the GIOP
//! request objects on both sides of the wire, and the incoming-request map
//! with cancel tombstones.

pub mod binder;
pub mod domain;
pub mod incoming;
pub mod module;
pub mod reference_remote;
pub mod remote_refs;
pub mod request_giop;
pub mod request_in;
pub mod services;
pub mod system;
pub mod transport;

pub use binder::Binder;
pub use domain::Domain;
pub use incoming::IncomingRequests;
pub use module::{BindingName, Module, ModuleExports, ModuleProvider, Version};
pub use reference_remote::{ReferenceRemote, RemoteHandle};
pub use remote_refs::RemoteReferences;
pub use request_giop::{CodecEnv, RequestGiop};
pub use request_in::RequestInEsiop;
pub use services::{ServiceHost, ServiceId, Services};
pub use system::OrbSystem;
pub use transport::{EsiopTransport, ReplyData};
