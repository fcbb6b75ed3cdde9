//! Shared-memory inter-domain transport for the ORB runtime.
//!
//! Protection domains on one host exchange fixed-size control messages
//! through the post office and bulk GIOP bytes through chained blocks
//! placed directly into the recipient's arena via per-peer helpers. A
//! compact immediate-reply path sends short replies with no shared-memory
//! allocation at all.

pub mod messages;
pub mod other_domain;
pub mod post_office;
pub mod shared_mem;
pub mod stream_sm;

pub use messages::{ImmediateData, Message, MessageBuffer, MessageType, SharedMemPtr};
pub use other_domain::{load_width, OtherDomain, OtherDomainLocal, PlatformSizes};
pub use post_office::{Mailbox, PostOffice};
pub use shared_mem::{DomainArena, HostMemory, ALLOCATION_UNIT};
pub use stream_sm::{
    ReplyBody, StreamInSm, StreamOutSm, StreamOutSmReply, VIRTUAL_COPY_THRESHOLD,
};
