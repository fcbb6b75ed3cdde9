//! The post office.
//!
//! A host-wide exchange of fixed-size control messages between protection
//! domains. Each domain registers a mailbox; senders address peers by
//! domain id. A dead peer's mailbox is withdrawn and further sends fail
//! with COMM_FAILURE.

use crate::messages::{Message, MessageBuffer};
use dashmap::DashMap;
use orb_core::error::{CoreResult, SystemException};
use orb_io::ior::ProtDomainId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default mailbox depth.
pub const MAILBOX_CAPACITY: usize = 256;

/// Receiving end of a domain's mailbox.
pub struct Mailbox {
    domain: ProtDomainId,
    receiver: mpsc::Receiver<MessageBuffer>,
}

impl Mailbox {
    /// Receives and decodes the next control message; `None` when the
    /// mailbox is withdrawn.
    pub async fn recv(&mut self) -> Option<CoreResult<Message>> {
        let buf = self.receiver.recv().await?;
        match Message::decode(&buf) {
            Ok(message) => Some(Ok(message)),
            Err(e) => {
                warn!(domain = self.domain, "undecodable control message");
                Some(Err(e))
            }
        }
    }

    pub fn domain(&self) -> ProtDomainId {
        self.domain
    }
}

/// Host-wide control-message exchange.
#[derive(Default)]
pub struct PostOffice {
    mailboxes: DashMap<ProtDomainId, mpsc::Sender<MessageBuffer>>,
}

impl PostOffice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a domain and returns its mailbox. Re-registering a live
    /// domain replaces its mailbox.
    pub fn register(&self, domain: ProtDomainId) -> Mailbox {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        self.mailboxes.insert(domain, sender);
        debug!(domain, "domain registered with post office");
        Mailbox { domain, receiver }
    }

    /// Withdraws a dead domain's mailbox.
    pub fn unregister(&self, domain: ProtDomainId) {
        self.mailboxes.remove(&domain);
        debug!(domain, "domain unregistered from post office");
    }

    /// Whether a domain currently receives messages.
    pub fn is_registered(&self, domain: ProtDomainId) -> bool {
        self.mailboxes.contains_key(&domain)
    }

    /// Sends one control message to `to`.
    pub fn send(&self, to: ProtDomainId, message: &Message) -> CoreResult<()> {
        let sender = self
            .mailboxes
            .get(&to)
            .map(|entry| entry.clone())
            .ok_or_else(SystemException::comm_failure)?;
        sender
            .try_send(message.encode())
            .map_err(|_| SystemException::comm_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_and_receive() {
        let office = PostOffice::new();
        let mut mailbox = office.register(1);
        office
            .send(
                1,
                &Message::CancelRequest {
                    client_domain: 2,
                    request_id: 9,
                },
            )
            .unwrap();
        match mailbox.recv().await.unwrap().unwrap() {
            Message::CancelRequest {
                client_domain,
                request_id,
            } => {
                assert_eq!(client_domain, 2);
                assert_eq!(request_id, 9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_peer_fails_with_comm_failure() {
        let office = PostOffice::new();
        let err = office
            .send(42, &Message::Reply { giop_message: 1 })
            .expect_err("no such domain");
        assert_eq!(err.kind, orb_core::error::ExceptionKind::CommFailure);
    }

    #[tokio::test]
    async fn unregistered_peer_stops_receiving() {
        let office = PostOffice::new();
        let _mailbox = office.register(3);
        assert!(office.is_registered(3));
        office.unregister(3);
        assert!(!office.is_registered(3));
        assert!(office.send(3, &Message::Reply { giop_message: 1 }).is_err());
    }
}
