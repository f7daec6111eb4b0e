//! Client bound to one remote subject

use std::time::Duration;

use beacon_api::{RawMessage, Rejection};
use tokio::task::JoinHandle;

use crate::protocol::MessagingProtocol;

#[derive(Clone)]
pub struct Requestor {
    protocol: MessagingProtocol,
    subject: String,
}

impl Requestor {
    pub(crate) fn new(protocol: MessagingProtocol, subject: &str) -> Self {
        Self {
            protocol,
            subject: subject.to_string(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn request(
        &self,
        method: &str,
        data: RawMessage,
    ) -> std::result::Result<RawMessage, Rejection> {
        self.protocol.request(&self.subject, method, data).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        data: RawMessage,
        timeout: Duration,
    ) -> std::result::Result<RawMessage, Rejection> {
        self.protocol
            .request_with_timeout(&self.subject, method, data, timeout)
            .await
    }

    pub fn request_with<A, R>(
        &self,
        method: &str,
        data: RawMessage,
        on_accept: A,
        on_reject: R,
    ) -> JoinHandle<()>
    where
        A: FnOnce(RawMessage) + Send + 'static,
        R: FnOnce(i32, String) + Send + 'static,
    {
        self.protocol
            .request_with(&self.subject, method, data, on_accept, on_reject)
    }
}
