//! Push-notification transport contract.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{SyncError, SyncResult};
use crate::record::RecordId;
use crate::scope::{ResourceKind, ScopeKey};

/// Opaque id of an open channel, issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

impl fmt::Display for ChannelHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
  Insert,
  Update,
  Delete,
}

/// A server-side change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
  pub operation: ChangeOp,
  pub resource: ResourceKind,
  pub owner: String,
  pub record_id: Option<RecordId>,
}

impl ChangeEvent {
  /// Whether the event concerns the collection a scope mirrors.
  pub fn matches(&self, scope: &ScopeKey) -> bool {
    scope.same_collection(self.resource, &self.owner)
  }
}

/// Connection status callbacks from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
  Subscribed,
  /// Connection dropped; the transport is retrying.
  Reconnecting,
  Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
  Change(ChangeEvent),
  Status(ChannelStatus),
}

/// An open channel and the messages it delivers until unsubscribed.
pub struct Channel {
  pub handle: ChannelHandle,
  pub messages: mpsc::UnboundedReceiver<PushMessage>,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
  /// Open a channel delivering changes to `resource` rows of `owner`.
  async fn subscribe(&self, resource: ResourceKind, owner: &str) -> SyncResult<Channel>;

  /// Close a channel. Takes effect immediately; no further messages are
  /// delivered on it.
  fn unsubscribe(&self, handle: ChannelHandle);
}

/// Transport for backends without push support. Every subscribe fails,
/// which puts scopes on the polling fallback.
pub struct PollingOnly;

#[async_trait]
impl PushTransport for PollingOnly {
  async fn subscribe(&self, resource: ResourceKind, _owner: &str) -> SyncResult<Channel> {
    Err(SyncError::Subscription(format!(
      "no push transport configured for {}",
      resource
    )))
  }

  fn unsubscribe(&self, _handle: ChannelHandle) {}
}
