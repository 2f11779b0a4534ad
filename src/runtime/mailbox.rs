// src/runtime/mailbox.rs

//! Type aliases for the session core's command channel, based on `async-channel`.

use crate::runtime::command::Command;

/// The sending end of the session core's mailbox. Cloneable.
pub type MailboxSender = async_channel::Sender<Command>;

/// The receiving end of the session core's mailbox.
pub type MailboxReceiver = async_channel::Receiver<Command>;

/// Creates a new bounded mailbox channel pair.
pub fn mailbox(capacity: usize) -> (MailboxSender, MailboxReceiver) {
  async_channel::bounded(capacity.max(1))
}
