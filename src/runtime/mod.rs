// src/runtime/mod.rs

//! Core asynchronous primitives: Commands, Mailboxes, the drain barrier.

pub mod command;
pub mod completion;
pub mod mailbox;
pub mod waitgroup;

pub use command::Command;
pub use completion::CloseCompletion;
pub use mailbox::{mailbox, MailboxReceiver, MailboxSender};
pub use waitgroup::WaitGroup;
