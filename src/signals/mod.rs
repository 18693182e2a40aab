//! Signal channel: a directory mailbox external actors write JSON files into.
//!
//! Each file is consumed exactly once per arrival and translated into a pool
//! or phase action. Actions are idempotent, so a message that arrives for an
//! item already in the target state does nothing.

pub mod dispatch;
pub mod mailbox;
pub mod types;

pub use dispatch::{SignalEffects, dispatch};
pub use mailbox::{Mailbox, read_signal};
pub use types::{SignalAction, SignalMessage};
