//! # statesync-fanout
//!
//! Delivers every accepted [`ChangeRecord`](statesync_core::ChangeRecord) to
//! in-process subscribers, the companion [`EventBus`], and registered
//! [`NotificationChannel`]s. Each target fails on its own: a panicking
//! subscriber or a broken channel never blocks the others.

pub mod bus;
pub mod channel;
pub mod error;
pub mod fanout;
pub mod file_channel;
#[cfg(unix)]
pub mod socket_channel;

pub use bus::{BusEvent, BusFilter, EventBus, EventLevel};
pub use channel::{MemoryChannel, NotificationChannel};
pub use error::ChannelError;
pub use fanout::{ChangeFilter, Fanout, SubscriptionId};
pub use file_channel::FileChannel;
#[cfg(unix)]
pub use socket_channel::SocketChannel;
