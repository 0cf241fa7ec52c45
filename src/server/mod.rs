// The two listeners: the mutually-authenticated talk server and the
// plaintext pairing receiver.

pub mod cert;
pub mod talk;

pub use cert::{CertServer, FriendRequest};
pub use talk::{Message, TalkError, TalkServer};
