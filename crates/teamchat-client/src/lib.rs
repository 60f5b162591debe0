//! Client library for the proprietary team-chat protocol: HTTP login,
//! a persistent authenticated WebSocket, and a live entity cache of
//! People, Rooms, and Messages kept coherent with server push frames.

pub mod cache;
pub mod error;
pub mod events;
pub mod session;
pub mod socket;
pub mod wire;

pub use {
    cache::{EntityCache, Message, Person, Room},
    error::{ClientError, Result},
    events::{Event, FrameResolver},
    session::{Monitor, Session, is_mentioned},
    socket::{SessionState, SocketSession},
    wire::{ListFilter, UnseenCounts, WireClient},
};

pub use teamchat_protocol::{Credentials, Installation};
