// Wire types shared between client and server
pub mod common;

// Client library (polls a login session until it resolves)
mod client;
mod error;

pub use client::{LoginClient, LoginGrant, Settings};
pub use common::{
    CreateSessionRequest, CreateSessionResponse, LoginFlow, LoginStatusResponse, PublicIdentity,
    SessionStatus,
};
pub use error::LoginError;

// Server modules (public for binary, internal for library)
#[cfg(feature = "server")]
pub mod server;
