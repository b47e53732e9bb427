mod models;

pub use models::{
    CreateSessionRequest, CreateSessionResponse, LoginFlow, LoginStatusResponse, PublicIdentity,
    SessionStatus,
};
