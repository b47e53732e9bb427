mod requests;
mod session;
mod user;

pub use requests::*;
pub use session::{Identity, LoginSession, SessionHandle, SessionView};
pub use user::{UserRecord, UserRef};
