mod config;
pub mod login_client;

pub use config::Settings;
pub use login_client::{LoginClient, LoginGrant};
