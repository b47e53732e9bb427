pub mod clock;
pub mod identity;
pub mod login_machine;
pub mod scene_registry;
pub mod session_store;
pub mod sqlite_store;
pub mod token_issuer;
pub mod user_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{IdentityBackend, IdentityError, IdentityProvider};
pub use login_machine::{LoginFlowError, LoginSessionMachine, MachineSettings};
pub use scene_registry::SceneRegistry;
pub use session_store::{spawn_sweeper, CasOutcome, SessionBackend, SessionStore, StoreError};
pub use sqlite_store::SqliteStore;
pub use token_issuer::{Claims, SignedToken, SigningError, TokenError, TokenIssuer};
pub use user_store::{MemoryUserStore, UserBackend, UserStore};
