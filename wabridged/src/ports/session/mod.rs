pub mod auth_repo;
pub mod key_repo;

pub use auth_repo::{AuthState, AuthStateRepository};
pub use key_repo::SessionKeyRepository;
