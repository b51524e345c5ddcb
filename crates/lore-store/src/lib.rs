pub mod crypto;
pub mod db;
pub mod documents;
pub mod error;
pub mod knowledge;
pub mod llms;
pub mod robots;
pub mod sessions;
pub mod types;
pub mod users;

pub use crypto::KeyCrypto;
pub use documents::DocumentStore;
pub use error::{Result, StoreError};
pub use knowledge::KnowledgeStore;
pub use llms::LlmStore;
pub use robots::RobotStore;
pub use sessions::SessionStore;
pub use users::UserStore;
