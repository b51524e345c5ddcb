pub mod context;
pub mod store;

pub use context::{ContextManager, ContextMessage, SessionContext};
pub use store::CacheStore;
