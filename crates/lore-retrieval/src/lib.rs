pub mod error;
pub mod hybrid;
pub mod recall;
pub mod types;

pub use error::RetrievalError;
pub use hybrid::{Retriever, RetrieverConfig};
pub use recall::{RecallRequest, RecallRunner};
pub use types::{LegHit, RetrievedContext};
