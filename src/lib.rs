pub mod config;
pub mod error;
pub mod estimate;
pub mod guard;
pub mod identity;
pub mod lifecycle;
pub mod notify;
pub mod request;
pub mod resolver;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

pub use config::WorkflowConfig;
pub use error::{ValidationError, WorkflowError};
pub use service::{RequestView, WorkflowService};
