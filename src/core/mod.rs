pub mod error;
pub mod message;
pub mod record;
pub mod resolver;
pub mod shutdown;
