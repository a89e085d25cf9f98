pub mod mock;
pub mod observability;
pub mod registry;
