pub mod store;
pub mod syncer;
