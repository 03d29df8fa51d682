pub mod handlers;
pub mod migration;
pub mod schedule;
pub mod students;
