pub mod booking;
pub mod db;
pub mod execution;
pub mod payloads;
pub mod rule;
