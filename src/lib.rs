pub mod auth;
pub mod backup;
pub mod config;
pub mod db;
pub mod model;
pub mod offline;
pub mod remote;
pub mod share;
pub mod split;
pub mod store;
pub mod sync;
