pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod policy;
pub mod repository;
pub mod stage;
pub mod timeline;
