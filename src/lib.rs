pub mod api;
pub mod cluster;
pub mod config;
pub mod exec;
pub mod lifecycle;
pub mod portforward;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod terminal;
