pub mod change_detector;
pub mod config;
pub mod engine;
pub mod error;
pub mod filters;
pub mod logging;
pub mod mime;
pub mod move_detector;
pub mod network_barrier;
pub mod path_util;
pub mod repo;
pub mod snapshot;
pub mod watch;
pub mod workspace;
