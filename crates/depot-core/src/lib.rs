pub mod config;
pub mod content;
pub mod control;
pub mod logging;
pub mod tasking;
