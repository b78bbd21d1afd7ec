pub mod actors;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod incident;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod prober;
pub mod storage;
pub mod util;
