pub mod assign;
pub mod audit;
pub mod auth;
pub mod conflict;
pub mod directory;
pub mod http;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod rate_limit;
pub mod series;
pub mod store;
pub mod wal;
