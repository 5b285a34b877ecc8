pub mod api;
pub mod catalog;
pub mod checkout;
pub mod config;
pub mod engine;
pub mod hold;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod payment;
pub mod reconcile;
pub mod slot;
pub mod sweeper;
pub mod wal;
