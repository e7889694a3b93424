pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod quorum;
pub mod reconcile;
pub mod service;
