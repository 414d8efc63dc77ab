pub mod activity;
pub mod app;
pub mod compensation;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod distribution;
pub mod gateway;
pub mod model;
pub mod remote;
pub mod retry;
pub mod sync;
