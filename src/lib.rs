pub mod broadcast;
pub mod config;
pub mod db;
pub mod delivery;
pub mod dispatch;
pub mod model;
pub mod rate;
pub mod recipients;
pub mod report;
