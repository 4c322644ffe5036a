//! helmet-watch: per-camera no-helmet alerting.
//!
//! Each source runs a blocking read → detect → throttle loop; admitted alerts
//! are captured as JPEG evidence, emailed and appended to the ledger by a
//! shared background dispatcher.

pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod evidence;
pub mod frame;
pub mod ledger;
pub mod location;
pub mod logging;
pub mod monitor;
pub mod notify;
pub mod runner;
pub mod source;
pub mod throttle;
