//! Real-time SOS location tracking and alert monitoring.
//!
//! A [`tracker::Tracker`] keeps one alert document per subject fresh in the
//! shared [`store::AlertStore`]; a [`monitor::Monitor`] mirrors the set of
//! active alerts from the store's live query. The two roles share nothing
//! but the store.

pub mod config;
pub mod db;
pub mod identity;
pub mod kafka;
pub mod location;
pub mod models;
pub mod monitor;
pub mod processor;
pub mod store;
pub mod tracker;
