//! Price-computation support that doesn't belong to a single orderbook:
//! rolling volume normalization feeding the tâtonnement step preconditioner.

pub mod normalization;

pub use normalization::VolumeRelativizer;
