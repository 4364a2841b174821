//! Route modules for the blob store

pub mod blobs;
pub mod health;
pub mod stats;
pub mod uploads;
