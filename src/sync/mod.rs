// ABOUTME: Clock synchronization module
// ABOUTME: Exposes the shared server-clock offset estimate

pub mod clock;

pub use clock::{local_now_micros, TimeProvider};
