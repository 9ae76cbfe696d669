//! Bounded queues for ISR-to-task handoff.

pub mod spsc;

pub use spsc::SpscQueue;
