//! Priority-queue admission control across a single resource dimension
//! (§3, §4.1).
//!
//! Each [`QuotaQueue`] tracks one countable resource — usually vCPUs for one
//! machine family — and admits [`crate::item::SchedItem`] waiters against a
//! limit, in priority order, FIFO or LIFO within a class per
//! [`crate::item::SchedItem::precedes`].

mod queue;

pub use queue::{QuotaHandle, QuotaQueue, QuotaStats};
