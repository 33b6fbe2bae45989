// ABOUTME: Counter helpers over the `metrics` facade for bus, router, and scheduler events.
// ABOUTME: No recorder is installed here; an embedding process may install one to export them.

use crate::event::Direction;
use ::metrics::counter;

pub fn record_published(direction: Direction) {
    counter!("spool_bus_published_total", "direction" => direction.as_str()).increment(1);
}

pub fn record_duplicate(direction: Direction) {
    counter!("spool_bus_duplicates_total", "direction" => direction.as_str()).increment(1);
}

/// A publish dead-lettered on arrival by flow control
pub fn record_rejected(direction: Direction, reason: &'static str) {
    counter!(
        "spool_bus_rejected_total",
        "direction" => direction.as_str(),
        "reason" => reason
    )
    .increment(1);
}

pub fn record_deferred(direction: Direction) {
    counter!("spool_bus_deferred_total", "direction" => direction.as_str()).increment(1);
}

pub fn record_processed(direction: Direction) {
    counter!("spool_bus_processed_total", "direction" => direction.as_str()).increment(1);
}

pub fn record_retried(direction: Direction) {
    counter!("spool_bus_retried_total", "direction" => direction.as_str()).increment(1);
}

pub fn record_dead_lettered(direction: Direction) {
    counter!("spool_bus_dead_lettered_total", "direction" => direction.as_str()).increment(1);
}

pub fn record_stale_recovered(count: usize) {
    counter!("spool_bus_stale_recovered_total").increment(count as u64);
}

pub fn record_replayed(count: usize) {
    counter!("spool_bus_replayed_total").increment(count as u64);
}

pub fn record_ledger_cache_hit() {
    counter!("spool_ledger_cache_hits_total").increment(1);
}

pub fn record_schedule_dispatched() {
    counter!("spool_scheduler_dispatched_total").increment(1);
}
