use std::time::Duration;

/// Returns an interval that fires on the given period, skipping missed
/// ticks instead of bursting to catch up. Set `yield_immediately` for
/// tickers that should do a first pass on startup.
pub fn make_periodic_tick(period: Duration, yield_immediately: bool) -> tokio::time::Interval {
	let mut interval = tokio::time::interval_at(
		tokio::time::Instant::now() +
			if yield_immediately { Duration::ZERO } else { period },
		period,
	);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	interval
}
