// Small helpers shared by the background loops

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Interval whose first tick fires one full period from now
pub fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Leading segment of a site id, used to keep synthesized names short
pub fn short_site(site_id: &str) -> &str {
    site_id.split('-').next().unwrap_or(site_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_site() {
        assert_eq!(short_site("4f2ac1d0-91e3-4c1b"), "4f2ac1d0");
        assert_eq!(short_site("east"), "east");
        assert_eq!(short_site(""), "");
    }
}
