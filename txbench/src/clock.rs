//! Benchmark time: monotonic microseconds since a process-wide base instant.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Microseconds since [`base`]. Differences of two readings are durations.
pub type Micros = i64;

pub const MICROS_PER_SEC: Micros = 1_000_000;

struct Base {
    instant: Instant,
    /// Wall-clock time of `instant`, in microseconds since the Unix epoch
    unix: Micros,
}

static BASE: OnceLock<Base> = OnceLock::new();

fn base() -> &'static Base {
    BASE.get_or_init(|| Base {
        instant: Instant::now(),
        unix: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as Micros),
    })
}

pub fn now() -> Micros {
    base().instant.elapsed().as_micros() as Micros
}

/// Reads the clock only if `t` has not been set since it was last cleared.
pub fn now_lazy(t: &mut Option<Micros>) -> Micros {
    *t.get_or_insert_with(now)
}

/// Offset from benchmark time to Unix time.
pub fn epoch_shift() -> Micros {
    base().unix
}

pub fn to_unix(t: Micros) -> Micros {
    t + epoch_shift()
}

pub fn as_secs_f64(t: Micros) -> f64 {
    t as f64 / MICROS_PER_SEC as f64
}
