use std::cell::Cell;
use std::time::Duration;

thread_local! {
    static COMPILE_TIME_NS: Cell<u64> = const { Cell::new(0) };
    static REGIONS_COMPILED: Cell<u64> = const { Cell::new(0) };
}

/// Region compilation work accumulated on the current thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileTiming {
    pub total: Duration,
    pub regions: u64,
}

pub fn record_compile(duration: Duration) {
    let nanos = duration.as_nanos().min(u128::from(u64::MAX)) as u64;
    COMPILE_TIME_NS.with(|cell| cell.set(cell.get().saturating_add(nanos)));
    REGIONS_COMPILED.with(|cell| cell.set(cell.get() + 1));
}

/// Returns and clears the current thread's totals.
pub fn take_compile_timing() -> CompileTiming {
    let nanos = COMPILE_TIME_NS.with(|cell| cell.replace(0));
    let regions = REGIONS_COMPILED.with(|cell| cell.replace(0));
    CompileTiming {
        total: Duration::from_nanos(nanos),
        regions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_resets_totals() {
        let _ = take_compile_timing();
        record_compile(Duration::from_millis(2));
        record_compile(Duration::from_millis(3));
        let timing = take_compile_timing();
        assert_eq!(timing.regions, 2);
        assert_eq!(timing.total, Duration::from_millis(5));
        assert_eq!(take_compile_timing(), CompileTiming::default());
    }
}
