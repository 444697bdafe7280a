use std::env;
use std::sync::OnceLock;

static LAZYRS_EAGER: OnceLock<Option<bool>> = OnceLock::new();
static LAZYRS_COMPILE: OnceLock<Option<bool>> = OnceLock::new();
static LAZYRS_REGION_CACHE: OnceLock<Option<usize>> = OnceLock::new();
static LAZYRS_MAX_REGION_NODES: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn read_bool(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

fn read_usize(name: &str) -> Option<usize> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("ignoring {name}={value:?}: expected a non-negative integer");
            None
        }
    }
}

pub(crate) fn eager_override() -> Option<bool> {
    *LAZYRS_EAGER.get_or_init(|| read_bool("LAZYRS_EAGER"))
}

pub(crate) fn compile_override() -> Option<bool> {
    *LAZYRS_COMPILE.get_or_init(|| read_bool("LAZYRS_COMPILE"))
}

pub(crate) fn region_cache_override() -> Option<usize> {
    *LAZYRS_REGION_CACHE.get_or_init(|| read_usize("LAZYRS_REGION_CACHE"))
}

pub(crate) fn max_region_nodes_override() -> Option<usize> {
    *LAZYRS_MAX_REGION_NODES.get_or_init(|| read_usize("LAZYRS_MAX_REGION_NODES"))
}
