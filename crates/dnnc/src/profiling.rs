//! Scope timers for graph compilation, kernel execution and compile caches.
//!
//! With the `profiler` feature disabled every scope is a zero-sized guard and
//! every report is `None`.

#[cfg(feature = "profiler")]
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};
#[cfg(feature = "profiler")]
use std::time::Duration;
#[cfg(feature = "profiler")]
use std::time::Instant;

#[cfg(feature = "profiler")]
use serde::Serialize;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ProfilerKey {
    Compile(&'static str),
    Backend(&'static str),
    Cache(&'static str),
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Default, Clone)]
struct Stat {
    calls: u64,
    exclusive_ns: u128,
    inclusive_ns: u128,
}

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
struct Profiler {
    stats: Mutex<HashMap<ProfilerKey, Stat>>,
}

impl Profiler {
    #[cfg_attr(not(feature = "profiler"), allow(dead_code))]
    fn instance() -> &'static Self {
        static INSTANCE: OnceLock<Profiler> = OnceLock::new();
        INSTANCE.get_or_init(|| Profiler {
            stats: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(feature = "profiler")]
    fn record(&self, key: ProfilerKey, exclusive: Duration, inclusive: Duration) {
        let mut stats = self.stats.lock().expect("profiler mutex poisoned");
        let entry = stats.entry(key).or_default();
        entry.calls = entry.calls.saturating_add(1);
        entry.exclusive_ns = entry.exclusive_ns.saturating_add(exclusive.as_nanos());
        entry.inclusive_ns = entry.inclusive_ns.saturating_add(inclusive.as_nanos());
    }

    #[cfg(feature = "profiler")]
    fn reset(&self) {
        self.stats.lock().expect("profiler mutex poisoned").clear();
    }

    #[cfg(feature = "profiler")]
    fn take_stats(&self) -> HashMap<ProfilerKey, Stat> {
        let mut stats = self.stats.lock().expect("profiler mutex poisoned");
        std::mem::take(&mut *stats)
    }
}

#[cfg(feature = "profiler")]
struct GuardFrame {
    key: ProfilerKey,
    start: Instant,
    child_time: Duration,
}

#[cfg(feature = "profiler")]
thread_local! {
    static ACTIVE_GUARDS: RefCell<Vec<GuardFrame>> = const { RefCell::new(Vec::new()) };
}

/// Records the time between its creation and drop. Nested guards on the
/// same thread subtract their time from the parent's exclusive total.
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    key: ProfilerKey,
}

impl ScopeGuard {
    #[inline(always)]
    fn new(key: ProfilerKey) -> Self {
        #[cfg(feature = "profiler")]
        {
            ACTIVE_GUARDS.with(|stack| {
                stack.borrow_mut().push(GuardFrame {
                    key,
                    start: Instant::now(),
                    child_time: Duration::ZERO,
                });
            });
            ScopeGuard { key }
        }
        #[cfg(not(feature = "profiler"))]
        {
            let _ = key;
            ScopeGuard {}
        }
    }
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTIVE_GUARDS.with(|stack| {
            let mut stack = stack.borrow_mut();
            let frame = stack.pop().expect("scope guard stack underflow");
            debug_assert!(frame.key == self.key, "scope guard stack corrupted");

            let elapsed = frame.start.elapsed();
            let exclusive = elapsed.saturating_sub(frame.child_time);
            Profiler::instance().record(frame.key, exclusive, elapsed);

            if let Some(parent) = stack.last_mut() {
                parent.child_time = parent.child_time.saturating_add(elapsed);
            }
        });
    }
}

#[inline(always)]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Compile(name))
}

#[inline(always)]
pub fn backend_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Backend(name))
}

/// Counts a cache hit or miss without timing anything.
#[inline(always)]
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        Profiler::instance().record(ProfilerKey::Cache(name), Duration::ZERO, Duration::ZERO);
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

#[cfg(feature = "profiler")]
#[derive(Debug, Clone, Serialize)]
pub struct TableRow {
    pub name: String,
    pub calls: u64,
    pub excl_ms: f64,
    pub incl_ms: f64,
    pub percent: f64,
}

#[cfg(not(feature = "profiler"))]
#[derive(Debug, Clone, Default)]
pub struct TableRow {
    _private: (),
}

#[cfg(feature = "profiler")]
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProfilerReport {
    pub compilation: Vec<TableRow>,
    pub backend: Vec<TableRow>,
    pub caches: Vec<TableRow>,
}

#[cfg(not(feature = "profiler"))]
#[derive(Debug, Default, Clone)]
pub struct ProfilerReport {
    _private: (),
}

#[cfg(feature = "profiler")]
fn build_table(mut rows: Vec<(&'static str, Stat)>) -> Vec<TableRow> {
    rows.sort_by(|a, b| b.1.exclusive_ns.cmp(&a.1.exclusive_ns).then(a.0.cmp(b.0)));
    let total: u128 = rows.iter().map(|(_, stat)| stat.exclusive_ns).sum();
    rows.into_iter()
        .map(|(name, stat)| TableRow {
            name: name.to_string(),
            calls: stat.calls,
            excl_ms: stat.exclusive_ns as f64 / 1e6,
            incl_ms: stat.inclusive_ns as f64 / 1e6,
            percent: if total == 0 {
                0.0
            } else {
                stat.exclusive_ns as f64 * 100.0 / total as f64
            },
        })
        .collect()
}

/// Drains the collected statistics.
#[cfg(feature = "profiler")]
pub fn take_report() -> Option<ProfilerReport> {
    let stats = Profiler::instance().take_stats();
    if stats.is_empty() {
        return None;
    }
    let mut compilation = Vec::new();
    let mut backend = Vec::new();
    let mut caches = Vec::new();
    for (key, stat) in stats {
        match key {
            ProfilerKey::Compile(name) => compilation.push((name, stat)),
            ProfilerKey::Backend(name) => backend.push((name, stat)),
            ProfilerKey::Cache(name) => caches.push((name, stat)),
        }
    }
    Some(ProfilerReport {
        compilation: build_table(compilation),
        backend: build_table(backend),
        caches: build_table(caches),
    })
}

#[cfg(not(feature = "profiler"))]
pub fn take_report() -> Option<ProfilerReport> {
    None
}

#[cfg(feature = "profiler")]
pub fn take_report_json() -> Option<String> {
    let report = take_report()?;
    serde_json::to_string(&report).ok()
}

#[cfg(not(feature = "profiler"))]
pub fn take_report_json() -> Option<String> {
    None
}

#[cfg(feature = "profiler")]
fn write_table(out: &mut String, title: &str, rows: &[TableRow]) -> fmt::Result {
    use std::fmt::Write as _;

    if rows.is_empty() {
        return Ok(());
    }
    let width = rows.iter().map(|row| row.name.len()).max().unwrap_or(0).max(4);
    writeln!(out, "== {title} ==")?;
    writeln!(
        out,
        "{:<width$}  {:>8}  {:>12}  {:>12}  {:>6}",
        "name", "calls", "excl_ms", "incl_ms", "%"
    )?;
    for row in rows {
        writeln!(
            out,
            "{:<width$}  {:>8}  {:>12.3}  {:>12.3}  {:>6.1}",
            row.name, row.calls, row.excl_ms, row.incl_ms, row.percent
        )?;
    }
    writeln!(out)
}

#[cfg(feature = "profiler")]
pub fn format_report(report: &ProfilerReport) -> String {
    let mut out = String::new();
    let _ = write_table(&mut out, "compilation", &report.compilation)
        .and_then(|_| write_table(&mut out, "backend", &report.backend))
        .and_then(|_| write_table(&mut out, "caches", &report.caches));
    out
}

#[cfg(not(feature = "profiler"))]
pub fn format_report(_report: &ProfilerReport) -> String {
    String::new()
}

pub fn take_formatted_tables() -> Option<String> {
    take_report().map(|report| format_report(&report))
}

#[cfg(feature = "profiler")]
pub fn reset() {
    Profiler::instance().reset();
}

#[cfg(not(feature = "profiler"))]
pub fn reset() {}

pub fn write_tables<W: fmt::Write>(writer: &mut W) -> fmt::Result {
    match take_formatted_tables() {
        Some(formatted) => writer.write_str(&formatted),
        None => Ok(()),
    }
}

#[cfg(all(test, feature = "profiler"))]
mod tests {
    use super::*;

    #[test]
    fn nested_scopes_split_exclusive_time() {
        reset();
        {
            let _outer = compile_scope("test.outer");
            std::thread::sleep(Duration::from_millis(2));
            {
                let _inner = backend_scope("test.inner");
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        cache_event("test.hit");
        let report = take_report().expect("report");
        let outer = report
            .compilation
            .iter()
            .find(|row| row.name == "test.outer")
            .expect("outer row");
        assert_eq!(outer.calls, 1);
        assert!(outer.incl_ms >= outer.excl_ms);
        assert!(report.backend.iter().any(|row| row.name == "test.inner"));
        assert!(report.caches.iter().any(|row| row.name == "test.hit" && row.calls == 1));
    }
}
