use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Single-line `label: done/total` counter on stderr for batch commands.
pub struct ProgressCounter {
    label: &'static str,
    total: u64,
    done: AtomicU64,
    enabled: bool,
}

impl ProgressCounter {
    pub fn new(label: &'static str, total: u64, enabled: bool) -> Self {
        let counter = Self {
            label,
            total,
            done: AtomicU64::new(0),
            enabled,
        };
        counter.print(0);
        counter
    }

    pub fn inc(&self) {
        let current = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.print(current);
    }

    pub fn finish(&self) {
        if self.enabled {
            eprintln!();
        }
    }

    fn print(&self, current: u64) {
        if !self.enabled {
            return;
        }
        eprint!("\r{}: {}/{}", self.label, current, self.total);
        let _ = std::io::stderr().flush();
    }
}

/// Trims, drops blanks and removes case-insensitive duplicates, keeping the first spelling.
pub fn normalize_tags<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut tags: Vec<String> = Vec::new();
    for name in names {
        let name = name.as_ref().trim();
        if name.is_empty() || tags.iter().any(|t| t.to_lowercase() == name.to_lowercase()) {
            continue;
        }
        tags.push(name.to_string());
    }
    tags
}

pub fn split_tag_list(raw: &str) -> Vec<String> {
    normalize_tags(raw.split(','))
}

/// True for an empty location or one that still reads like `"52.4603, -2.1638"`.
pub fn is_coordinate_string(location: &str) -> bool {
    let location = location.trim();
    if location.is_empty() {
        return true;
    }
    let Some((lat, lon)) = location.split_once(',') else {
        return false;
    };
    is_decimal(lat) && is_decimal(lon.trim_start())
}

fn is_decimal(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    let Some((whole, frac)) = digits.split_once('.') else {
        return false;
    };
    !whole.is_empty()
        && !frac.is_empty()
        && whole.bytes().all(|b| b.is_ascii_digit())
        && frac.bytes().all(|b| b.is_ascii_digit())
}
