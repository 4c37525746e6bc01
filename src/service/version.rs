//! Version resolution for handler variants.
//!
//! A variant's declared version is one of:
//! - `""`: matches every requested version
//! - `"1.2"`: matches exactly `"1.2"`
//! - `"1.2+"`: matches `"1.2"` and anything newer
//!
//! Versions compare segment by segment, numerically where both segments are
//! numeric, so `"1.10"` is newer than `"1.9"`.

use std::cmp::Ordering;

use super::registry::HandlerVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Num(u64),
    Text(&'a str),
}

impl Ord for Segment<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Segment::Num(a), Segment::Num(b)) => a.cmp(b),
            (Segment::Text(a), Segment::Text(b)) => a.cmp(b),
            // Pre-release tags sort before any release number.
            (Segment::Text(_), Segment::Num(_)) => Ordering::Less,
            (Segment::Num(_), Segment::Text(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Segment<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn segments(version: &str) -> Vec<Segment<'_>> {
    let trimmed = version
        .trim()
        .trim_start_matches(|c| c == 'v' || c == 'V');
    trimmed
        .split(|c| matches!(c, '.' | '-' | '_' | '+'))
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<u64>() {
            Ok(n) => Segment::Num(n),
            Err(_) => Segment::Text(s),
        })
        .collect()
}

/// Compare two version strings segment by segment.
///
/// Missing trailing segments count as zero: `"2"` equals `"2.0"`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = segments(a);
    let right = segments(b);
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(Segment::Num(0));
        let r = right.get(i).copied().unwrap_or(Segment::Num(0));
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether a declared variant version accepts the requested version.
pub fn version_matches(declared: &str, requested: &str) -> bool {
    if declared.is_empty() || declared == requested {
        return true;
    }
    match declared.strip_suffix('+') {
        Some(base) => {
            requested == base || compare_versions(requested, base) != Ordering::Less
        }
        None => false,
    }
}

/// First variant, in registry order, whose version accepts `requested`.
pub fn resolve<'a>(variants: &'a [HandlerVariant], requested: &str) -> Option<&'a HandlerVariant> {
    variants
        .iter()
        .find(|v| version_matches(&v.version, requested))
}
