//! Monotonic, lexicographically sortable IDs.
//!
//! Each ID is `<prefix>_<time><counter>`, hex-encoded so that plain string
//! comparison matches the intended chronological order. Ascending IDs sort
//! oldest-first; descending IDs sort newest-first (used for sessions, so a
//! prefix listing of `session/info/` comes back newest-first for free).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Entity kinds that mint IDs. The string is the ID's stable prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Session,
    Message,
    ToolCall,
    Share,
}

impl Kind {
    fn prefix(self) -> &'static str {
        match self {
            Kind::Session => "ses",
            Kind::Message => "msg",
            Kind::ToolCall => "tc",
            Kind::Share => "shr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Ceiling used to invert the time component for descending IDs. Large
/// enough that `CEILING_MS - now_ms` stays positive for centuries.
const CEILING_MS: u64 = 9_999_999_999_999;

/// Generator for [`Kind`]-scoped, [`Direction`]-ordered IDs.
///
/// Two calls for the same `(kind, direction)` within the same millisecond are
/// disambiguated by a per-key counter appended after the time component.
pub struct Identifier {
    last: Mutex<HashMap<(Kind, Direction), (u64, u32)>>,
}

impl Default for Identifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Identifier {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh ID for `kind`, ordered by `direction`.
    pub fn next(&self, kind: Kind, direction: Direction) -> String {
        let now_ms = now_millis();
        let mut last = self.last.lock();
        let entry = last.entry((kind, direction)).or_insert((0, 0));
        let counter = if entry.0 == now_ms {
            entry.1 += 1;
            entry.1
        } else {
            *entry = (now_ms, 0);
            0
        };

        let time_component = match direction {
            Direction::Ascending => now_ms,
            Direction::Descending => CEILING_MS.saturating_sub(now_ms),
        };

        format!(
            "{}_{:012x}{:04x}",
            kind.prefix(),
            time_component,
            counter
        )
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_ids_sort_chronologically() {
        let ids = Identifier::new();
        let a = ids.next(Kind::Message, Direction::Ascending);
        let b = ids.next(Kind::Message, Direction::Ascending);
        let c = ids.next(Kind::Message, Direction::Ascending);
        let mut sorted = vec![c.clone(), a.clone(), b.clone()];
        sorted.sort();
        assert_eq!(sorted, vec![a, b, c]);
    }

    #[test]
    fn descending_ids_sort_newest_first() {
        let ids = Identifier::new();
        let first = ids.next(Kind::Session, Direction::Descending);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = ids.next(Kind::Session, Direction::Descending);
        let mut sorted = vec![first.clone(), second.clone()];
        sorted.sort();
        assert_eq!(sorted[0], second, "newest id should sort first");
        assert_eq!(sorted[1], first);
    }

    #[test]
    fn same_millisecond_calls_differ() {
        let ids = Identifier::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let id = ids.next(Kind::Message, Direction::Ascending);
            assert!(seen.insert(id), "ID must be unique even within one ms");
        }
    }

    #[test]
    fn prefix_matches_kind() {
        let ids = Identifier::new();
        assert!(ids
            .next(Kind::Session, Direction::Descending)
            .starts_with("ses_"));
        assert!(ids
            .next(Kind::Message, Direction::Ascending)
            .starts_with("msg_"));
        assert!(ids
            .next(Kind::ToolCall, Direction::Ascending)
            .starts_with("tc_"));
        assert!(ids
            .next(Kind::Share, Direction::Ascending)
            .starts_with("shr_"));
    }
}
