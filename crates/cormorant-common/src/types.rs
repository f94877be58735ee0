//! Common protocol value types for Cormorant

use chrono::NaiveDate;

/// Well-known system flags
pub mod flags {
    pub const SEEN: &str = "\\Seen";
    pub const ANSWERED: &str = "\\Answered";
    pub const FLAGGED: &str = "\\Flagged";
    pub const DELETED: &str = "\\Deleted";
    pub const DRAFT: &str = "\\Draft";
    /// Server-maintained; clients never set it
    pub const RECENT: &str = "\\Recent";

    /// Keyword used by mail clients to mark a message as not spam
    pub const NONJUNK: &str = "nonjunk";

    /// System flags a client may set
    pub const SYSTEM: [&str; 5] = [ANSWERED, FLAGGED, DELETED, SEEN, DRAFT];

    /// Canonical capitalisation for system flags; keywords pass through.
    pub fn normalize(flag: &str) -> String {
        [SEEN, ANSWERED, FLAGGED, DELETED, DRAFT, RECENT]
            .iter()
            .find(|known| known.eq_ignore_ascii_case(flag))
            .map(|known| known.to_string())
            .unwrap_or_else(|| flag.to_string())
    }

    /// Whether `set` contains `flag`
    pub fn contains(set: &[String], flag: &str) -> bool {
        set.iter().any(|f| f == flag)
    }
}

/// Sequence set for message selection, by sequence number or by UID.
///
/// `u32::MAX` stands for `*`, the largest number in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceSet {
    /// Single number
    Single(u32),
    /// Range of numbers, inclusive, in either order
    Range(u32, u32),
    /// Multiple sets
    Multiple(Vec<SequenceSet>),
}

impl SequenceSet {
    /// Parse a sequence set string
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }

        if s.contains(',') {
            let sets = s
                .split(',')
                .map(|p| Self::parse(p.trim()))
                .collect::<Option<Vec<_>>>()?;
            return Some(SequenceSet::Multiple(sets));
        }

        match s.split_once(':') {
            Some((start, end)) => Some(SequenceSet::Range(
                Self::parse_number(start)?,
                Self::parse_number(end)?,
            )),
            None => Self::parse_number(s).map(SequenceSet::Single),
        }
    }

    fn parse_number(s: &str) -> Option<u32> {
        if s == "*" {
            return Some(u32::MAX);
        }
        match s.parse::<u32>() {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        }
    }

    /// Check if a number is in this set, given the largest number in use
    pub fn contains(&self, n: u32, max: u32) -> bool {
        let resolve = |v: u32| if v == u32::MAX { max } else { v };
        match self {
            SequenceSet::Single(v) => n == resolve(*v),
            SequenceSet::Range(start, end) => {
                let (a, b) = (resolve(*start), resolve(*end));
                n >= a.min(b) && n <= a.max(b)
            }
            SequenceSet::Multiple(sets) => sets.iter().any(|s| s.contains(n, max)),
        }
    }
}

impl std::fmt::Display for SequenceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: u32| {
            if v == u32::MAX {
                "*".to_string()
            } else {
                v.to_string()
            }
        };
        match self {
            SequenceSet::Single(v) => write!(f, "{}", show(*v)),
            SequenceSet::Range(a, b) => write!(f, "{}:{}", show(*a), show(*b)),
            SequenceSet::Multiple(sets) => {
                let parts: Vec<String> = sets.iter().map(|s| s.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// Compact a list of numbers into sequence-set syntax, e.g. `1:3,7`
pub fn compact_numbers(numbers: &[u32]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut iter = numbers.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end.wrapping_add(1))) {
            end = iter.next().unwrap_or(end);
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}:{}", start, end));
        }
    }
    parts.join(",")
}

/// Search criteria
#[derive(Debug, Clone, PartialEq)]
pub enum SearchCriteria {
    /// All messages
    All,
    /// Answered messages
    Answered,
    /// BCC header contains string
    Bcc(String),
    /// Internal date earlier than the given day
    Before(NaiveDate),
    /// Body contains string
    Body(String),
    /// CC header contains string
    Cc(String),
    /// Deleted messages
    Deleted,
    /// Draft messages
    Draft,
    /// Flagged messages
    Flagged,
    /// From header contains string
    From(String),
    /// Messages with specific header value
    Header(String, String),
    /// Messages carrying a keyword
    Keyword(String),
    /// Larger than size
    Larger(u32),
    /// New messages (Recent and not Seen)
    New,
    /// Logical NOT
    Not(Box<SearchCriteria>),
    /// Old messages (not Recent)
    Old,
    /// Internal date within the given day
    On(NaiveDate),
    /// Logical OR
    Or(Box<SearchCriteria>, Box<SearchCriteria>),
    /// Recent messages
    Recent,
    /// Seen messages
    Seen,
    /// Internal date within or later than the given day
    Since(NaiveDate),
    /// Smaller than size
    Smaller(u32),
    /// Subject contains string
    Subject(String),
    /// Text (headers + body) contains string
    Text(String),
    /// To header contains string
    To(String),
    /// Messages with UID in set
    Uid(SequenceSet),
    /// Unanswered messages
    Unanswered,
    /// Undeleted messages
    Undeleted,
    /// Undraft messages
    Undraft,
    /// Unflagged messages
    Unflagged,
    /// Messages lacking a keyword
    Unkeyword(String),
    /// Unseen messages
    Unseen,
    /// Sequence set
    SequenceSet(SequenceSet),
    /// Logical AND (multiple criteria)
    And(Vec<SearchCriteria>),
}
