//! SEARCH criteria evaluation against stored messages

use crate::models::Message;
use cormorant_common::types::flags::{ANSWERED, DELETED, DRAFT, FLAGGED, RECENT, SEEN};
use cormorant_common::types::SearchCriteria;

/// Position of a message within its mailbox, needed for sequence and UID
/// set criteria that may refer to `*`.
#[derive(Debug, Clone, Copy)]
pub struct SearchContext {
    pub seq: u32,
    pub max_seq: u32,
    pub max_uid: u32,
}

/// Check if a message matches search criteria
pub fn matches(msg: &Message, ctx: SearchContext, criteria: &SearchCriteria) -> bool {
    match criteria {
        SearchCriteria::All => true,
        SearchCriteria::Answered => msg.has_flag(ANSWERED),
        SearchCriteria::Deleted => msg.has_flag(DELETED),
        SearchCriteria::Draft => msg.has_flag(DRAFT),
        SearchCriteria::Flagged => msg.has_flag(FLAGGED),
        SearchCriteria::Seen => msg.has_flag(SEEN),
        SearchCriteria::Recent => msg.has_flag(RECENT),
        SearchCriteria::Unanswered => !msg.has_flag(ANSWERED),
        SearchCriteria::Undeleted => !msg.has_flag(DELETED),
        SearchCriteria::Undraft => !msg.has_flag(DRAFT),
        SearchCriteria::Unflagged => !msg.has_flag(FLAGGED),
        SearchCriteria::Unseen => !msg.has_flag(SEEN),
        SearchCriteria::New => msg.has_flag(RECENT) && !msg.has_flag(SEEN),
        SearchCriteria::Old => !msg.has_flag(RECENT),
        SearchCriteria::Keyword(k) => msg.has_flag(k),
        SearchCriteria::Unkeyword(k) => !msg.has_flag(k),
        SearchCriteria::From(s) => header_contains(msg, "From", s),
        SearchCriteria::To(s) => header_contains(msg, "To", s),
        SearchCriteria::Cc(s) => header_contains(msg, "Cc", s),
        SearchCriteria::Bcc(s) => header_contains(msg, "Bcc", s),
        SearchCriteria::Subject(s) => header_contains(msg, "Subject", s),
        SearchCriteria::Header(name, s) => header_contains(msg, name, s),
        SearchCriteria::Body(s) => contains_ignore_case(msg.text(), s),
        SearchCriteria::Text(s) => contains_ignore_case(&msg.body, s),
        SearchCriteria::Larger(size) => msg.size > *size,
        SearchCriteria::Smaller(size) => msg.size < *size,
        SearchCriteria::Before(day) => msg.date.date_naive() < *day,
        SearchCriteria::On(day) => msg.date.date_naive() == *day,
        SearchCriteria::Since(day) => msg.date.date_naive() >= *day,
        SearchCriteria::SequenceSet(set) => set.contains(ctx.seq, ctx.max_seq),
        SearchCriteria::Uid(set) => set.contains(msg.uid, ctx.max_uid),
        SearchCriteria::Not(inner) => !matches(msg, ctx, inner),
        SearchCriteria::Or(a, b) => matches(msg, ctx, a) || matches(msg, ctx, b),
        SearchCriteria::And(list) => list.iter().all(|c| matches(msg, ctx, c)),
    }
}

/// Whether any header field called `name` contains `needle`, ignoring case.
/// An empty needle matches when the field is present.
fn header_contains(msg: &Message, name: &str, needle: &str) -> bool {
    let header = String::from_utf8_lossy(msg.header());
    let needle = needle.to_lowercase();
    unfolded_fields(&header)
        .into_iter()
        .filter(|(field, _)| field.eq_ignore_ascii_case(name))
        .any(|(_, value)| value.to_lowercase().contains(&needle))
}

/// Split a header block into (name, value) pairs, joining continuation lines
fn unfolded_fields(header: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in header.lines() {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = fields.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            fields.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    fields
}

fn contains_ignore_case(haystack: &[u8], needle: &str) -> bool {
    String::from_utf8_lossy(haystack)
        .to_lowercase()
        .contains(&needle.to_lowercase())
}
