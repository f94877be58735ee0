//! IMAP Command Parser
//!
//! Parses IMAP4 commands from client input. A request is the command text
//! with every literal left as its `{n}` marker, plus the literal payloads in
//! order of appearance.

use super::command::{FetchItem, ImapCommand, StoreFlags, TaggedCommand};
use chrono::{DateTime, NaiveDate, Utc};
use cormorant_common::types::{flags, SearchCriteria, SequenceSet};
use cormorant_storage::{FlagsOp, StatusItem};
use std::collections::VecDeque;
use thiserror::Error;

/// A request that could not be parsed. `tag` is known when the failure came
/// after the tag, so the reply can be tagged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ParseError {
    pub tag: Option<String>,
    pub message: String,
}

/// Literal announced at the end of a line: its length and whether it is
/// non-synchronising (`{n+}`).
pub fn literal_length(line: &str) -> Option<(usize, bool)> {
    let line = line.strip_suffix('}')?;
    let start = line.rfind('{')?;
    let marker = &line[start + 1..];
    let (digits, non_sync) = match marker.strip_suffix('+') {
        Some(digits) => (digits, true),
        None => (marker, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, non_sync))
}

/// IMAP command parser
pub struct ImapParser;

impl ImapParser {
    /// Parse a command line that carries no literals
    pub fn parse(line: &str) -> Result<TaggedCommand, ParseError> {
        Self::parse_request(line, Vec::new())
    }

    /// Parse a complete request
    pub fn parse_request(text: &str, literals: Vec<Vec<u8>>) -> Result<TaggedCommand, ParseError> {
        let mut tokens = Tokens::new(text.trim_end_matches(['\r', '\n']), literals);

        let tag = tokens
            .atom()
            .filter(|t| !t.contains(['+', '"', '{', '*', '%']))
            .ok_or_else(|| ParseError {
                tag: None,
                message: "Missing or invalid tag".to_string(),
            })?
            .to_string();

        let fail = |message: String| ParseError {
            tag: Some(tag.clone()),
            message,
        };

        let name = tokens
            .atom()
            .ok_or_else(|| fail("Missing command".to_string()))?
            .to_uppercase();

        let command = Self::parse_command(&name, &mut tokens).map_err(fail)?;
        if !tokens.at_end() {
            return Err(fail(format!("Unexpected arguments to {}", name)));
        }

        Ok(TaggedCommand { tag, command })
    }

    /// Parse the command portion
    fn parse_command(name: &str, tokens: &mut Tokens<'_>) -> Result<ImapCommand, String> {
        let invalid = || format!("Invalid {} arguments", name);

        match name {
            // Any state
            "CAPABILITY" => Ok(ImapCommand::Capability),
            "NOOP" => Ok(ImapCommand::Noop),
            "LOGOUT" => Ok(ImapCommand::Logout),
            "STARTTLS" => Ok(ImapCommand::StartTls),

            // Not authenticated
            "LOGIN" => {
                let username = tokens.astring().ok_or_else(invalid)?;
                let password = tokens.astring().ok_or_else(invalid)?;
                Ok(ImapCommand::Login { username, password })
            }
            "AUTHENTICATE" => {
                let mechanism = tokens.atom().ok_or_else(invalid)?.to_uppercase();
                let initial_response = tokens.atom().map(str::to_string);
                Ok(ImapCommand::Authenticate {
                    mechanism,
                    initial_response,
                })
            }

            // Authenticated state - mailbox management
            "SELECT" => Ok(ImapCommand::Select {
                mailbox: tokens.astring().ok_or_else(invalid)?,
            }),
            "EXAMINE" => Ok(ImapCommand::Examine {
                mailbox: tokens.astring().ok_or_else(invalid)?,
            }),
            "CREATE" => Ok(ImapCommand::Create {
                mailbox: tokens.astring().ok_or_else(invalid)?,
            }),
            "DELETE" => Ok(ImapCommand::Delete {
                mailbox: tokens.astring().ok_or_else(invalid)?,
            }),
            "RENAME" => Ok(ImapCommand::Rename {
                old_mailbox: tokens.astring().ok_or_else(invalid)?,
                new_mailbox: tokens.astring().ok_or_else(invalid)?,
            }),
            "SUBSCRIBE" => Ok(ImapCommand::Subscribe {
                mailbox: tokens.astring().ok_or_else(invalid)?,
            }),
            "UNSUBSCRIBE" => Ok(ImapCommand::Unsubscribe {
                mailbox: tokens.astring().ok_or_else(invalid)?,
            }),
            "LIST" => Ok(ImapCommand::List {
                reference: tokens.astring().ok_or_else(invalid)?,
                pattern: tokens.astring().ok_or_else(invalid)?,
            }),
            "LSUB" => Ok(ImapCommand::Lsub {
                reference: tokens.astring().ok_or_else(invalid)?,
                pattern: tokens.astring().ok_or_else(invalid)?,
            }),
            "STATUS" => {
                let mailbox = tokens.astring().ok_or_else(invalid)?;
                let items = tokens
                    .atom_list()
                    .ok_or_else(invalid)?
                    .into_iter()
                    .map(|item| {
                        StatusItem::parse(item).ok_or_else(|| format!("Unknown status item {}", item))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ImapCommand::Status { mailbox, items })
            }
            "APPEND" => Self::parse_append(tokens).ok_or_else(invalid),
            "IDLE" => Ok(ImapCommand::Idle),
            "NAMESPACE" => Ok(ImapCommand::Namespace),

            // Selected state - message operations
            "CHECK" => Ok(ImapCommand::Check),
            "CLOSE" => Ok(ImapCommand::Close),
            "UNSELECT" => Ok(ImapCommand::Unselect),
            "EXPUNGE" => Ok(ImapCommand::Expunge),
            "FETCH" | "SEARCH" | "STORE" | "COPY" | "MOVE" => {
                Self::parse_message_command(name, tokens, false)
            }
            "UID" => {
                let sub = tokens.atom().ok_or_else(invalid)?.to_uppercase();
                match sub.as_str() {
                    "FETCH" | "SEARCH" | "STORE" | "COPY" | "MOVE" => {
                        Self::parse_message_command(&sub, tokens, true)
                    }
                    _ => Err(format!("Unknown command UID {}", sub)),
                }
            }

            _ => Err("Unknown command".to_string()),
        }
    }

    /// FETCH, SEARCH, STORE, COPY and MOVE, plain or UID
    fn parse_message_command(
        name: &str,
        tokens: &mut Tokens<'_>,
        uid: bool,
    ) -> Result<ImapCommand, String> {
        let invalid = || format!("Invalid {} arguments", name);

        if name == "SEARCH" {
            let criteria = Self::parse_search_criteria(tokens)?;
            return Ok(ImapCommand::Search { criteria, uid });
        }

        let sequence = tokens
            .atom()
            .and_then(SequenceSet::parse)
            .ok_or_else(|| "Invalid sequence set".to_string())?;

        match name {
            "FETCH" => {
                let raw = match tokens.atom_list() {
                    Some(items) => items,
                    None => vec![tokens.atom().ok_or_else(invalid)?],
                };
                if raw.is_empty() {
                    return Err(invalid());
                }
                let items = raw
                    .into_iter()
                    .map(|item| {
                        FetchItem::parse(item).ok_or_else(|| format!("Unsupported fetch item {}", item))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ImapCommand::Fetch {
                    sequence,
                    items,
                    uid,
                })
            }
            "STORE" => {
                let item = tokens.atom().ok_or_else(invalid)?;
                let flags = Self::parse_store_flags(item, tokens)?;
                Ok(ImapCommand::Store {
                    sequence,
                    flags,
                    uid,
                })
            }
            "COPY" => Ok(ImapCommand::Copy {
                sequence,
                mailbox: tokens.astring().ok_or_else(invalid)?,
                uid,
            }),
            _ => Ok(ImapCommand::Move {
                sequence,
                mailbox: tokens.astring().ok_or_else(invalid)?,
                uid,
            }),
        }
    }

    /// Parse STORE flags specification
    fn parse_store_flags(item: &str, tokens: &mut Tokens<'_>) -> Result<StoreFlags, String> {
        let item = item.to_uppercase();
        let (operation, rest) = match item.as_bytes().first() {
            Some(b'+') => (FlagsOp::Add, &item[1..]),
            Some(b'-') => (FlagsOp::Remove, &item[1..]),
            _ => (FlagsOp::Set, item.as_str()),
        };
        let silent = match rest {
            "FLAGS" => false,
            "FLAGS.SILENT" => true,
            _ => return Err(format!("Unknown store item {}", item)),
        };

        let raw = match tokens.atom_list() {
            Some(list) => list,
            None => {
                let mut bare = Vec::new();
                while let Some(flag) = tokens.atom() {
                    bare.push(flag);
                }
                bare
            }
        };

        Ok(StoreFlags {
            operation,
            silent,
            flags: raw.into_iter().map(flags::normalize).collect(),
        })
    }

    /// Parse APPEND command
    fn parse_append(tokens: &mut Tokens<'_>) -> Option<ImapCommand> {
        // APPEND mailbox [(flags)] [date-time] literal
        let mailbox = tokens.astring()?;

        let mut flag_list = Vec::new();
        if tokens.peek() == Some('(') {
            flag_list = tokens
                .atom_list()?
                .into_iter()
                .map(flags::normalize)
                .collect();
        }

        let mut date = None;
        if tokens.peek() == Some('"') {
            let raw = tokens.quoted()?;
            let parsed = DateTime::parse_from_str(raw.trim(), "%d-%b-%Y %H:%M:%S %z").ok()?;
            date = Some(parsed.with_timezone(&Utc));
        }

        let message = tokens.string_bytes()?;

        Some(ImapCommand::Append {
            mailbox,
            flags: flag_list,
            date,
            message,
        })
    }

    /// Parse search criteria
    fn parse_search_criteria(tokens: &mut Tokens<'_>) -> Result<SearchCriteria, String> {
        if tokens.eat_keyword("CHARSET") {
            let charset = tokens.astring().ok_or("Missing charset")?;
            if !charset.eq_ignore_ascii_case("UTF-8") && !charset.eq_ignore_ascii_case("US-ASCII") {
                return Err("[BADCHARSET (UTF-8 US-ASCII)] Unsupported charset".to_string());
            }
        }

        let mut keys = Vec::new();
        while !tokens.at_end() {
            keys.push(Self::parse_search_key(tokens)?);
        }
        match keys.len() {
            0 => Err("Missing search criteria".to_string()),
            1 => Ok(keys.remove(0)),
            _ => Ok(SearchCriteria::And(keys)),
        }
    }

    fn parse_search_key(tokens: &mut Tokens<'_>) -> Result<SearchCriteria, String> {
        if tokens.eat('(') {
            let mut keys = Vec::new();
            while !tokens.eat(')') {
                if tokens.at_end() {
                    return Err("Unbalanced parentheses".to_string());
                }
                keys.push(Self::parse_search_key(tokens)?);
            }
            return Ok(SearchCriteria::And(keys));
        }

        let key = tokens.atom().ok_or("Invalid search key")?;
        let string = |value: Option<String>| value.ok_or_else(|| format!("Missing argument to {}", key));
        let number = |value: Option<&str>| {
            value
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(|| format!("Invalid number for {}", key))
        };
        let date = |value: Option<String>| {
            value
                .and_then(|d| NaiveDate::parse_from_str(&d, "%d-%b-%Y").ok())
                .ok_or_else(|| format!("Invalid date for {}", key))
        };

        let criteria = match key.to_uppercase().as_str() {
            "ALL" => SearchCriteria::All,
            "ANSWERED" => SearchCriteria::Answered,
            "DELETED" => SearchCriteria::Deleted,
            "DRAFT" => SearchCriteria::Draft,
            "FLAGGED" => SearchCriteria::Flagged,
            "NEW" => SearchCriteria::New,
            "OLD" => SearchCriteria::Old,
            "RECENT" => SearchCriteria::Recent,
            "SEEN" => SearchCriteria::Seen,
            "UNANSWERED" => SearchCriteria::Unanswered,
            "UNDELETED" => SearchCriteria::Undeleted,
            "UNDRAFT" => SearchCriteria::Undraft,
            "UNFLAGGED" => SearchCriteria::Unflagged,
            "UNSEEN" => SearchCriteria::Unseen,
            "KEYWORD" => SearchCriteria::Keyword(string(tokens.astring())?),
            "UNKEYWORD" => SearchCriteria::Unkeyword(string(tokens.astring())?),
            "BCC" => SearchCriteria::Bcc(string(tokens.astring())?),
            "CC" => SearchCriteria::Cc(string(tokens.astring())?),
            "FROM" => SearchCriteria::From(string(tokens.astring())?),
            "TO" => SearchCriteria::To(string(tokens.astring())?),
            "SUBJECT" => SearchCriteria::Subject(string(tokens.astring())?),
            "BODY" => SearchCriteria::Body(string(tokens.astring())?),
            "TEXT" => SearchCriteria::Text(string(tokens.astring())?),
            "HEADER" => {
                let field = string(tokens.astring())?;
                SearchCriteria::Header(field, string(tokens.astring())?)
            }
            "LARGER" => SearchCriteria::Larger(number(tokens.atom())?),
            "SMALLER" => SearchCriteria::Smaller(number(tokens.atom())?),
            "BEFORE" => SearchCriteria::Before(date(tokens.astring())?),
            "ON" => SearchCriteria::On(date(tokens.astring())?),
            "SINCE" => SearchCriteria::Since(date(tokens.astring())?),
            "NOT" => SearchCriteria::Not(Box::new(Self::parse_search_key(tokens)?)),
            "OR" => {
                let left = Self::parse_search_key(tokens)?;
                let right = Self::parse_search_key(tokens)?;
                SearchCriteria::Or(Box::new(left), Box::new(right))
            }
            "UID" => SearchCriteria::Uid(
                tokens
                    .atom()
                    .and_then(SequenceSet::parse)
                    .ok_or("Invalid UID set")?,
            ),
            _ => SearchCriteria::SequenceSet(
                SequenceSet::parse(key).ok_or_else(|| format!("Unknown search key {}", key))?,
            ),
        };
        Ok(criteria)
    }
}

/// Cursor over request text
struct Tokens<'a> {
    input: &'a str,
    pos: usize,
    literals: VecDeque<Vec<u8>>,
}

impl<'a> Tokens<'a> {
    fn new(input: &'a str, literals: Vec<Vec<u8>>) -> Self {
        Self {
            input,
            pos: 0,
            literals: literals.into(),
        }
    }

    fn skip_spaces(&mut self) {
        while self.input[self.pos..].starts_with(' ') {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_spaces();
        self.input[self.pos..].chars().next()
    }

    fn at_end(&mut self) -> bool {
        self.peek().is_none()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let saved = self.pos;
        match self.atom() {
            Some(word) if word.eq_ignore_ascii_case(keyword) => true,
            _ => {
                self.pos = saved;
                false
            }
        }
    }

    /// Run of characters up to a space or parenthesis
    fn atom(&mut self) -> Option<&'a str> {
        self.skip_spaces();
        let input: &'a str = self.input;
        let rest = &input[self.pos..];
        if rest.starts_with(['"', '{']) {
            return None;
        }
        let end = rest.find([' ', '(', ')']).unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        self.pos += end;
        Some(&rest[..end])
    }

    fn quoted(&mut self) -> Option<String> {
        if !self.eat('"') {
            return None;
        }
        let input: &'a str = self.input;
        let mut value = String::new();
        let mut escaped = false;
        for (i, c) in input[self.pos..].char_indices() {
            if escaped {
                value.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                self.pos += i + 1;
                return Some(value);
            } else {
                value.push(c);
            }
        }
        None
    }

    /// `{n}` marker, replaced by the next queued literal
    fn literal(&mut self) -> Option<Vec<u8>> {
        self.skip_spaces();
        let input: &'a str = self.input;
        let rest = input[self.pos..].strip_prefix('{')?;
        let end = rest.find('}')?;
        let len: usize = rest[..end].trim_end_matches('+').parse().ok()?;
        let data = self.literals.pop_front()?;
        if data.len() != len {
            return None;
        }
        self.pos += end + 2;
        Some(data)
    }

    /// Quoted string or literal
    fn string_bytes(&mut self) -> Option<Vec<u8>> {
        match self.peek()? {
            '"' => self.quoted().map(String::into_bytes),
            '{' => self.literal(),
            _ => None,
        }
    }

    fn astring(&mut self) -> Option<String> {
        let bytes = match self.peek()? {
            '"' | '{' => self.string_bytes()?,
            _ => self.atom()?.as_bytes().to_vec(),
        };
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Parenthesised list of atoms
    fn atom_list(&mut self) -> Option<Vec<&'a str>> {
        if !self.eat('(') {
            return None;
        }
        let mut items = Vec::new();
        loop {
            if self.eat(')') {
                return Some(items);
            }
            items.push(self.atom()?);
        }
    }
}
