//! IMAP Response generation
//!
//! Generates IMAP4 response strings for client communication.

use chrono::{DateTime, Utc};

/// IMAP Response builder
pub struct ImapResponse;

impl ImapResponse {
    /// Server greeting
    pub fn greeting(hostname: &str, capabilities: &str) -> String {
        format!(
            "* OK [CAPABILITY {}] {} Cormorant IMAP4rev1 server ready\r\n",
            capabilities, hostname
        )
    }

    /// Tagged OK response
    pub fn ok(tag: &str, message: &str) -> String {
        format!("{} OK {}\r\n", tag, message)
    }

    /// Tagged OK response with a response code
    pub fn ok_code(tag: &str, code: &str, message: &str) -> String {
        format!("{} OK [{}] {}\r\n", tag, code, message)
    }

    /// Tagged NO response
    pub fn no(tag: &str, message: &str) -> String {
        format!("{} NO {}\r\n", tag, message)
    }

    /// Tagged NO response with a response code
    pub fn no_code(tag: &str, code: &str, message: &str) -> String {
        format!("{} NO [{}] {}\r\n", tag, code, message)
    }

    /// Tagged BAD response
    pub fn bad(tag: &str, message: &str) -> String {
        format!("{} BAD {}\r\n", tag, message)
    }

    /// Untagged BAD response, for input without a usable tag
    pub fn untagged_bad(message: &str) -> String {
        format!("* BAD {}\r\n", message)
    }

    /// Untagged BYE response
    pub fn bye(message: &str) -> String {
        format!("* BYE {}\r\n", message)
    }

    /// CAPABILITY response
    pub fn capability(capabilities: &str) -> String {
        format!("* CAPABILITY {}\r\n", capabilities)
    }

    /// EXPUNGE response
    pub fn expunge(seq: u32) -> String {
        format!("* {} EXPUNGE\r\n", seq)
    }

    /// COPYUID/APPENDUID response code
    pub fn copyuid(uid_validity: u32, source_uids: &str, dest_uids: &str) -> String {
        format!("COPYUID {} {} {}", uid_validity, source_uids, dest_uids)
    }

    pub fn appenduid(uid_validity: u32, uid: u32) -> String {
        format!("APPENDUID {} {}", uid_validity, uid)
    }

    /// NAMESPACE response
    pub fn namespace(delimiter: &str) -> String {
        // Personal namespace, Other users namespace, Shared namespace
        format!("* NAMESPACE ((\"\" \"{}\")) NIL NIL\r\n", delimiter)
    }

    /// LIST response for a mailbox
    pub fn list(attributes: &[String], delimiter: &str, mailbox: &str) -> String {
        format!(
            "* LIST ({}) \"{}\" {}\r\n",
            attributes.join(" "),
            delimiter,
            Self::quote(mailbox)
        )
    }

    /// LSUB response for a mailbox
    pub fn lsub(attributes: &[String], delimiter: &str, mailbox: &str) -> String {
        format!(
            "* LSUB ({}) \"{}\" {}\r\n",
            attributes.join(" "),
            delimiter,
            Self::quote(mailbox)
        )
    }

    /// SELECT/EXAMINE response components
    pub fn mailbox_flags(flags: &[String]) -> String {
        format!("* FLAGS ({})\r\n", flags.join(" "))
    }

    pub fn permanent_flags(flags: &[String]) -> String {
        format!("* OK [PERMANENTFLAGS ({})] Flags permitted\r\n", flags.join(" "))
    }

    pub fn exists(count: u32) -> String {
        format!("* {} EXISTS\r\n", count)
    }

    pub fn recent(count: u32) -> String {
        format!("* {} RECENT\r\n", count)
    }

    pub fn unseen(first_unseen: u32) -> String {
        format!("* OK [UNSEEN {}] First unseen\r\n", first_unseen)
    }

    pub fn uid_validity(validity: u32) -> String {
        format!("* OK [UIDVALIDITY {}] UIDs valid\r\n", validity)
    }

    pub fn uid_next(next: u32) -> String {
        format!("* OK [UIDNEXT {}] Predicted next UID\r\n", next)
    }

    /// STATUS response
    pub fn status(mailbox: &str, items: &[(&str, u32)]) -> String {
        let items_str: Vec<String> = items.iter().map(|(k, v)| format!("{} {}", k, v)).collect();
        format!("* STATUS {} ({})\r\n", Self::quote(mailbox), items_str.join(" "))
    }

    /// Untagged FETCH carrying only flags, as sent for flag changes
    pub fn fetch_flags(seq: u32, uid: Option<u32>, flags: &[String]) -> String {
        match uid {
            Some(uid) => format!(
                "* {} FETCH (UID {} FLAGS {})\r\n",
                seq,
                uid,
                Self::format_flags(flags)
            ),
            None => format!("* {} FETCH (FLAGS {})\r\n", seq, Self::format_flags(flags)),
        }
    }

    /// SEARCH response
    pub fn search(ids: &[u32]) -> String {
        if ids.is_empty() {
            "* SEARCH\r\n".to_string()
        } else {
            let ids_str: Vec<String> = ids.iter().map(|u| u.to_string()).collect();
            format!("* SEARCH {}\r\n", ids_str.join(" "))
        }
    }

    /// Format flags as a parenthesised list
    pub fn format_flags(flags: &[String]) -> String {
        format!("({})", flags.join(" "))
    }

    /// Format internal date for FETCH
    pub fn format_internal_date(dt: &DateTime<Utc>) -> String {
        format!("\"{}\"", dt.format("%d-%b-%Y %H:%M:%S %z"))
    }

    /// Quote a string for IMAP (escape backslash and quote)
    pub fn quote(s: &str) -> String {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }

    /// Continuation request; AUTHENTICATE challenges are sent as base64
    /// text, an empty challenge as a bare `+ `
    pub fn continue_with(text: &str) -> String {
        format!("+ {}\r\n", text)
    }
}

/// Builder for one untagged FETCH response. Bodies are sent as literals and
/// may hold arbitrary bytes, so the response is assembled as bytes.
pub struct FetchResponse {
    buf: Vec<u8>,
    first: bool,
}

impl FetchResponse {
    pub fn new(seq: u32) -> Self {
        Self {
            buf: format!("* {} FETCH (", seq).into_bytes(),
            first: true,
        }
    }

    fn separator(&mut self) {
        if !self.first {
            self.buf.push(b' ');
        }
        self.first = false;
    }

    /// Add `NAME value`
    pub fn item(&mut self, name: &str, value: &str) -> &mut Self {
        self.separator();
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(b' ');
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Add `NAME {len}\r\n<data>`
    pub fn literal(&mut self, name: &str, data: &[u8]) -> &mut Self {
        self.separator();
        self.buf
            .extend_from_slice(format!("{} {{{}}}\r\n", name, data.len()).as_bytes());
        self.buf.extend_from_slice(data);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(b")\r\n");
        self.buf
    }
}
