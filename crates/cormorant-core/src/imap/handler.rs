//! Per-connection IMAP session driver
//!
//! Reads requests (including literals), runs them through the session state
//! machine against the store, renders store updates as untagged responses
//! and enforces STARTTLS, authentication and auto-logout rules.

use super::command::{FetchItem, ImapCommand, Section, StoreFlags, TaggedCommand};
use super::parser::{literal_length, ImapParser};
use super::response::{FetchResponse, ImapResponse};
use super::session::{ImapSession, KnownMessage, SelectedMailbox, SessionState};
use super::stream::ImapStream;
use crate::auth::{decode_response, encode_challenge, SaslRegistry, SaslStep};

use chrono::{DateTime, Utc};
use cormorant_common::config::ImapConfig;
use cormorant_common::types::flags::{self, RECENT, SEEN};
use cormorant_common::types::{compact_numbers, SearchCriteria, SequenceSet};
use cormorant_common::{Error, Result};
use cormorant_storage::{
    Backend, Delivery, FlagsOp, Mailbox, MessageEntry, StatusItem, UpdateReceiver, User,
    DELIMITER, INBOX,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{sleep_until, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runtime settings shared by every session of a server
#[derive(Clone)]
pub struct SessionConfig {
    /// Name announced in the greeting
    pub hostname: String,
    /// Permit LOGIN and plaintext SASL before TLS
    pub allow_insecure_auth: bool,
    /// Idle time after which an authenticated session is closed
    pub auto_logout: Option<Duration>,
    /// Largest literal accepted, in bytes
    pub max_literal_size: usize,
    /// Push `* CAPABILITY` right after a STARTTLS handshake
    pub announce_capabilities_after_starttls: bool,
    /// Mechanisms offered by AUTHENTICATE
    pub sasl: SaslRegistry,
}

impl SessionConfig {
    pub fn from_config(config: &ImapConfig, hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            allow_insecure_auth: config.allow_insecure_auth,
            auto_logout: config.auto_logout(),
            max_literal_size: config.max_literal_size,
            announce_capabilities_after_starttls: config.announce_capabilities_after_starttls,
            sasl: SaslRegistry::with_defaults(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&ImapConfig::default(), "localhost")
    }
}

/// One request as read off the wire
enum Input {
    Request { text: String, literals: Vec<Vec<u8>> },
    /// A synchronising literal above the size limit; nothing was read
    Rejected { text: String },
    /// A non-synchronising literal above the size limit; the stream cannot
    /// be resynchronised
    Overflow,
    Eof,
}

enum Event {
    Shutdown,
    Timeout,
    Input(io::Result<Input>),
}

enum IdleEvent {
    Shutdown,
    Timeout,
    Update(Option<Delivery>),
    Input(io::Result<bool>),
}

/// How store updates are rendered for the command being processed
#[derive(Default)]
struct RenderOptions {
    /// Include UID in flag FETCH responses
    uid: bool,
    /// The command removed messages from the selected mailbox, so the view
    /// is refreshed even if the bus dropped the notification
    refresh: bool,
}

/// IMAP connection handler
pub struct ImapHandler<S> {
    reader: BufReader<ImapStream<S>>,
    out: Vec<u8>,
    session: ImapSession,
    backend: Arc<dyn Backend>,
    updates: UpdateReceiver,
    config: Arc<SessionConfig>,
    tls_acceptor: Option<TlsAcceptor>,
    cancel: CancellationToken,
    peer: String,
    last_command: Instant,
    render: RenderOptions,
}

impl<S> ImapHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        backend: Arc<dyn Backend>,
        config: Arc<SessionConfig>,
        tls_acceptor: Option<TlsAcceptor>,
        cancel: CancellationToken,
        peer: String,
    ) -> Self {
        let updates = backend.updates().subscribe();
        Self {
            reader: BufReader::new(ImapStream::Plain(stream)),
            out: Vec::new(),
            session: ImapSession::new(),
            backend,
            updates,
            config,
            tls_acceptor,
            cancel,
            peer,
            last_command: Instant::now(),
            render: RenderOptions::default(),
        }
    }

    /// Handle an IMAP session until logout, disconnect, auto-logout or
    /// server shutdown
    pub async fn handle(mut self) -> Result<()> {
        info!(session = %self.session.id, peer = %self.peer, "IMAP session started");

        let greeting = ImapResponse::greeting(&self.config.hostname, &self.capabilities());
        self.queue(greeting);
        let result = match self.flush().await {
            Ok(()) => self.serve().await,
            Err(e) => Err(e.into()),
        };

        if let Some(user) = self.session.user.take() {
            if let Err(e) = user.logout().await {
                warn!(session = %self.session.id, "Logout failed: {}", e);
            }
        }
        info!(session = %self.session.id, peer = %self.peer, "IMAP session closed");
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let deadline = self.logout_deadline();
            let max_literal = self.config.max_literal_size;

            let event = {
                let reader = &mut self.reader;
                tokio::select! {
                    _ = self.cancel.cancelled() => Event::Shutdown,
                    _ = sleep_until_deadline(deadline) => Event::Timeout,
                    input = read_request(reader, max_literal) => Event::Input(input),
                }
            };

            let input = match event {
                Event::Shutdown => {
                    self.close_with("Server shutting down").await;
                    return Ok(());
                }
                Event::Timeout => {
                    info!(session = %self.session.id, "Auto-logout after inactivity");
                    self.close_with("Autologout; idle for too long").await;
                    return Ok(());
                }
                Event::Input(input) => input?,
            };

            let (text, literals) = match input {
                Input::Eof => {
                    debug!(session = %self.session.id, "Client disconnected");
                    return Ok(());
                }
                Input::Overflow => {
                    self.close_with("Literal too large").await;
                    return Ok(());
                }
                Input::Rejected { text } => {
                    let response = match text.split(' ').next().filter(|t| !t.is_empty()) {
                        Some(tag) => ImapResponse::bad(tag, "Literal too large"),
                        None => ImapResponse::untagged_bad("Literal too large"),
                    };
                    self.queue(response);
                    self.flush().await?;
                    continue;
                }
                Input::Request { text, literals } => (text, literals),
            };

            if text.trim().is_empty() {
                continue;
            }

            let TaggedCommand { tag, command } = match ImapParser::parse_request(&text, literals) {
                Ok(request) => request,
                Err(e) => {
                    debug!(session = %self.session.id, "Parse error: {}", e.message);
                    let response = match e.tag {
                        Some(tag) => ImapResponse::bad(&tag, &e.message),
                        None => ImapResponse::untagged_bad(&e.message),
                    };
                    self.queue(response);
                    self.flush().await?;
                    continue;
                }
            };

            self.last_command = Instant::now();
            self.session.update_activity();
            debug!(session = %self.session.id, tag = %tag, command = command.name(), "Command");

            if matches!(command, ImapCommand::StartTls) {
                self.starttls(&tag).await?;
                continue;
            }

            self.render = RenderOptions::default();
            let completion = match self.dispatch(&tag, command).await {
                Ok(completion) => completion,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => Some(failure(&tag, &e)),
            };

            self.drain_updates().await;
            if let Some(line) = completion {
                self.queue(line);
            }
            self.flush().await?;

            if self.session.state == SessionState::Logout {
                return Ok(());
            }
        }
    }

    /// Run one command. `None` means no tagged completion is sent because
    /// the connection is closing.
    async fn dispatch(&mut self, tag: &str, command: ImapCommand) -> Result<Option<String>> {
        let completion = match command {
            ImapCommand::Capability => {
                let capabilities = ImapResponse::capability(&self.capabilities());
                self.queue(capabilities);
                ImapResponse::ok(tag, "CAPABILITY completed")
            }
            ImapCommand::Noop => ImapResponse::ok(tag, "NOOP completed"),
            ImapCommand::Logout => {
                self.queue(ImapResponse::bye("Logging out"));
                self.session.logout();
                ImapResponse::ok(tag, "LOGOUT completed")
            }
            // Handled before dispatch
            ImapCommand::StartTls => ImapResponse::bad(tag, "Unexpected STARTTLS"),
            ImapCommand::Login { username, password } => {
                self.check_can_authenticate()?;
                if !self.plaintext_allowed() {
                    ImapResponse::no_code(tag, "PRIVACYREQUIRED", "LOGIN is disabled before STARTTLS")
                } else {
                    self.login(tag, &username, &password, "LOGIN").await?
                }
            }
            ImapCommand::Authenticate {
                mechanism,
                initial_response,
            } => self.authenticate(tag, &mechanism, initial_response).await?,
            ImapCommand::Select { mailbox } => self.select(tag, &mailbox, false).await?,
            ImapCommand::Examine { mailbox } => self.select(tag, &mailbox, true).await?,
            ImapCommand::Create { mailbox } => {
                let user = self.require_auth()?;
                user.create_mailbox(mailbox.trim_end_matches(DELIMITER)).await?;
                ImapResponse::ok(tag, "CREATE completed")
            }
            ImapCommand::Delete { mailbox } => {
                let user = self.require_auth()?;
                user.delete_mailbox(&mailbox).await?;
                ImapResponse::ok(tag, "DELETE completed")
            }
            ImapCommand::Rename {
                old_mailbox,
                new_mailbox,
            } => {
                let user = self.require_auth()?;
                user.rename_mailbox(&old_mailbox, new_mailbox.trim_end_matches(DELIMITER))
                    .await?;
                ImapResponse::ok(tag, "RENAME completed")
            }
            ImapCommand::Subscribe { mailbox } => {
                let user = self.require_auth()?;
                user.get_mailbox(&mailbox).await?.set_subscribed(true).await?;
                ImapResponse::ok(tag, "SUBSCRIBE completed")
            }
            ImapCommand::Unsubscribe { mailbox } => {
                let user = self.require_auth()?;
                user.get_mailbox(&mailbox).await?.set_subscribed(false).await?;
                ImapResponse::ok(tag, "UNSUBSCRIBE completed")
            }
            ImapCommand::List { reference, pattern } => {
                self.list(tag, &reference, &pattern, false).await?
            }
            ImapCommand::Lsub { reference, pattern } => {
                self.list(tag, &reference, &pattern, true).await?
            }
            ImapCommand::Status { mailbox, items } => {
                let user = self.require_auth()?;
                let status = user.get_mailbox(&mailbox).await?.status(&items).await?;
                self.queue(ImapResponse::status(&mailbox, &status.items(&items)));
                ImapResponse::ok(tag, "STATUS completed")
            }
            ImapCommand::Append {
                mailbox,
                flags,
                date,
                message,
            } => self.append(tag, &mailbox, flags, date, message).await?,
            ImapCommand::Idle => return self.idle(tag).await,
            ImapCommand::Namespace => {
                self.require_auth()?;
                self.queue(ImapResponse::namespace(DELIMITER));
                ImapResponse::ok(tag, "NAMESPACE completed")
            }
            ImapCommand::Check => {
                self.require_selected()?.mailbox.check().await?;
                ImapResponse::ok(tag, "CHECK completed")
            }
            ImapCommand::Close => {
                let selected = self.require_selected()?;
                if !selected.read_only {
                    // CLOSE never fails once a mailbox is selected
                    if let Err(e) = selected.mailbox.expunge().await {
                        warn!(session = %self.session.id, "Expunge on CLOSE failed: {}", e);
                    }
                }
                self.session.close_mailbox();
                ImapResponse::ok(tag, "CLOSE completed")
            }
            ImapCommand::Unselect => {
                self.require_selected()?;
                self.session.close_mailbox();
                ImapResponse::ok(tag, "UNSELECT completed")
            }
            ImapCommand::Expunge => {
                let selected = self.require_selected()?;
                if selected.read_only {
                    read_only(tag)
                } else {
                    selected.mailbox.expunge().await?;
                    self.render.refresh = true;
                    ImapResponse::ok(tag, "EXPUNGE completed")
                }
            }
            ImapCommand::Fetch {
                sequence,
                items,
                uid,
            } => {
                self.render.uid = uid;
                self.fetch(tag, &sequence, &items, uid).await?
            }
            ImapCommand::Search { criteria, uid } => {
                self.render.uid = uid;
                self.search(tag, &criteria, uid).await?
            }
            ImapCommand::Store {
                sequence,
                flags,
                uid,
            } => {
                self.render.uid = uid;
                self.store(tag, &sequence, flags, uid).await?
            }
            ImapCommand::Copy {
                sequence,
                mailbox,
                uid,
            } => {
                self.render.uid = uid;
                self.copy(tag, &sequence, &mailbox, uid, false).await?
            }
            ImapCommand::Move {
                sequence,
                mailbox,
                uid,
            } => {
                self.render.uid = uid;
                self.copy(tag, &sequence, &mailbox, uid, true).await?
            }
        };
        Ok(Some(completion))
    }

    // ---------------------------------------------------------------------
    // Transport and authentication
    // ---------------------------------------------------------------------

    fn capabilities(&self) -> String {
        let mut caps = vec!["IMAP4rev1", "LITERAL+", "SASL-IR"];
        if !self.session.tls_active && self.tls_acceptor.is_some() {
            caps.push("STARTTLS");
        }

        let mut auth = Vec::new();
        if self.session.is_authenticated() {
            caps.extend(["IDLE", "MOVE", "NAMESPACE", "UIDPLUS", "UNSELECT"]);
        } else {
            if !self.plaintext_allowed() {
                caps.push("LOGINDISABLED");
            }
            auth.extend(
                self.config
                    .sasl
                    .available(self.plaintext_allowed())
                    .map(|name| format!("AUTH={}", name)),
            );
        }

        let mut line = caps.join(" ");
        for mechanism in auth {
            line.push(' ');
            line.push_str(&mechanism);
        }
        line
    }

    fn plaintext_allowed(&self) -> bool {
        self.session.tls_active || self.config.allow_insecure_auth
    }

    fn check_can_authenticate(&self) -> Result<()> {
        if self.session.state != SessionState::NotAuthenticated {
            return Err(Error::InvalidState("Already authenticated".to_string()));
        }
        Ok(())
    }

    async fn starttls(&mut self, tag: &str) -> Result<()> {
        if self.session.is_selected() {
            self.queue(ImapResponse::no_code(
                tag,
                "CLIENTBUG",
                "STARTTLS is not permitted with a mailbox selected",
            ));
            return Ok(self.flush().await?);
        }

        let acceptor = match (&self.tls_acceptor, self.session.tls_active) {
            (_, true) => {
                self.queue(ImapResponse::no_code(tag, "CLIENTBUG", "TLS is already active"));
                return Ok(self.flush().await?);
            }
            (None, false) => {
                self.queue(ImapResponse::no_code(tag, "CANNOT", "STARTTLS is not available"));
                return Ok(self.flush().await?);
            }
            (Some(acceptor), false) => acceptor.clone(),
        };

        self.queue(ImapResponse::ok(tag, "Begin TLS negotiation now"));
        self.flush().await?;

        // Anything the client pipelined after STARTTLS is discarded with the
        // plaintext buffer.
        let reader = std::mem::replace(&mut self.reader, BufReader::new(ImapStream::Upgrading));
        let stream = reader
            .into_inner()
            .upgrade(&acceptor)
            .await
            .map_err(|e| Error::Tls(format!("TLS handshake failed: {}", e)))?;
        self.reader = BufReader::new(stream);
        self.session.tls_active = true;
        info!(session = %self.session.id, "TLS established");

        if self.config.announce_capabilities_after_starttls {
            let capabilities = ImapResponse::capability(&self.capabilities());
            self.queue(capabilities);
            self.flush().await?;
        }
        Ok(())
    }

    async fn login(
        &mut self,
        tag: &str,
        username: &str,
        password: &str,
        command: &str,
    ) -> Result<String> {
        match self.backend.login(username, password).await {
            Ok(user) => {
                info!(session = %self.session.id, username = %username, "User authenticated");
                self.session.authenticate(user);
                self.last_command = Instant::now();
                Ok(ImapResponse::ok_code(
                    tag,
                    &format!("CAPABILITY {}", self.capabilities()),
                    &format!("{} completed", command),
                ))
            }
            Err(e) => {
                warn!(session = %self.session.id, username = %username, "Authentication failed");
                Err(e)
            }
        }
    }

    async fn authenticate(
        &mut self,
        tag: &str,
        mechanism: &str,
        initial_response: Option<String>,
    ) -> Result<String> {
        self.check_can_authenticate()?;

        let mechanism = self.config.sasl.get(mechanism).ok_or_else(|| {
            Error::Unsupported(format!("Authentication mechanism {}", mechanism))
        })?;
        if mechanism.is_plaintext() && !self.plaintext_allowed() {
            return Ok(ImapResponse::no_code(
                tag,
                "PRIVACYREQUIRED",
                "Plaintext authentication is disabled before STARTTLS",
            ));
        }

        let mut exchange = mechanism.start();
        let mut pending = initial_response;
        let mut challenge = Vec::new();

        let credentials = loop {
            let line = match pending.take() {
                Some(line) => line,
                None => {
                    self.queue(ImapResponse::continue_with(&encode_challenge(&challenge)));
                    self.flush().await?;
                    self.read_line()
                        .await?
                        .ok_or_else(|| Error::Io(io::ErrorKind::UnexpectedEof.into()))?
                }
            };

            if line.trim() == "*" {
                return Ok(ImapResponse::bad(tag, "AUTHENTICATE aborted"));
            }

            let step = decode_response(&line).and_then(|response| exchange.step(&response));
            match step {
                Ok(SaslStep::Challenge(next)) => challenge = next,
                Ok(SaslStep::Done(credentials)) => break credentials,
                Err(e) => {
                    warn!(
                        session = %self.session.id,
                        mechanism = mechanism.name(),
                        "SASL exchange failed: {}",
                        e
                    );
                    return Err(e);
                }
            }
        };

        self.login(tag, &credentials.username, &credentials.password, "AUTHENTICATE")
            .await
    }

    // ---------------------------------------------------------------------
    // Mailbox commands
    // ---------------------------------------------------------------------

    fn require_auth(&self) -> Result<Arc<dyn User>> {
        match &self.session.user {
            Some(user) if self.session.is_authenticated() => Ok(user.clone()),
            _ => Err(Error::InvalidState("Not authenticated".to_string())),
        }
    }

    fn require_selected(&self) -> Result<SelectedMailbox> {
        self.require_auth()?;
        self.session
            .selected
            .clone()
            .ok_or_else(|| Error::InvalidState("No mailbox selected".to_string()))
    }

    async fn select(&mut self, tag: &str, name: &str, read_only: bool) -> Result<String> {
        let user = self.require_auth()?;

        // A failed SELECT leaves no mailbox selected.
        self.session.close_mailbox();
        self.drain_updates().await;

        let mailbox = user.get_mailbox(name).await?;
        // Listed before the status so UIDNEXT is never below a known UID
        let known: Vec<KnownMessage> = mailbox
            .list_messages(true, &SequenceSet::Range(1, u32::MAX))
            .await?
            .iter()
            .map(KnownMessage::from)
            .collect();
        let status = mailbox
            .status(&[StatusItem::Recent, StatusItem::UidNext, StatusItem::UidValidity])
            .await?;
        let first_unseen = known.iter().position(|m| !flags::contains(&m.flags, SEEN));

        self.queue(ImapResponse::mailbox_flags(&status.flags));
        self.queue(ImapResponse::exists(known.len() as u32));
        self.queue(ImapResponse::recent(status.recent.unwrap_or(0)));
        if let Some(i) = first_unseen {
            self.queue(ImapResponse::unseen(i as u32 + 1));
        }
        if read_only {
            self.queue(ImapResponse::permanent_flags(&[]));
        } else {
            self.queue(ImapResponse::permanent_flags(&status.permanent_flags));
        }
        self.queue(ImapResponse::uid_validity(status.uid_validity.unwrap_or(0)));
        self.queue(ImapResponse::uid_next(status.uid_next.unwrap_or(1)));

        self.session.select(mailbox, read_only, known);
        debug!(session = %self.session.id, mailbox = %name, read_only, "Mailbox selected");

        Ok(if read_only {
            ImapResponse::ok_code(tag, "READ-ONLY", "EXAMINE completed")
        } else {
            ImapResponse::ok_code(tag, "READ-WRITE", "SELECT completed")
        })
    }

    async fn list(
        &mut self,
        tag: &str,
        reference: &str,
        pattern: &str,
        subscribed: bool,
    ) -> Result<String> {
        let user = self.require_auth()?;
        let command = if subscribed { "LSUB" } else { "LIST" };

        if pattern.is_empty() && !subscribed {
            // Hierarchy delimiter query
            self.queue(ImapResponse::list(&["\\Noselect".to_string()], DELIMITER, ""));
            return Ok(ImapResponse::ok(tag, "LIST completed"));
        }

        let pattern = format!("{}{}", reference, pattern);
        let mut infos = Vec::new();
        for mailbox in user.list_mailboxes(subscribed).await? {
            let info = mailbox.info().await?;
            if list_matches(&pattern, &info.name) {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));

        for info in infos {
            let line = if subscribed {
                ImapResponse::lsub(&info.attributes, &info.delimiter, &info.name)
            } else {
                ImapResponse::list(&info.attributes, &info.delimiter, &info.name)
            };
            self.queue(line);
        }
        Ok(ImapResponse::ok(tag, &format!("{} completed", command)))
    }

    async fn append(
        &mut self,
        tag: &str,
        name: &str,
        flags: Vec<String>,
        date: Option<DateTime<Utc>>,
        message: Vec<u8>,
    ) -> Result<String> {
        let user = self.require_auth()?;
        let mailbox = match user.get_mailbox(name).await {
            Ok(mailbox) => mailbox,
            Err(Error::NotFound(_)) => return Ok(try_create(tag)),
            Err(e) => return Err(e),
        };

        let flags = flags.into_iter().filter(|f| f != RECENT).collect();
        let uid = match mailbox.create_message(flags, date, message).await {
            Ok(uid) => uid,
            // Renamed or deleted since the lookup
            Err(Error::NotFound(_)) => return Ok(try_create(tag)),
            Err(e) => return Err(e),
        };
        let uid_validity = mailbox
            .status(&[StatusItem::UidValidity])
            .await?
            .uid_validity
            .unwrap_or(0);

        Ok(ImapResponse::ok_code(
            tag,
            &ImapResponse::appenduid(uid_validity, uid),
            "APPEND completed",
        ))
    }

    async fn idle(&mut self, tag: &str) -> Result<Option<String>> {
        self.require_auth()?;

        self.queue(ImapResponse::continue_with("idling"));
        self.drain_updates().await;
        self.flush().await?;

        let mut bus_open = true;
        loop {
            let deadline = self.logout_deadline();
            let event = {
                let reader = &mut self.reader;
                let updates = &mut self.updates;
                tokio::select! {
                    _ = self.cancel.cancelled() => IdleEvent::Shutdown,
                    _ = sleep_until_deadline(deadline) => IdleEvent::Timeout,
                    delivery = updates.recv(), if bus_open => IdleEvent::Update(delivery),
                    // fill_buf consumes nothing, so losing this race to
                    // another branch drops no client input
                    ready = async { reader.fill_buf().await.map(|buf| buf.is_empty()) } => {
                        IdleEvent::Input(ready)
                    }
                }
            };

            match event {
                IdleEvent::Shutdown => {
                    self.close_with("Server shutting down").await;
                    return Ok(None);
                }
                IdleEvent::Timeout => {
                    info!(session = %self.session.id, "Auto-logout during IDLE");
                    self.close_with("Autologout; idle for too long").await;
                    return Ok(None);
                }
                IdleEvent::Update(Some(delivery)) => {
                    self.render.refresh |= self.concerns_selected(&delivery);
                    self.drain_updates().await;
                    self.flush().await?;
                }
                IdleEvent::Update(None) => bus_open = false,
                IdleEvent::Input(ready) => {
                    if ready? {
                        debug!(session = %self.session.id, "Client disconnected during IDLE");
                        self.session.logout();
                        return Ok(None);
                    }
                    let line = self.read_line().await?.unwrap_or_default();
                    return Ok(Some(if line.trim().eq_ignore_ascii_case("DONE") {
                        ImapResponse::ok(tag, "IDLE terminated")
                    } else {
                        ImapResponse::bad(tag, "Expected DONE")
                    }));
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Message commands
    // ---------------------------------------------------------------------

    async fn fetch(
        &mut self,
        tag: &str,
        sequence: &SequenceSet,
        items: &[FetchItem],
        uid: bool,
    ) -> Result<String> {
        let selected = self.require_selected()?;

        let mut items = FetchItem::expand(items);
        if uid && !items.contains(&FetchItem::Uid) {
            items.insert(0, FetchItem::Uid);
        }

        let Some(set) = selected.uid_set(uid, sequence) else {
            return Ok(ImapResponse::ok(tag, &completed("FETCH", uid)));
        };
        let mut entries = selected.mailbox.list_messages(true, &set).await?;
        // Messages the client has not been told about yet have no sequence
        // number; they are announced after this command.
        entries.retain_mut(|entry| match selected.seq_of(entry.message.uid) {
            Some(seq) => {
                entry.seq = seq;
                true
            }
            None => false,
        });

        if !selected.read_only && items.iter().any(FetchItem::sets_seen) {
            let unseen: Vec<u32> = entries
                .iter()
                .filter(|e| !e.message.has_flag(SEEN))
                .map(|e| e.message.uid)
                .collect();
            if let Some(set) = SequenceSet::parse(&compact_numbers(&unseen)) {
                let changes = selected
                    .mailbox
                    .update_messages_flags(true, &set, FlagsOp::Add, &[SEEN.to_string()])
                    .await?;
                for change in changes {
                    // Reported by this FETCH response
                    if let Some(view) = self.session.selected.as_mut() {
                        view.record_flags(change.uid, &change.flags);
                    }
                    if let Some(entry) = entries.iter_mut().find(|e| e.message.uid == change.uid) {
                        entry.message.flags = change.flags;
                    }
                }
                if !items.contains(&FetchItem::Flags) {
                    items.push(FetchItem::Flags);
                }
            }
        }

        for entry in &entries {
            let response = render_fetch(entry, &items);
            self.queue(response);
        }

        Ok(ImapResponse::ok(tag, &completed("FETCH", uid)))
    }

    async fn search(&mut self, tag: &str, criteria: &SearchCriteria, uid: bool) -> Result<String> {
        let selected = self.require_selected()?;
        let uids = selected.mailbox.search_messages(true, criteria).await?;
        let ids: Vec<u32> = if uid {
            uids
        } else {
            uids.into_iter().filter_map(|u| selected.seq_of(u)).collect()
        };
        self.queue(ImapResponse::search(&ids));
        Ok(ImapResponse::ok(tag, &completed("SEARCH", uid)))
    }

    async fn store(
        &mut self,
        tag: &str,
        sequence: &SequenceSet,
        flags: StoreFlags,
        uid: bool,
    ) -> Result<String> {
        let selected = self.require_selected()?;
        if selected.read_only {
            return Ok(read_only(tag));
        }

        let Some(set) = selected.uid_set(uid, sequence) else {
            return Ok(ImapResponse::ok(tag, &completed("STORE", uid)));
        };

        // \Recent is maintained by the server only
        let operand: Vec<String> = flags.flags.into_iter().filter(|f| f != RECENT).collect();
        let changes = selected
            .mailbox
            .update_messages_flags(true, &set, flags.operation, &operand)
            .await?;

        // Rendered from the store's answer, not from the update bus. The
        // bus echo then finds nothing new.
        let mut lines = Vec::with_capacity(changes.len());
        if let Some(view) = self.session.selected.as_mut() {
            for change in &changes {
                let Some(seq) = view.record_flags(change.uid, &change.flags) else {
                    continue;
                };
                if !flags.silent {
                    let uid = uid.then_some(change.uid);
                    lines.push(ImapResponse::fetch_flags(seq, uid, &change.flags));
                }
            }
        }
        for line in lines {
            self.queue(line);
        }
        Ok(ImapResponse::ok(tag, &completed("STORE", uid)))
    }

    async fn copy(
        &mut self,
        tag: &str,
        sequence: &SequenceSet,
        dest: &str,
        uid: bool,
        remove: bool,
    ) -> Result<String> {
        let selected = self.require_selected()?;
        let command = if remove { "MOVE" } else { "COPY" };
        if remove && selected.read_only {
            return Ok(read_only(tag));
        }

        let Some(set) = selected.uid_set(uid, sequence) else {
            return Ok(ImapResponse::ok(tag, &completed(command, uid)));
        };

        let result = if remove {
            self.render.refresh = true;
            selected.mailbox.move_messages(true, &set, dest).await
        } else {
            selected.mailbox.copy_messages(true, &set, dest).await
        };
        let uids = match result {
            Ok(uids) => uids,
            Err(Error::NotFound(_)) => return Ok(try_create(tag)),
            Err(e) => return Err(e),
        };

        if uids.dest.is_empty() {
            return Ok(ImapResponse::ok(tag, &completed(command, uid)));
        }

        let code = ImapResponse::copyuid(
            uids.uid_validity,
            &compact_numbers(&uids.source),
            &compact_numbers(&uids.dest),
        );
        if remove {
            // EXPUNGE responses follow, so the code goes out untagged first
            self.queue(format!("* OK [{}] Moved\r\n", code));
            Ok(ImapResponse::ok(tag, &completed(command, uid)))
        } else {
            Ok(ImapResponse::ok_code(tag, &code, &completed(command, uid)))
        }
    }

    // ---------------------------------------------------------------------
    // Store updates
    // ---------------------------------------------------------------------

    /// Consume every update already queued for this session and, if any of
    /// them touched the selected mailbox, tell the client what changed.
    async fn drain_updates(&mut self) {
        let mut stale = std::mem::take(&mut self.render.refresh);
        while let Some(delivery) = self.updates.try_recv() {
            stale |= self.concerns_selected(&delivery);
        }
        if stale {
            self.sync_selected().await;
        }
    }

    /// Updates only say that something changed; what the client is told
    /// comes from the store itself.
    fn concerns_selected(&self, delivery: &Delivery) -> bool {
        let (Some(user), Some(selected)) = (&self.session.user, &self.session.selected) else {
            return false;
        };
        match delivery {
            Delivery::Update(update) => {
                update.username == user.username() && update.mailbox == selected.name()
            }
            Delivery::Lagged(missed) => {
                warn!(session = %self.session.id, missed, "Update bus overflow, resynchronising");
                true
            }
        }
    }

    /// Diff the client's view of the selected mailbox against the store
    async fn sync_selected(&mut self) {
        let Some(mailbox) = self.session.selected.as_ref().map(|s| s.mailbox.clone()) else {
            return;
        };
        let current = match mailbox.list_messages(true, &SequenceSet::Range(1, u32::MAX)).await {
            Ok(current) => current,
            Err(e) => {
                warn!(session = %self.session.id, "Resync failed: {}", e);
                return;
            }
        };

        let with_uid = self.render.uid;
        let lines = match self.session.selected.as_mut() {
            Some(selected) => selected.reconcile(&current, with_uid),
            None => return,
        };
        for line in lines {
            self.queue(line);
        }
    }

    // ---------------------------------------------------------------------
    // I/O helpers
    // ---------------------------------------------------------------------

    fn logout_deadline(&self) -> Option<Instant> {
        if !self.session.is_authenticated() {
            return None;
        }
        self.config.auto_logout.map(|after| self.last_command + after)
    }

    fn queue(&mut self, response: impl AsRef<[u8]>) {
        self.out.extend_from_slice(response.as_ref());
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.reader.write_all(&self.out).await?;
        self.reader.flush().await?;
        debug!(session = %self.session.id, bytes = self.out.len(), "Response sent");
        self.out.clear();
        Ok(())
    }

    async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut raw = Vec::new();
        if self.reader.read_until(b'\n', &mut raw).await? == 0 {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&raw)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        ))
    }

    /// Say goodbye and close the transport. Write errors are ignored since
    /// the connection is going away regardless.
    async fn close_with(&mut self, message: &str) {
        self.out.clear();
        self.queue(ImapResponse::bye(message));
        if let Err(e) = self.flush().await {
            debug!(session = %self.session.id, "BYE not delivered: {}", e);
        }
        let _ = self.reader.shutdown().await;
        self.session.logout();
    }
}

/// Read one request line plus any literals it announces
async fn read_request<R>(reader: &mut R, max_literal: usize) -> io::Result<Input>
where
    R: AsyncBufRead + AsyncWrite + Unpin,
{
    let mut text = String::new();
    let mut literals = Vec::new();

    loop {
        let mut raw = Vec::new();
        if reader.read_until(b'\n', &mut raw).await? == 0 {
            return Ok(Input::Eof);
        }
        let fragment = String::from_utf8_lossy(&raw);
        let fragment = fragment.trim_end_matches(['\r', '\n']);
        text.push_str(fragment);

        let Some((len, non_sync)) = literal_length(fragment) else {
            return Ok(Input::Request { text, literals });
        };
        if len > max_literal {
            return Ok(if non_sync {
                Input::Overflow
            } else {
                Input::Rejected { text }
            });
        }
        if !non_sync {
            reader
                .write_all(ImapResponse::continue_with("Ready for literal data").as_bytes())
                .await?;
            reader.flush().await?;
        }

        let mut data = vec![0; len];
        reader.read_exact(&mut data).await?;
        literals.push(data);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Tagged NO for a failed command
fn failure(tag: &str, error: &Error) -> String {
    ImapResponse::no_code(tag, error.response_code(), &error.client_message())
}

fn read_only(tag: &str) -> String {
    ImapResponse::no_code(tag, "READ-ONLY", "Mailbox is read-only")
}

fn try_create(tag: &str) -> String {
    ImapResponse::no_code(tag, "TRYCREATE", "Destination mailbox does not exist")
}

fn completed(command: &str, uid: bool) -> String {
    if uid {
        format!("UID {} completed", command)
    } else {
        format!("{} completed", command)
    }
}

fn render_fetch(entry: &MessageEntry, items: &[FetchItem]) -> Vec<u8> {
    let msg = &entry.message;
    let mut fetch = FetchResponse::new(entry.seq);
    for item in items {
        match item {
            FetchItem::Flags => {
                fetch.item("FLAGS", &ImapResponse::format_flags(&msg.flags));
            }
            FetchItem::Uid => {
                fetch.item("UID", &msg.uid.to_string());
            }
            FetchItem::InternalDate => {
                fetch.item("INTERNALDATE", &ImapResponse::format_internal_date(&msg.date));
            }
            FetchItem::Rfc822Size => {
                fetch.item("RFC822.SIZE", &msg.size.to_string());
            }
            FetchItem::Rfc822 => {
                fetch.literal("RFC822", &msg.body);
            }
            FetchItem::Rfc822Header => {
                fetch.literal("RFC822.HEADER", msg.header());
            }
            FetchItem::Rfc822Text => {
                fetch.literal("RFC822.TEXT", msg.text());
            }
            FetchItem::Body { section, .. } => {
                let data = match section {
                    Section::Full => &msg.body[..],
                    Section::Header => msg.header(),
                    Section::Text => msg.text(),
                };
                fetch.literal(&format!("BODY[{}]", section.as_str()), data);
            }
            // Expanded before rendering
            FetchItem::All | FetchItem::Fast | FetchItem::Full => {}
        }
    }
    fetch.finish()
}

/// Match a mailbox name against a LIST pattern. `*` matches anything, `%`
/// anything but the hierarchy delimiter. INBOX matches case-insensitively.
fn list_matches(pattern: &str, name: &str) -> bool {
    wildcard_match(pattern.as_bytes(), name.as_bytes())
        || (name == INBOX && wildcard_match(pattern.to_ascii_uppercase().as_bytes(), name.as_bytes()))
}

fn wildcard_match(pattern: &[u8], name: &[u8]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((b'*', rest)) => (0..=name.len()).any(|i| wildcard_match(rest, &name[i..])),
        Some((b'%', rest)) => (0..=name.len())
            .take_while(|&i| i == 0 || !DELIMITER.as_bytes().contains(&name[i - 1]))
            .any(|i| wildcard_match(rest, &name[i..])),
        Some((c, rest)) => name.first() == Some(c) && wildcard_match(rest, &name[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::build_acceptor;
    use cormorant_common::config::Provisioning;
    use cormorant_storage::MemoryBackend;
    use pretty_assertions::assert_eq;
    use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_rustls::TlsConnector;

    struct TestClient<S> {
        stream: BufReader<S>,
    }

    impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
        fn new(stream: S) -> Self {
            Self {
                stream: BufReader::new(stream),
            }
        }

        /// Next line without CRLF, `None` at end of stream
        async fn line(&mut self) -> Option<String> {
            let mut line = String::new();
            if self.stream.read_line(&mut line).await.unwrap() == 0 {
                return None;
            }
            Some(line.trim_end_matches(['\r', '\n']).to_string())
        }

        async fn send(&mut self, data: &str) {
            self.stream.write_all(data.as_bytes()).await.unwrap();
            self.stream.flush().await.unwrap();
        }

        async fn until_tagged(&mut self, tag: &str) -> Vec<String> {
            let prefix = format!("{} ", tag);
            let mut lines = Vec::new();
            loop {
                let line = self.line().await.expect("connection closed");
                let done = line.starts_with(&prefix);
                lines.push(line);
                if done {
                    return lines;
                }
            }
        }

        async fn command(&mut self, tag: &str, command: &str) -> Vec<String> {
            self.send(&format!("{} {}\r\n", tag, command)).await;
            self.until_tagged(tag).await
        }

        /// The tagged completion of a command
        async fn status(&mut self, tag: &str, command: &str) -> String {
            self.command(tag, command).await.pop().unwrap()
        }
    }

    fn insecure() -> SessionConfig {
        SessionConfig {
            allow_insecure_auth: true,
            ..SessionConfig::default()
        }
    }

    fn test_acceptor() -> (TlsAcceptor, CertificateDer<'static>) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.cert.der().to_vec());
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let acceptor = build_acceptor(vec![cert_der.clone()], key_der.into()).unwrap();
        (acceptor, cert_der)
    }

    fn spawn_handler(
        backend: Arc<MemoryBackend>,
        config: SessionConfig,
        acceptor: Option<TlsAcceptor>,
    ) -> (TestClient<DuplexStream>, JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handler = ImapHandler::new(
            server,
            backend,
            Arc::new(config),
            acceptor,
            CancellationToken::new(),
            "test".to_string(),
        );
        (TestClient::new(client), tokio::spawn(handler.handle()))
    }

    fn backend() -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend::new(Provisioning::Auto, 64))
    }

    async fn connect(config: SessionConfig) -> TestClient<DuplexStream> {
        let (mut client, _) = spawn_handler(backend(), config, None);
        client.line().await.unwrap();
        client
    }

    async fn logged_in(backend: &Arc<MemoryBackend>) -> TestClient<DuplexStream> {
        let (mut client, _) = spawn_handler(backend.clone(), insecure(), None);
        client.line().await.unwrap();
        let status = client.status("L1", "LOGIN alice secret").await;
        assert!(status.starts_with("L1 OK"), "{}", status);
        client
    }

    #[tokio::test]
    async fn test_greeting_requires_tls() {
        let (acceptor, _) = test_acceptor();
        let (mut client, _) = spawn_handler(backend(), SessionConfig::default(), Some(acceptor));

        let greeting = client.line().await.unwrap();
        assert!(greeting.starts_with(
            "* OK [CAPABILITY IMAP4rev1 LITERAL+ SASL-IR STARTTLS LOGINDISABLED]"
        ));

        let status = client.status("A1", "LOGIN alice secret").await;
        assert!(status.starts_with("A1 NO [PRIVACYREQUIRED]"), "{}", status);
        let status = client.status("A2", "AUTHENTICATE PLAIN").await;
        assert!(status.starts_with("A2 NO [PRIVACYREQUIRED]"), "{}", status);
    }

    #[tokio::test]
    async fn test_capability_without_tls_requirement() {
        let mut client = connect(insecure()).await;
        let lines = client.command("A1", "CAPABILITY").await;
        assert_eq!(
            lines,
            vec![
                "* CAPABILITY IMAP4rev1 LITERAL+ SASL-IR AUTH=PLAIN".to_string(),
                "A1 OK CAPABILITY completed".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_starttls_twice() {
        let (acceptor, cert_der) = test_acceptor();
        let (mut client, _) = spawn_handler(backend(), SessionConfig::default(), Some(acceptor));
        client.line().await.unwrap();

        let status = client.status("A1", "STARTTLS").await;
        assert_eq!(status, "A1 OK Begin TLS negotiation now");

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let stream = client.stream.into_inner();
        let tls = connector
            .connect(ServerName::try_from("localhost").unwrap(), stream)
            .await
            .unwrap();
        let mut client = TestClient::new(tls);

        // Capabilities are pushed after the handshake
        assert_eq!(
            client.line().await.unwrap(),
            "* CAPABILITY IMAP4rev1 LITERAL+ SASL-IR AUTH=PLAIN"
        );

        let status = client.status("A2", "STARTTLS").await;
        assert!(status.starts_with("A2 NO"), "{}", status);

        let status = client.status("A3", "LOGIN alice secret").await;
        assert!(status.starts_with("A3 OK"), "{}", status);
    }

    #[tokio::test]
    async fn test_starttls_without_certificate() {
        let mut client = connect(insecure()).await;
        let status = client.status("A1", "STARTTLS").await;
        assert_eq!(status, "A1 NO [CANNOT] STARTTLS is not available");
    }

    #[tokio::test]
    async fn test_login_twice() {
        let backend = backend();
        let mut client = logged_in(&backend).await;
        let status = client.status("A2", "LOGIN alice secret").await;
        assert!(status.starts_with("A2 NO"), "{}", status);
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let backend = backend();
        backend.add_user("alice", "secret").await.unwrap();
        let (mut client, _) = spawn_handler(backend, insecure(), None);
        client.line().await.unwrap();

        let status = client.status("A1", "LOGIN alice wrong").await;
        assert_eq!(status, "A1 NO [AUTHENTICATIONFAILED] Authentication failed");

        // Still usable afterwards
        let status = client.status("A2", "LOGIN alice secret").await;
        assert!(status.starts_with("A2 OK [CAPABILITY IMAP4rev1"), "{}", status);
    }

    #[tokio::test]
    async fn test_commands_require_authentication() {
        let mut client = connect(insecure()).await;
        let status = client.status("A1", "SELECT INBOX").await;
        assert_eq!(status, "A1 NO [CLIENTBUG] Invalid state: Not authenticated");
        let status = client.status("A2", "FETCH 1 FLAGS").await;
        assert!(status.starts_with("A2 NO"), "{}", status);
    }

    #[tokio::test]
    async fn test_authenticate_plain() {
        let mut client = connect(insecure()).await;

        client.send("A1 AUTHENTICATE PLAIN\r\n").await;
        assert_eq!(client.line().await.unwrap(), "+ ");
        client.send("AHVzZXJuYW1lAHBhc3N3b3Jk\r\n").await;
        let status = client.until_tagged("A1").await.pop().unwrap();
        assert!(
            status.starts_with("A1 OK [CAPABILITY") && status.ends_with("AUTHENTICATE completed"),
            "{}",
            status
        );
    }

    #[tokio::test]
    async fn test_authenticate_plain_initial_response() {
        let mut client = connect(insecure()).await;
        let lines = client
            .command("A1", "AUTHENTICATE PLAIN AHVzZXJuYW1lAHBhc3N3b3Jk")
            .await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("A1 OK"), "{}", lines[0]);
    }

    #[tokio::test]
    async fn test_authenticate_plain_wrong_password() {
        let backend = backend();
        backend.add_user("username", "other").await.unwrap();
        let (mut client, _) = spawn_handler(backend, insecure(), None);
        client.line().await.unwrap();

        let status = client
            .status("A1", "AUTHENTICATE PLAIN AHVzZXJuYW1lAHBhc3N3b3Jk")
            .await;
        assert_eq!(status, "A1 NO [AUTHENTICATIONFAILED] Authentication failed");
    }

    #[tokio::test]
    async fn test_authenticate_plain_invalid_payload() {
        let mut client = connect(insecure()).await;

        client.send("A1 AUTHENTICATE PLAIN\r\n").await;
        assert_eq!(client.line().await.unwrap(), "+ ");
        client.send("BHVzZXJuYW1lAHBhc3N3b6Jk\r\n").await;
        let status = client.until_tagged("A1").await.pop().unwrap();
        assert_eq!(status, "A1 NO [AUTHENTICATIONFAILED] Authentication failed");

        let status = client.status("A2", "NOOP").await;
        assert_eq!(status, "A2 OK NOOP completed");
    }

    #[tokio::test]
    async fn test_authenticate_abort() {
        let mut client = connect(insecure()).await;
        client.send("A1 AUTHENTICATE PLAIN\r\n").await;
        assert_eq!(client.line().await.unwrap(), "+ ");
        client.send("*\r\n").await;
        let status = client.until_tagged("A1").await.pop().unwrap();
        assert_eq!(status, "A1 BAD AUTHENTICATE aborted");
    }

    #[tokio::test]
    async fn test_authenticate_unknown_mechanism() {
        let mut client = connect(insecure()).await;
        let lines = client.command("A1", "AUTHENTICATE CRAM-MD5").await;
        assert_eq!(lines.len(), 1, "no continuation expected");
        assert!(lines[0].starts_with("A1 NO [CANNOT]"), "{}", lines[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_logout_closes_connection() {
        let config = SessionConfig {
            auto_logout: Some(Duration::from_secs(60)),
            ..insecure()
        };
        let (mut client, handle) = spawn_handler(backend(), config, None);
        client.line().await.unwrap();
        let status = client.status("A1", "LOGIN alice secret").await;
        assert!(status.starts_with("A1 OK"));

        // No further input; the paused clock advances to the deadline
        let bye = client.line().await.unwrap();
        assert_eq!(bye, "* BYE Autologout; idle for too long");
        assert_eq!(client.line().await, None);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_logout_waits_for_login() {
        let config = SessionConfig {
            auto_logout: Some(Duration::from_secs(60)),
            ..insecure()
        };
        let (mut client, _) = spawn_handler(backend(), config, None);
        client.line().await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(client.status("A1", "NOOP").await, "A1 OK NOOP completed");

        let status = client.status("A2", "LOGIN alice secret").await;
        assert!(status.starts_with("A2 OK"), "{}", status);
        assert_eq!(client.line().await.unwrap(), "* BYE Autologout; idle for too long");
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_command_resets_auto_logout() {
        let config = SessionConfig {
            auto_logout: Some(Duration::from_secs(60)),
            ..insecure()
        };
        let (mut client, _) = spawn_handler(backend(), config, None);
        client.line().await.unwrap();
        let status = client.status("A1", "LOGIN alice secret").await;
        assert!(status.starts_with("A1 OK"));

        // 80s in total, past the deadline set by LOGIN
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(client.status("A2", "NOOP").await, "A2 OK NOOP completed");
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(client.status("A3", "NOOP").await, "A3 OK NOOP completed");

        let quiet_since = Instant::now();
        assert_eq!(client.line().await.unwrap(), "* BYE Autologout; idle for too long");
        assert!(quiet_since.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_select_fetch_and_seen() {
        let backend = backend();
        let mut client = logged_in(&backend).await;

        let lines = client.command("A2", "SELECT INBOX").await;
        assert!(lines.contains(&"* 1 EXISTS".to_string()));
        assert!(lines.contains(&"* OK [UNSEEN 1] First unseen".to_string()));
        assert!(lines.iter().any(|l| l.starts_with("* OK [UIDVALIDITY ")));
        assert!(lines.contains(&"* OK [UIDNEXT 2] Predicted next UID".to_string()));
        assert_eq!(lines.last().unwrap(), "A2 OK [READ-WRITE] SELECT completed");

        let lines = client.command("A3", "FETCH 1 (FLAGS UID)").await;
        assert_eq!(
            lines,
            vec![
                "* 1 FETCH (FLAGS () UID 1)".to_string(),
                "A3 OK FETCH completed".to_string(),
            ]
        );

        let lines = client.command("A4", "FETCH 1 BODY[TEXT]").await;
        assert_eq!(lines[0], "* 1 FETCH (BODY[TEXT] {17}");
        assert_eq!(lines[1], "Hi alice there :) FLAGS (\\Seen))");
        assert_eq!(lines.last().unwrap(), "A4 OK FETCH completed");

        let lines = client.command("A5", "UID FETCH 1 FLAGS").await;
        assert_eq!(lines[0], "* 1 FETCH (UID 1 FLAGS (\\Seen))");
    }

    #[tokio::test]
    async fn test_store_and_expunge() {
        let backend = backend();
        let mut client = logged_in(&backend).await;
        client.command("A2", "SELECT INBOX").await;

        let lines = client.command("A3", "STORE 1 +FLAGS (\\Deleted)").await;
        assert_eq!(
            lines,
            vec![
                "* 1 FETCH (FLAGS (\\Deleted))".to_string(),
                "A3 OK STORE completed".to_string(),
            ]
        );

        let lines = client.command("A4", "UID STORE 1 -FLAGS.SILENT (\\Deleted)").await;
        assert_eq!(lines, vec!["A4 OK UID STORE completed".to_string()]);

        let lines = client.command("A5", "UID STORE 1 +FLAGS (\\Deleted \\Recent)").await;
        assert_eq!(lines[0], "* 1 FETCH (UID 1 FLAGS (\\Deleted))");

        let lines = client.command("A6", "EXPUNGE").await;
        assert_eq!(
            lines,
            vec!["* 1 EXPUNGE".to_string(), "A6 OK EXPUNGE completed".to_string()]
        );

        let lines = client.command("A7", "SEARCH ALL").await;
        assert_eq!(lines[0], "* SEARCH");
    }

    #[tokio::test]
    async fn test_examine_is_read_only() {
        let backend = backend();
        let mut client = logged_in(&backend).await;

        let lines = client.command("A2", "EXAMINE INBOX").await;
        assert!(lines.contains(&"* OK [PERMANENTFLAGS ()] Flags permitted".to_string()));
        assert_eq!(lines.last().unwrap(), "A2 OK [READ-ONLY] EXAMINE completed");

        let status = client.status("A3", "STORE 1 +FLAGS (\\Seen)").await;
        assert_eq!(status, "A3 NO [READ-ONLY] Mailbox is read-only");
        let status = client.status("A4", "EXPUNGE").await;
        assert!(status.starts_with("A4 NO [READ-ONLY]"));
        let status = client.status("A5", "MOVE 1 Trash").await;
        assert!(status.starts_with("A5 NO [READ-ONLY]"));

        // Body fetch does not set \Seen in a read-only mailbox
        client.command("A6", "FETCH 1 BODY[]").await;
        let lines = client.command("A7", "FETCH 1 FLAGS").await;
        assert_eq!(lines[0], "* 1 FETCH (FLAGS ())");
    }

    #[tokio::test]
    async fn test_append_with_literals() {
        let backend = backend();
        let mut client = logged_in(&backend).await;
        client.command("A2", "SELECT INBOX").await;

        let message = "Subject: hi\r\n\r\nbody";
        client
            .send(&format!("A3 APPEND INBOX (\\Seen) {{{}}}\r\n", message.len()))
            .await;
        assert_eq!(client.line().await.unwrap(), "+ Ready for literal data");
        client.send(&format!("{}\r\n", message)).await;
        let lines = client.until_tagged("A3").await;
        assert_eq!(lines[0], "* 2 EXISTS");
        let status = lines.last().unwrap();
        assert!(status.starts_with("A3 OK [APPENDUID "), "{}", status);
        assert!(status.ends_with(" 2] APPEND completed"), "{}", status);

        // LITERAL+ skips the continuation
        client
            .send(&format!("A4 APPEND Drafts {{{}+}}\r\n{}\r\n", message.len(), message))
            .await;
        let status = client.until_tagged("A4").await.pop().unwrap();
        assert!(status.starts_with("A4 OK [APPENDUID "), "{}", status);

        let status = client.status("A5", "APPEND Missing {4+}\r\nbody").await;
        assert_eq!(status, "A5 NO [TRYCREATE] Destination mailbox does not exist");
    }

    #[tokio::test]
    async fn test_literal_too_large() {
        let config = SessionConfig {
            max_literal_size: 10,
            ..insecure()
        };
        let mut client = connect(config).await;
        let lines = client.command("A1", "LOGIN {100}").await;
        assert_eq!(lines, vec!["A1 BAD Literal too large".to_string()]);
    }

    #[tokio::test]
    async fn test_login_with_literals() {
        let mut client = connect(insecure()).await;
        client.send("A1 LOGIN {5}\r\n").await;
        assert_eq!(client.line().await.unwrap(), "+ Ready for literal data");
        client.send("alice {6+}\r\nsecret\r\n").await;
        let status = client.until_tagged("A1").await.pop().unwrap();
        assert!(status.starts_with("A1 OK"), "{}", status);
    }

    #[tokio::test]
    async fn test_copy_and_move() {
        let backend = backend();
        let mut client = logged_in(&backend).await;
        client.command("A2", "SELECT INBOX").await;

        let status = client.status("A3", "COPY 1 Trash").await;
        assert!(status.starts_with("A3 OK [COPYUID "), "{}", status);
        assert!(status.ends_with(" 1 1] COPY completed"), "{}", status);

        let status = client.status("A4", "COPY 1 Archive").await;
        assert_eq!(status, "A4 NO [TRYCREATE] Destination mailbox does not exist");

        let lines = client.command("A5", "UID MOVE 1 Queue").await;
        assert!(lines[0].starts_with("* OK [COPYUID "), "{}", lines[0]);
        assert_eq!(lines[1], "* 1 EXPUNGE");
        assert_eq!(lines[2], "A5 OK UID MOVE completed");

        let lines = client.command("A6", "STATUS Queue (MESSAGES UIDNEXT)").await;
        assert_eq!(lines[0], "* STATUS \"Queue\" (MESSAGES 1 UIDNEXT 2)");
    }

    #[tokio::test]
    async fn test_list_and_lsub() {
        let backend = backend();
        let mut client = logged_in(&backend).await;

        let lines = client.command("A2", "LIST \"\" *").await;
        assert_eq!(
            lines,
            vec![
                "* LIST (\\Drafts) \"/\" \"Drafts\"".to_string(),
                "* LIST () \"/\" \"INBOX\"".to_string(),
                "* LIST () \"/\" \"Queue\"".to_string(),
                "* LIST (\\Sent) \"/\" \"Sent\"".to_string(),
                "* LIST (\\Trash) \"/\" \"Trash\"".to_string(),
                "A2 OK LIST completed".to_string(),
            ]
        );

        let lines = client.command("A3", "LIST \"\" \"\"").await;
        assert_eq!(lines[0], "* LIST (\\Noselect) \"/\" \"\"");

        client.command("A4", "CREATE Work/Reports").await;
        let lines = client.command("A5", "LIST \"\" \"%\"").await;
        assert!(!lines.iter().any(|l| l.contains("Work/Reports")));
        let lines = client.command("A6", "LIST Work/ %").await;
        assert_eq!(lines[0], "* LIST () \"/\" \"Work/Reports\"");

        client.command("A7", "SUBSCRIBE Work/Reports").await;
        let lines = client.command("A8", "LSUB \"\" *").await;
        assert_eq!(
            lines,
            vec![
                "* LSUB () \"/\" \"Work/Reports\"".to_string(),
                "A8 OK LSUB completed".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_mailbox_management() {
        let backend = backend();
        let mut client = logged_in(&backend).await;

        assert!(client.status("A2", "CREATE Archive").await.starts_with("A2 OK"));
        let status = client.status("A3", "CREATE Archive").await;
        assert!(status.starts_with("A3 NO [ALREADYEXISTS]"), "{}", status);

        assert!(client.status("A4", "RENAME INBOX Old").await.starts_with("A4 OK"));
        let lines = client.command("A5", "STATUS INBOX (MESSAGES)").await;
        assert_eq!(lines[0], "* STATUS \"INBOX\" (MESSAGES 0)");
        let lines = client.command("A6", "STATUS Old (MESSAGES UNSEEN)").await;
        assert_eq!(lines[0], "* STATUS \"Old\" (MESSAGES 1 UNSEEN 1)");

        let status = client.status("A7", "DELETE INBOX").await;
        assert!(status.starts_with("A7 NO [CANNOT]"), "{}", status);
        let status = client.status("A8", "DELETE Nowhere").await;
        assert!(status.starts_with("A8 NO [NONEXISTENT]"), "{}", status);
        assert!(client.status("A9", "DELETE Archive").await.starts_with("A9 OK"));
    }

    #[tokio::test]
    async fn test_idle_receives_updates() {
        let backend = backend();
        let mut watcher = logged_in(&backend).await;
        let mut writer = logged_in(&backend).await;

        watcher.command("A2", "SELECT INBOX").await;
        watcher.send("A3 IDLE\r\n").await;
        assert_eq!(watcher.line().await.unwrap(), "+ idling");

        let status = writer.status("B1", "APPEND INBOX {4+}\r\nbody").await;
        assert!(status.starts_with("B1 OK"), "{}", status);
        assert_eq!(watcher.line().await.unwrap(), "* 2 EXISTS");

        writer.command("B2", "SELECT INBOX").await;
        writer.command("B3", "STORE 2 +FLAGS.SILENT (\\Flagged)").await;
        assert_eq!(watcher.line().await.unwrap(), "* 2 FETCH (FLAGS (\\Flagged))");

        watcher.send("DONE\r\n").await;
        assert_eq!(watcher.line().await.unwrap(), "A3 OK IDLE terminated");
    }

    #[tokio::test]
    async fn test_updates_from_other_sessions() {
        let backend = backend();
        let mut first = logged_in(&backend).await;
        let mut second = logged_in(&backend).await;

        first.command("A2", "SELECT INBOX").await;
        second.command("B1", "SELECT INBOX").await;
        second.command("B2", "APPEND INBOX {4+}\r\nbody").await;
        second.command("B3", "STORE 1 +FLAGS (\\Deleted)").await;
        second.command("B4", "EXPUNGE").await;
        second.command("B5", "STORE 1 +FLAGS (\\Flagged)").await;

        // The deleted message is gone before its flags matter; the new one
        // is announced by EXISTS only
        let lines = first.command("A3", "NOOP").await;
        assert_eq!(
            lines,
            vec![
                "* 1 EXPUNGE".to_string(),
                "* 1 EXISTS".to_string(),
                "A3 OK NOOP completed".to_string(),
            ]
        );

        let lines = first.command("A4", "FETCH 1 (UID FLAGS)").await;
        assert_eq!(lines[0], "* 1 FETCH (UID 2 FLAGS (\\Flagged))");
    }

    /// Ten messages flagged `\Deleted` after the welcome message
    async fn deleted_batch(client: &mut TestClient<DuplexStream>) {
        for i in 0..10 {
            let tag = format!("P{}", i);
            let status = client.status(&tag, "APPEND INBOX (\\Deleted) {1+}\r\nx").await;
            assert!(status.starts_with(&format!("{} OK", tag)), "{}", status);
        }
    }

    #[tokio::test]
    async fn test_own_changes_survive_small_update_buffer() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Auto, 4));
        let mut client = logged_in(&backend).await;
        client.command("A2", "SELECT INBOX").await;
        deleted_batch(&mut client).await;

        let lines = client.command("A3", "STORE 1:* +FLAGS (\\Flagged)").await;
        assert_eq!(lines.len(), 12, "{:?}", lines);
        assert_eq!(lines[0], "* 1 FETCH (FLAGS (\\Flagged))");
        assert!(lines[..11].iter().all(|l| l.contains(" FETCH (FLAGS (")));
        assert_eq!(lines[11], "A3 OK STORE completed");

        let lines = client.command("A4", "EXPUNGE").await;
        let mut expected: Vec<String> = (2..=11).rev().map(|seq| format!("* {} EXPUNGE", seq)).collect();
        expected.push("A4 OK EXPUNGE completed".to_string());
        assert_eq!(lines, expected);

        let lines = client.command("A5", "NOOP").await;
        assert_eq!(lines, vec!["A5 OK NOOP completed".to_string()]);
    }

    #[tokio::test]
    async fn test_lagging_session_resynchronises() {
        let backend = Arc::new(MemoryBackend::new(Provisioning::Auto, 4));
        let mut writer = logged_in(&backend).await;
        writer.command("A2", "SELECT INBOX").await;
        deleted_batch(&mut writer).await;

        let mut reader = logged_in(&backend).await;
        let lines = reader.command("B1", "SELECT INBOX").await;
        assert!(lines.contains(&"* 11 EXISTS".to_string()), "{:?}", lines);

        // Far more updates than the reader's buffer holds
        writer.command("A3", "STORE 1 +FLAGS (\\Seen)").await;
        writer.command("A4", "EXPUNGE").await;

        let lines = reader.command("B2", "NOOP").await;
        let mut expected: Vec<String> = (2..=11).rev().map(|seq| format!("* {} EXPUNGE", seq)).collect();
        expected.push("* 1 FETCH (FLAGS (\\Seen))".to_string());
        expected.push("B2 OK NOOP completed".to_string());
        assert_eq!(lines, expected);
        assert!(!lines.iter().any(|l| l.ends_with("EXISTS")));
    }

    #[tokio::test]
    async fn test_writes_to_deleted_selection_fail() {
        let backend = backend();
        let mut client = logged_in(&backend).await;
        let mut other = logged_in(&backend).await;
        client.command("A2", "CREATE Work").await;
        client.command("A3", "APPEND Work {1+}\r\nx").await;
        client.command("A4", "SELECT Work").await;
        assert!(other.status("B1", "DELETE Work").await.starts_with("B1 OK"));

        let status = client.status("A5", "STORE 1 +FLAGS (\\Seen)").await;
        assert!(status.starts_with("A5 NO [NONEXISTENT]"), "{}", status);
        let status = client.status("A6", "EXPUNGE").await;
        assert!(status.starts_with("A6 NO [NONEXISTENT]"), "{}", status);
        assert_eq!(client.status("A7", "CLOSE").await, "A7 OK CLOSE completed");

        let status = client.status("A8", "APPEND Work {1+}\r\nx").await;
        assert_eq!(status, "A8 NO [TRYCREATE] Destination mailbox does not exist");
    }

    #[tokio::test]
    async fn test_namespace_search_and_logout() {
        let backend = backend();
        let mut client = logged_in(&backend).await;

        let lines = client.command("A2", "NAMESPACE").await;
        assert_eq!(lines[0], "* NAMESPACE ((\"\" \"/\")) NIL NIL");

        client.command("A3", "SELECT INBOX").await;
        let lines = client.command("A4", "UID SEARCH FROM contact UNSEEN").await;
        assert_eq!(lines[0], "* SEARCH 1");

        let lines = client.command("A5", "LOGOUT").await;
        assert_eq!(
            lines,
            vec![
                "* BYE Logging out".to_string(),
                "A5 OK LOGOUT completed".to_string(),
            ]
        );
        assert_eq!(client.line().await, None);
    }

    #[tokio::test]
    async fn test_parse_errors() {
        let mut client = connect(insecure()).await;
        let status = client.status("A1", "FROBNICATE").await;
        assert!(status.starts_with("A1 BAD"), "{}", status);

        client.send("\r\n").await;
        client.send("*\r\n").await;
        assert!(client.line().await.unwrap().starts_with("* BAD"));
    }

    #[test]
    fn test_list_matches() {
        assert!(list_matches("*", "Work/Reports"));
        assert!(list_matches("%", "Work"));
        assert!(!list_matches("%", "Work/Reports"));
        assert!(list_matches("Work/%", "Work/Reports"));
        assert!(list_matches("inbox", "INBOX"));
        assert!(!list_matches("sent", "Sent"));
        assert!(list_matches("S*t", "Sent"));
        assert!(!list_matches("", "Sent"));
    }

    #[test]
    fn test_completed() {
        assert_eq!(completed("FETCH", true), "UID FETCH completed");
        assert_eq!(completed("FETCH", false), "FETCH completed");
    }
}
