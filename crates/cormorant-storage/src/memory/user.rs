//! In-memory user

use super::{canonical_name, MemoryMailbox, Shared};
use crate::memory::mailbox::MailboxState;
use crate::models::{special_use, Message, INBOX};
use crate::repository::{Mailbox, User};
use crate::updates::UpdateKind;
use async_trait::async_trait;
use chrono::Utc;
use cormorant_common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::debug;

/// A user and its mailboxes
pub struct MemoryUser {
    username: String,
    password: String,
    me: Weak<MemoryUser>,
    shared: Arc<Shared>,
    mailboxes: RwLock<HashMap<String, Arc<MemoryMailbox>>>,
}

impl MemoryUser {
    /// Create a user with the default mailbox set and a welcome message
    pub(super) fn new(shared: Arc<Shared>, username: &str, password: &str) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<MemoryUser>| {
            let defaults: [(&str, Option<&str>); 5] = [
                (INBOX, None),
                ("Sent", Some(special_use::SENT)),
                ("Drafts", Some(special_use::DRAFTS)),
                ("Queue", None),
                ("Trash", Some(special_use::TRASH)),
            ];

            let mailboxes = defaults
                .into_iter()
                .map(|(name, attribute)| {
                    let mut state = MailboxState::new(shared.uid_validity());
                    state.attributes.extend(attribute.map(str::to_string));
                    if name == INBOX {
                        state.push(Vec::new(), Utc::now(), welcome_message(username));
                    }
                    let mailbox = MemoryMailbox::new(&shared, me.clone(), username, name, state);
                    (name.to_string(), Arc::new(mailbox))
                })
                .collect();

            Self {
                username: username.to_string(),
                password: password.to_string(),
                me: me.clone(),
                shared: shared.clone(),
                mailboxes: RwLock::new(mailboxes),
            }
        })
    }

    pub(super) fn check_password(&self, password: &str) -> bool {
        self.password == password
    }

    pub(super) async fn lookup(&self, name: &str) -> Option<Arc<MemoryMailbox>> {
        self.mailboxes.read().await.get(&canonical_name(name)).cloned()
    }
}

fn welcome_message(username: &str) -> Vec<u8> {
    let now = Utc::now();
    format!(
        "From: contact@example.org\r\n\
         To: {user}@example.org\r\n\
         Subject: A little message, just for you\r\n\
         Date: {date}\r\n\
         Message-ID: <{nanos}@localhost/>\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         Hi {user} there :)",
        user = username,
        date = now.format("%a, %-d %b %Y %H:%M:%S %z"),
        nanos = now.timestamp_subsec_nanos(),
    )
    .into_bytes()
}

fn no_such_mailbox(name: &str) -> Error {
    Error::NotFound(format!("No such mailbox: {}", name))
}

#[async_trait]
impl User for MemoryUser {
    fn username(&self) -> &str {
        &self.username
    }

    async fn list_mailboxes(&self, subscribed: bool) -> Result<Vec<Arc<dyn Mailbox>>> {
        let mailboxes = self.mailboxes.read().await;
        let mut result: Vec<Arc<dyn Mailbox>> = Vec::with_capacity(mailboxes.len());
        for mailbox in mailboxes.values() {
            if subscribed && !mailbox.is_subscribed().await {
                continue;
            }
            result.push(mailbox.clone());
        }
        Ok(result)
    }

    async fn get_mailbox(&self, name: &str) -> Result<Arc<dyn Mailbox>> {
        match self.lookup(name).await {
            Some(mailbox) => Ok(mailbox),
            None => Err(no_such_mailbox(name)),
        }
    }

    async fn create_mailbox(&self, name: &str) -> Result<()> {
        let name = canonical_name(name);
        if name.is_empty() {
            return Err(Error::Validation("Empty mailbox name".to_string()));
        }

        let mut mailboxes = self.mailboxes.write().await;
        if mailboxes.contains_key(&name) {
            return Err(Error::AlreadyExists(format!("Mailbox already exists: {}", name)));
        }

        let state = MailboxState::new(self.shared.uid_validity());
        let mailbox = MemoryMailbox::new(&self.shared, self.me.clone(), &self.username, &name, state);
        mailboxes.insert(name.clone(), Arc::new(mailbox));
        debug!(username = %self.username, mailbox = %name, "Mailbox created");
        Ok(())
    }

    async fn delete_mailbox(&self, name: &str) -> Result<()> {
        let name = canonical_name(name);
        if name == INBOX {
            return Err(Error::PermissionDenied("Cannot delete INBOX".to_string()));
        }

        let mut mailboxes = self.mailboxes.write().await;
        let Some(removed) = mailboxes.remove(&name) else {
            return Err(no_such_mailbox(&name));
        };
        removed.state.write().await.retired = true;
        debug!(username = %self.username, mailbox = %name, "Mailbox deleted");
        Ok(())
    }

    async fn rename_mailbox(&self, existing: &str, new_name: &str) -> Result<()> {
        let existing = canonical_name(existing);
        let new_name = canonical_name(new_name);

        let mut mailboxes = self.mailboxes.write().await;
        if mailboxes.contains_key(&new_name) {
            return Err(Error::AlreadyExists(format!(
                "Mailbox already exists: {}",
                new_name
            )));
        }
        let old = mailboxes
            .get(&existing)
            .cloned()
            .ok_or_else(|| no_such_mailbox(&existing))?;

        let mut old_state = old.state.write().await;
        let count = old_state.messages.len() as u32;
        let state = MailboxState {
            attributes: old_state.attributes.clone(),
            subscribed: old_state.subscribed,
            messages: std::mem::take(&mut old_state.messages),
            uid_validity: self.shared.uid_validity(),
            uid_next: old_state.uid_next,
            retired: false,
        };

        if existing == INBOX {
            // INBOX stays, now empty
            for seq in (1..=count).rev() {
                old.publish(UpdateKind::Expunge { seq });
            }
        } else {
            old_state.retired = true;
            mailboxes.remove(&existing);
        }
        drop(old_state);

        let renamed = MemoryMailbox::new(&self.shared, self.me.clone(), &self.username, &new_name, state);
        mailboxes.insert(new_name.clone(), Arc::new(renamed));
        debug!(username = %self.username, from = %existing, to = %new_name, "Mailbox renamed");
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StatusItem;
    use cormorant_common::types::SequenceSet;
    use pretty_assertions::assert_eq;

    fn user() -> Arc<MemoryUser> {
        MemoryUser::new(Arc::new(Shared::new(16)), "alice", "secret")
    }

    async fn names(user: &MemoryUser, subscribed: bool) -> Vec<String> {
        let mut names: Vec<String> = user
            .list_mailboxes(subscribed)
            .await
            .unwrap()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        names.sort();
        names
    }

    async fn count(user: &MemoryUser, name: &str) -> u32 {
        let mailbox = user.get_mailbox(name).await.unwrap();
        let status = mailbox.status(&[StatusItem::Messages]).await.unwrap();
        status.messages.unwrap()
    }

    #[tokio::test]
    async fn test_fresh_user_layout() {
        let user = user();
        assert_eq!(
            names(&user, false).await,
            vec!["Drafts", "INBOX", "Queue", "Sent", "Trash"]
        );
        assert_eq!(count(&user, "INBOX").await, 1);

        let inbox = user.get_mailbox("INBOX").await.unwrap();
        let messages = inbox.list_messages(false, &SequenceSet::Single(1)).await.unwrap();
        let body = String::from_utf8(messages[0].message.body.clone()).unwrap();
        assert!(body.contains("To: alice@example.org\r\n"));
        assert!(body.ends_with("Hi alice there :)"));
        assert_eq!(messages[0].message.size as usize, body.len());

        let sent = user.get_mailbox("Sent").await.unwrap().info().await.unwrap();
        assert_eq!(sent.attributes, vec![special_use::SENT.to_string()]);
        assert_eq!(sent.delimiter, "/");
    }

    #[tokio::test]
    async fn test_inbox_is_case_insensitive() {
        let user = user();
        let inbox = user.get_mailbox("inbox").await.unwrap();
        assert_eq!(inbox.name(), INBOX);
        assert!(user.get_mailbox("sent").await.is_err());
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let user = user();
        user.create_mailbox("Archive").await.unwrap();
        assert!(matches!(
            user.create_mailbox("Archive").await,
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            user.create_mailbox("Inbox").await,
            Err(Error::AlreadyExists(_))
        ));

        user.delete_mailbox("Archive").await.unwrap();
        assert!(matches!(
            user.delete_mailbox("Archive").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            user.delete_mailbox("INBOX").await,
            Err(Error::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_inbox_keeps_empty_inbox() {
        let user = user();
        let before = user.get_mailbox("INBOX").await.unwrap();
        let old_validity = before.status(&[StatusItem::UidValidity]).await.unwrap().uid_validity;

        user.rename_mailbox("INBOX", "Old").await.unwrap();

        assert_eq!(count(&user, "INBOX").await, 0);
        assert_eq!(count(&user, "Old").await, 1);

        let old = user.get_mailbox("Old").await.unwrap();
        let status = old
            .status(&[StatusItem::UidNext, StatusItem::UidValidity])
            .await
            .unwrap();
        assert_eq!(status.uid_next, Some(2));
        assert_ne!(status.uid_validity, old_validity);
    }

    #[tokio::test]
    async fn test_rename_other_mailbox_removes_old_name() {
        let user = user();
        user.rename_mailbox("Queue", "Outbox").await.unwrap();
        assert!(user.get_mailbox("Queue").await.is_err());
        assert!(user.get_mailbox("Outbox").await.is_ok());

        assert!(matches!(
            user.rename_mailbox("Missing", "Other").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            user.rename_mailbox("Outbox", "Sent").await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribed_listing() {
        let user = user();
        assert!(names(&user, true).await.is_empty());
        user.get_mailbox("Trash")
            .await
            .unwrap()
            .set_subscribed(true)
            .await
            .unwrap();
        assert_eq!(names(&user, true).await, vec!["Trash"]);
    }
}
