//! Thread reconstruction
//!
//! Decides whether an inbound message continues an existing conversation.
//! Header linkage (In-Reply-To / References) is authoritative; a
//! normalized-subject heuristic restricted to a trailing time window and to
//! prior participants is the fallback for clients that drop those headers.

pub mod subject;

pub use subject::{normalize_subject, subjects_match, token_overlap};

use chrono::{Duration, Utc};
use helpdesk_common::config::ThreadingConfig;
use helpdesk_common::types::{normalize_message_id, ConversationId, TicketId};
use helpdesk_common::Result;
use helpdesk_storage::models::{Message, Ticket};
use helpdesk_storage::repository::{MessageRepositoryTrait, TicketRepositoryTrait};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Threading context of an inbound message
#[derive(Debug, Clone, Default)]
pub struct ThreadLookup<'a> {
    pub message_id: Option<&'a str>,
    pub in_reply_to: Option<&'a str>,
    pub references: &'a [String],
    pub subject: Option<&'a str>,
    pub from_address: Option<&'a str>,
}

/// How a thread was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    HeaderChain,
    Subject,
}

/// Existing ticket/conversation a message belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMatch {
    pub ticket_id: TicketId,
    pub conversation_id: ConversationId,
    pub kind: MatchKind,
}

/// Thread reconstructor
pub struct ThreadReconstructor {
    tickets: Arc<dyn TicketRepositoryTrait>,
    messages: Arc<dyn MessageRepositoryTrait>,
    window: Duration,
    similarity_threshold: f64,
}

impl ThreadReconstructor {
    pub fn new(
        tickets: Arc<dyn TicketRepositoryTrait>,
        messages: Arc<dyn MessageRepositoryTrait>,
        config: &ThreadingConfig,
    ) -> Self {
        Self {
            tickets,
            messages,
            window: Duration::days(config.window_days),
            similarity_threshold: config.similarity_threshold,
        }
    }

    /// Find the ticket/conversation this message continues, if any
    pub async fn find_existing_thread(&self, lookup: &ThreadLookup<'_>) -> Result<Option<ThreadMatch>> {
        let own_id = lookup.message_id.map(normalize_message_id);

        let mut ids: Vec<String> = Vec::new();
        for id in lookup
            .in_reply_to
            .into_iter()
            .chain(lookup.references.iter().map(String::as_str))
        {
            let id = normalize_message_id(id);
            if !id.is_empty() && Some(&id) != own_id.as_ref() && !ids.contains(&id) {
                ids.push(id);
            }
        }

        if let Some(parent) = self.messages.find_by_external_ids(&ids).await? {
            debug!(
                ticket_id = %parent.ticket_id,
                parent = ?parent.external_message_id,
                "Thread resolved by header chain"
            );
            return Ok(Some(ThreadMatch {
                ticket_id: parent.ticket_id,
                conversation_id: parent.conversation_id,
                kind: MatchKind::HeaderChain,
            }));
        }

        let (Some(subject), Some(from)) = (lookup.subject, lookup.from_address) else {
            return Ok(None);
        };

        let found = self.find_by_subject(subject, from, None).await?;
        if let Some(found) = &found {
            debug!(ticket_id = %found.ticket_id, "Thread resolved by subject heuristic");
        }
        Ok(found)
    }

    /// Subject/participant heuristic over tickets created inside the window
    async fn find_by_subject(
        &self,
        subject: &str,
        from: &str,
        exclude: Option<TicketId>,
    ) -> Result<Option<ThreadMatch>> {
        let normalized = normalize_subject(subject);
        if normalized.is_empty() {
            return Ok(None);
        }

        let since = Utc::now() - self.window;
        let candidates = self.tickets.list_created_since(since).await?;

        for ticket in candidates {
            if Some(ticket.id) == exclude {
                continue;
            }
            if !subjects_match(
                &normalized,
                &normalize_subject(&ticket.subject),
                self.similarity_threshold,
            ) {
                continue;
            }

            let Some(conversation) = self.tickets.conversation_for_ticket(ticket.id).await? else {
                continue;
            };

            if self.participated(&ticket, conversation.id, from).await? {
                return Ok(Some(ThreadMatch {
                    ticket_id: ticket.id,
                    conversation_id: conversation.id,
                    kind: MatchKind::Subject,
                }));
            }
        }

        Ok(None)
    }

    async fn participated(
        &self,
        ticket: &Ticket,
        conversation_id: ConversationId,
        address: &str,
    ) -> Result<bool> {
        if ticket.requester_email.eq_ignore_ascii_case(address.trim()) {
            return Ok(true);
        }
        self.messages.has_participant(conversation_id, address.trim()).await
    }

    /// Prior external message ids of a conversation, oldest first
    pub async fn build_reference_chain(
        &self,
        conversation_id: ConversationId,
        exclude: Option<&str>,
    ) -> Result<Vec<String>> {
        let exclude = exclude.map(normalize_message_id);
        let messages = self.messages.list_by_conversation(conversation_id).await?;
        Ok(reference_chain(&messages, exclude.as_deref()))
    }

    /// Backfill threading headers on messages that arrived without any.
    ///
    /// Messages already attached to a conversation inherit the chain of
    /// their predecessors; a message that opened its own ticket is linked
    /// to an older matching ticket when the subject heuristic finds one.
    /// Returns the number of messages updated.
    pub async fn group_orphaned_messages(&self) -> Result<usize> {
        let since = Utc::now() - self.window;
        let orphans = self.messages.list_orphans_since(since).await?;
        let mut updated = 0;

        for orphan in orphans {
            match self.infer_chain(&orphan).await {
                Ok(Some(chain)) => {
                    let parent = chain.last().cloned();
                    self.messages
                        .update_threading(orphan.id, parent.as_deref(), &chain)
                        .await?;
                    updated += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(message_id = %orphan.id, error = %e, "Failed to regroup orphaned message"),
            }
        }

        if updated > 0 {
            info!(updated, "Regrouped orphaned messages");
        }
        Ok(updated)
    }

    async fn infer_chain(&self, orphan: &Message) -> Result<Option<Vec<String>>> {
        let siblings = self.messages.list_by_conversation(orphan.conversation_id).await?;
        let earlier: Vec<Message> = siblings
            .into_iter()
            .filter(|m| m.created_at < orphan.created_at && m.id != orphan.id)
            .collect();

        let own_chain = reference_chain(&earlier, orphan.external_message_id.as_deref());
        if !own_chain.is_empty() {
            return Ok(Some(own_chain));
        }
        if !earlier.is_empty() {
            return Ok(None);
        }

        let Some(subject) = orphan.subject.as_deref() else {
            return Ok(None);
        };
        let Some(found) = self
            .find_by_subject(subject, &orphan.from_address, Some(orphan.ticket_id))
            .await?
        else {
            return Ok(None);
        };

        let Some(ticket) = self.tickets.get(found.ticket_id).await? else {
            return Ok(None);
        };
        if ticket.created_at >= orphan.created_at {
            return Ok(None);
        }

        let chain = self
            .build_reference_chain(found.conversation_id, orphan.external_message_id.as_deref())
            .await?;
        Ok((!chain.is_empty()).then_some(chain))
    }
}

fn reference_chain(messages: &[Message], exclude: Option<&str>) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();
    for id in messages.iter().filter_map(|m| m.external_message_id.as_deref()) {
        if Some(id) != exclude && !chain.iter().any(|c| c == id) {
            chain.push(id.to_string());
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use helpdesk_common::types::{ChannelSettings, ProviderKind, TicketStatus};
    use pretty_assertions::assert_eq;

    fn reconstructor(store: &MemoryStore) -> ThreadReconstructor {
        let repos = store.repositories();
        ThreadReconstructor::new(repos.tickets, repos.messages, &ThreadingConfig::default())
    }

    #[tokio::test]
    async fn test_header_chain_wins_over_subject() {
        let store = MemoryStore::new();
        let channel = store.add_channel("support@acme.test", ProviderKind::Imap, ChannelSettings::default());
        let now = Utc::now();

        let (billing, billing_conv) = store.insert_ticket(
            channel.id,
            "Help with billing",
            "a@x.com",
            TicketStatus::Open,
            now - Duration::days(1),
        );
        store.insert_message(&billing_conv, Some("billing-1@x.com"), "a@x.com", None, now);

        let (order, order_conv) =
            store.insert_ticket(channel.id, "Order 42", "a@x.com", TicketStatus::Closed, now - Duration::days(3));
        store.insert_message(&order_conv, Some("abc@x"), "a@x.com", None, now - Duration::days(3));

        let found = reconstructor(&store)
            .find_existing_thread(&ThreadLookup {
                message_id: Some("<new@x.com>"),
                in_reply_to: Some("<abc@x>"),
                references: &[],
                subject: Some("Re: Help with billing"),
                from_address: Some("a@x.com"),
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(found.ticket_id, order.id);
        assert_eq!(found.conversation_id, order_conv.id);
        assert_eq!(found.kind, MatchKind::HeaderChain);
        assert_ne!(found.ticket_id, billing.id);
    }

    #[tokio::test]
    async fn test_references_are_searched_in_order() {
        let store = MemoryStore::new();
        let channel = store.add_channel("support@acme.test", ProviderKind::Imap, ChannelSettings::default());
        let now = Utc::now();
        let (_, first_conv) = store.insert_ticket(channel.id, "One", "a@x.com", TicketStatus::Open, now);
        let (second, second_conv) = store.insert_ticket(channel.id, "Two", "a@x.com", TicketStatus::Open, now);
        store.insert_message(&first_conv, Some("first@x"), "a@x.com", None, now);
        store.insert_message(&second_conv, Some("second@x"), "a@x.com", None, now);

        let refs = vec!["<unknown@x>".to_string(), "<second@x>".to_string(), "<first@x>".to_string()];
        let found = reconstructor(&store)
            .find_existing_thread(&ThreadLookup {
                references: &refs,
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.ticket_id, second.id);
    }

    #[tokio::test]
    async fn test_subject_fallback_requires_participation() {
        let store = MemoryStore::new();
        let channel = store.add_channel("support@acme.test", ProviderKind::Imap, ChannelSettings::default());
        let now = Utc::now();
        let (ticket, conversation) = store.insert_ticket(
            channel.id,
            "Re: Help with billing",
            "other@y.com",
            TicketStatus::Open,
            now - Duration::days(2),
        );
        store.insert_message(&conversation, Some("m1@x"), "A@X.com", None, now - Duration::days(2));

        let threads = reconstructor(&store);
        let found = threads
            .find_existing_thread(&ThreadLookup {
                subject: Some("Help with billing"),
                from_address: Some("a@x.com"),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.ticket_id, ticket.id);
        assert_eq!(found.kind, MatchKind::Subject);

        let stranger = threads
            .find_existing_thread(&ThreadLookup {
                subject: Some("Help with billing"),
                from_address: Some("stranger@z.com"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(stranger.is_none());
    }

    #[tokio::test]
    async fn test_subject_fallback_respects_window() {
        let store = MemoryStore::new();
        let channel = store.add_channel("support@acme.test", ProviderKind::Imap, ChannelSettings::default());
        store.insert_ticket(
            channel.id,
            "Help with billing",
            "a@x.com",
            TicketStatus::Open,
            Utc::now() - Duration::days(10),
        );

        let found = reconstructor(&store)
            .find_existing_thread(&ThreadLookup {
                subject: Some("Help with billing"),
                from_address: Some("a@x.com"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_newest_matching_ticket_wins() {
        let store = MemoryStore::new();
        let channel = store.add_channel("support@acme.test", ProviderKind::Imap, ChannelSettings::default());
        let now = Utc::now();
        store.insert_ticket(channel.id, "Printer jam", "a@x.com", TicketStatus::Open, now - Duration::days(4));
        let (newer, _) =
            store.insert_ticket(channel.id, "Printer jam", "a@x.com", TicketStatus::Open, now - Duration::days(1));

        let found = reconstructor(&store)
            .find_existing_thread(&ThreadLookup {
                subject: Some("RE: printer jam"),
                from_address: Some("a@x.com"),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.ticket_id, newer.id);
    }

    #[tokio::test]
    async fn test_build_reference_chain() {
        let store = MemoryStore::new();
        let channel = store.add_channel("support@acme.test", ProviderKind::Imap, ChannelSettings::default());
        let now = Utc::now();
        let (_, conversation) = store.insert_ticket(channel.id, "Chain", "a@x.com", TicketStatus::Open, now);
        store.insert_message(&conversation, Some("one@x"), "a@x.com", None, now - Duration::minutes(30));
        store.insert_message(&conversation, None, "agent@acme.test", None, now - Duration::minutes(20));
        store.insert_message(&conversation, Some("two@x"), "a@x.com", None, now - Duration::minutes(10));
        store.insert_message(&conversation, Some("three@x"), "a@x.com", None, now);

        let chain = reconstructor(&store)
            .build_reference_chain(conversation.id, Some("<three@x>"))
            .await
            .unwrap();
        assert_eq!(chain, vec!["one@x".to_string(), "two@x".to_string()]);
    }

    #[tokio::test]
    async fn test_group_orphaned_messages() {
        let store = MemoryStore::new();
        let channel = store.add_channel("support@acme.test", ProviderKind::Imap, ChannelSettings::default());
        let now = Utc::now();
        let (_, conversation) =
            store.insert_ticket(channel.id, "Login broken", "a@x.com", TicketStatus::Open, now - Duration::hours(3));
        let first = store.insert_message(&conversation, Some("first@x"), "a@x.com", None, now - Duration::hours(3));
        let orphan = store.insert_message(&conversation, Some("second@x"), "a@x.com", None, now - Duration::hours(1));

        let updated = reconstructor(&store).group_orphaned_messages().await.unwrap();
        assert_eq!(updated, 1);

        let messages = store.messages();
        let orphan = messages.iter().find(|m| m.id == orphan.id).unwrap();
        assert_eq!(orphan.in_reply_to.as_deref(), Some("first@x"));
        assert_eq!(orphan.references(), vec!["first@x".to_string()]);
        let first = messages.iter().find(|m| m.id == first.id).unwrap();
        assert!(first.is_orphan());
    }
}
