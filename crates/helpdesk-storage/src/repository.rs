//! Repository layer for data access

pub mod attachments;
pub mod channels;
pub mod messages;
pub mod spam_logs;
pub mod tickets;

use crate::db::DatabasePool;
use std::sync::Arc;

// Re-export concrete repository implementations with simple names
pub use attachments::DbAttachmentRepository as AttachmentRepository;
pub use channels::DbChannelRepository as ChannelRepository;
pub use messages::DbMessageRepository as MessageRepository;
pub use spam_logs::DbSpamLogRepository as SpamLogRepository;
pub use tickets::DbTicketRepository as TicketRepository;

// Re-export repository traits
pub use attachments::AttachmentRepository as AttachmentRepositoryTrait;
pub use channels::ChannelRepository as ChannelRepositoryTrait;
pub use messages::MessageRepository as MessageRepositoryTrait;
pub use spam_logs::SpamLogRepository as SpamLogRepositoryTrait;
pub use tickets::TicketRepository as TicketRepositoryTrait;

/// All repositories behind trait objects, shared across services
#[derive(Clone)]
pub struct Repositories {
    pub channels: Arc<dyn ChannelRepositoryTrait>,
    pub tickets: Arc<dyn TicketRepositoryTrait>,
    pub messages: Arc<dyn MessageRepositoryTrait>,
    pub attachments: Arc<dyn AttachmentRepositoryTrait>,
    pub spam_logs: Arc<dyn SpamLogRepositoryTrait>,
}

impl Repositories {
    /// PostgreSQL-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            channels: Arc::new(ChannelRepository::new(pool.clone())),
            tickets: Arc::new(TicketRepository::new(pool.clone())),
            messages: Arc::new(MessageRepository::new(pool.clone())),
            attachments: Arc::new(AttachmentRepository::new(pool.clone())),
            spam_logs: Arc::new(SpamLogRepository::new(pool)),
        }
    }
}
