use std::sync::Arc;

use async_trait::async_trait;
use murmur_proto::MessageKind;
use murmur_proto::channels::USERS;

use super::{Channel, UserEvent};
use crate::server::broadcast::{Broadcaster, ClientFilter};
use crate::server::session::Session;

/// Presence: the user list, pushed whenever it may have changed.
pub struct UsersChannel {
    broadcaster: Arc<Broadcaster>,
}

impl UsersChannel {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl Channel for UsersChannel {
    fn name(&self) -> &'static str {
        USERS
    }

    fn inbound(&self) -> Option<MessageKind> {
        None
    }

    async fn user_update(&self, _session: &Arc<Session>, _event: UserEvent) {
        // A second device for an existing name can leave the list unchanged;
        // per-session dedup drops those writes.
        let list = self.broadcaster.registry().user_list().await;
        self.broadcaster
            .broadcast(ClientFilter::channel(USERS), list)
            .await;
    }
}
