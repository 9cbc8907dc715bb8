use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use murmur_proto::channels::UPLOAD;
use murmur_proto::message::FileUpload;
use murmur_proto::{Message, MessageKind};
use tracing::info;

use super::Channel;
use crate::server::broadcast::{Broadcaster, ClientFilter};
use crate::server::session::Session;

const MAX_UPLOAD_SIZE: usize = 16 * 1024 * 1024;

/// File bodies shared with the other subscribers.
pub struct UploadChannel {
    broadcaster: Arc<Broadcaster>,
}

impl UploadChannel {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl Channel for UploadChannel {
    fn name(&self) -> &'static str {
        UPLOAD
    }

    fn inbound(&self) -> Option<MessageKind> {
        Some(MessageKind::FileUpload)
    }

    fn max_size(&self) -> usize {
        MAX_UPLOAD_SIZE
    }

    fn binary_only(&self) -> bool {
        true
    }

    async fn handle(&self, from: &Arc<Session>, msg: Message) -> Result<()> {
        let Message::FileUpload(upload) = msg else {
            bail!("upload expects file uploads, got {}", msg.kind());
        };
        info!(
            session = %from.id(),
            name = %from.name(),
            file = %upload.file_name,
            bytes = upload.body.len(),
            "upload"
        );
        let relayed = FileUpload {
            from: from.name().to_string(),
            file_name: upload.file_name,
            body: upload.body,
        };
        self.broadcaster
            .broadcast(ClientFilter::channel(UPLOAD).except_session(from), relayed)
            .await;
        Ok(())
    }
}
