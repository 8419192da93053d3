use serde_json::Value;
use tracing::{debug, warn};

use super::command::{parse_update, TelegramCommand};
use crate::adapters::TelegramClient;
use crate::config::TelegramConfig;

/// Polls `getUpdates` for operator commands.
///
/// `last_update_id` advances past every update seen, authorized or not, so
/// nothing is processed twice.
pub struct CommandPoller {
    client: TelegramClient,
    allowed_chat_id: String,
    last_update_id: i64,
    timeout_secs: u64,
    limit: u32,
}

impl CommandPoller {
    pub fn new(client: TelegramClient, allowed_chat_id: &str) -> Self {
        Self {
            client,
            allowed_chat_id: allowed_chat_id.trim().to_string(),
            last_update_id: 0,
            timeout_secs: 5,
            limit: 10,
        }
    }

    pub fn from_config(cfg: &TelegramConfig, client: TelegramClient) -> Option<Self> {
        let chat_id = cfg.chat_id.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
        let mut poller = Self::new(client, chat_id);
        poller.timeout_secs = cfg.poll_timeout_secs;
        poller.limit = cfg.poll_limit;
        Some(poller)
    }

    pub fn last_update_id(&self) -> i64 {
        self.last_update_id
    }

    pub fn client(&self) -> &TelegramClient {
        &self.client
    }

    /// `getUpdates` offset; omitted until an update has been seen.
    pub fn next_offset(&self) -> Option<i64> {
        (self.last_update_id > 0).then(|| self.last_update_id + 1)
    }

    /// Fetch new updates. Transport failures are logged and yield no commands.
    pub async fn poll(&mut self) -> Vec<TelegramCommand> {
        let updates = match self
            .client
            .get_updates(self.next_offset(), self.timeout_secs, self.limit)
            .await
        {
            Ok(updates) => updates,
            Err(e) => {
                warn!("Telegram getUpdates failed: {}", e);
                return Vec::new();
            }
        };
        self.ingest(&updates)
    }

    pub fn ingest(&mut self, updates: &[Value]) -> Vec<TelegramCommand> {
        let mut commands = Vec::new();
        for update in updates {
            if let Some(id) = update.get("update_id").and_then(Value::as_i64) {
                self.last_update_id = self.last_update_id.max(id);
            }
            if let Some(cmd) = parse_update(update, &self.allowed_chat_id) {
                commands.push(cmd);
            }
        }
        if !commands.is_empty() {
            debug!(
                "Telegram commands polled: {} (last_update_id={})",
                commands.len(),
                self.last_update_id
            );
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn poller() -> CommandPoller {
        let client = TelegramClient::new("https://api.telegram.org", "1:x", Duration::from_secs(5))
            .expect("client should build");
        CommandPoller::new(client, "123")
    }

    #[test]
    fn offset_omitted_until_first_update() {
        let mut p = poller();
        assert_eq!(p.next_offset(), None);

        let cmds = p.ingest(&[
            json!({ "update_id": 7, "message": { "chat": { "id": 999 }, "text": "/kill" } }),
            json!({ "update_id": 8, "message": { "chat": { "id": 123 }, "text": "/status" } }),
        ]);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].command, "status");
        assert_eq!(p.last_update_id(), 8);
        assert_eq!(p.next_offset(), Some(9));
    }

    #[test]
    fn unauthorized_updates_still_advance_offset() {
        let mut p = poller();
        let cmds = p.ingest(&[json!({
            "update_id": 21,
            "message": { "chat": { "id": 5 }, "text": "/kill" }
        })]);
        assert!(cmds.is_empty());
        assert_eq!(p.next_offset(), Some(22));
    }
}
