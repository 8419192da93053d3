use serde_json::Value;
use tracing::warn;

/// A slash command received from the operator chat.
#[derive(Debug, Clone, PartialEq)]
pub struct TelegramCommand {
    /// Lower-cased command name without the leading slash or `@BotName`.
    pub command: String,
    pub args: Vec<String>,
    pub chat_id: String,
    pub user_id: Option<i64>,
    pub message_id: i64,
    pub update_id: i64,
}

impl TelegramCommand {
    pub fn new(command: &str, args: &[&str], chat_id: &str) -> Self {
        Self {
            command: command.to_ascii_lowercase(),
            args: args.iter().map(|a| a.to_string()).collect(),
            chat_id: chat_id.to_string(),
            user_id: None,
            message_id: 0,
            update_id: 0,
        }
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// `/status@MyBot a b` -> (`status`, [`a`, `b`]).
pub fn parse_command_text(text: &str) -> (String, Vec<String>) {
    let body = text.trim().strip_prefix('/').unwrap_or_else(|| text.trim());
    let mut parts = body.split_whitespace();
    let Some(head) = parts.next() else {
        return (String::new(), Vec::new());
    };
    let command = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    (command, parts.map(str::to_string).collect())
}

fn id_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Turn one `getUpdates` entry into a command.
///
/// Non-message updates, text that is not a command and messages from any
/// chat but `allowed_chat_id` yield `None`.
pub fn parse_update(update: &Value, allowed_chat_id: &str) -> Option<TelegramCommand> {
    let update_id = update.get("update_id").and_then(Value::as_i64).unwrap_or(0);
    let message = update.get("message")?;

    let chat_id = id_text(message.get("chat").and_then(|c| c.get("id")));
    if chat_id != allowed_chat_id.trim() {
        warn!(
            "Ignoring Telegram command from unauthorized chat: chat_id={} | update_id={}",
            chat_id, update_id
        );
        return None;
    }

    let text = message.get("text").and_then(Value::as_str)?.trim();
    if !text.starts_with('/') {
        return None;
    }
    let (command, args) = parse_command_text(text);
    if command.is_empty() {
        return None;
    }

    Some(TelegramCommand {
        command,
        args,
        chat_id,
        user_id: message
            .get("from")
            .and_then(|f| f.get("id"))
            .and_then(Value::as_i64),
        message_id: message.get("message_id").and_then(Value::as_i64).unwrap_or(0),
        update_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_bot_suffix_and_splits_args() {
        assert_eq!(
            parse_command_text("/Resume@TradeBot force"),
            ("resume".to_string(), vec!["force".to_string()])
        );
        assert_eq!(parse_command_text("/kill"), ("kill".to_string(), vec![]));
        assert_eq!(parse_command_text("/"), (String::new(), vec![]));
    }

    #[test]
    fn parses_message_from_allowed_chat() {
        let update = json!({
            "update_id": 10,
            "message": {
                "message_id": 5,
                "chat": { "id": -100123 },
                "from": { "id": 42 },
                "text": "/close BTC 50"
            }
        });
        let cmd = parse_update(&update, "-100123").expect("command should parse");
        assert_eq!(cmd.command, "close");
        assert_eq!(cmd.args, vec!["BTC", "50"]);
        assert_eq!(cmd.user_id, Some(42));
        assert_eq!(cmd.update_id, 10);
    }

    #[test]
    fn drops_other_chats_and_plain_text() {
        let foreign = json!({
            "update_id": 11,
            "message": { "chat": { "id": 999 }, "text": "/kill" }
        });
        assert!(parse_update(&foreign, "123").is_none());

        let chatter = json!({
            "update_id": 12,
            "message": { "chat": { "id": 123 }, "text": "hello" }
        });
        assert!(parse_update(&chatter, "123").is_none());

        let callback = json!({ "update_id": 13, "callback_query": {} });
        assert!(parse_update(&callback, "123").is_none());
    }
}
