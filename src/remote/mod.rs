//! Telegram remote control: command intake, handlers and replies.

mod command;
mod handlers;
mod poller;

pub use command::{parse_command_text, parse_update, TelegramCommand};
pub use handlers::{
    handle_command, normalize_symbol, process_commands, CommandContext, CommandResult,
    GENERIC_FAILURE_MESSAGE,
};
pub use poller::CommandPoller;
