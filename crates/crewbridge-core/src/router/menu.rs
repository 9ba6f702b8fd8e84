//! Slash-command menu upkeep.
//!
//! Telegram shows a command menu per bot; the bridge rebuilds it at startup
//! and whenever the worker set changes, so each worker gets its own
//! `/<name>` shortcut next to the eight base commands. A failed rebuild is
//! logged and otherwise ignored; the menu is cosmetic.

use tracing::warn;

use crate::error::Result;
use crate::telegram::types::BotCommand;
use crate::telegram::TelegramClient;
use crate::tmux::WorkerRuntime;

use super::command::COMMANDS;

/// The full menu for the current worker set.
pub fn build_menu(workers: &[String]) -> Vec<BotCommand> {
    let mut menu: Vec<BotCommand> = COMMANDS
        .iter()
        .filter(|spec| spec.in_menu)
        .map(|spec| BotCommand {
            command: spec.name.to_string(),
            description: spec.description.to_string(),
        })
        .collect();
    for worker in workers {
        menu.push(BotCommand {
            command: worker.clone(),
            description: format!("Message worker {worker}"),
        });
    }
    menu
}

/// Push the current menu to Telegram. Never fatal.
pub async fn rebuild(tg: &TelegramClient, runtime: &WorkerRuntime) {
    if let Err(e) = try_rebuild(tg, runtime).await {
        warn!("command menu rebuild failed: {e}");
    }
}

async fn try_rebuild(tg: &TelegramClient, runtime: &WorkerRuntime) -> Result<()> {
    let workers = runtime.list_sessions().await?;
    tg.set_my_commands(&build_menu(&workers)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_menu_base_plus_workers() {
        let menu = build_menu(&["alice".to_string(), "bob".to_string()]);
        assert_eq!(menu.len(), 10);
        assert_eq!(menu[0].command, "hire");
        assert_eq!(menu[8].command, "alice");
        assert_eq!(menu[8].description, "Message worker alice");
        assert_eq!(menu[9].command, "bob");
    }

    #[test]
    fn test_menu_without_workers_is_base_only() {
        assert_eq!(build_menu(&[]).len(), 8);
    }
}
