//! The closed catalog of bridge commands.
//!
//! One table drives everything: dispatch, aliases, the slash-command menu,
//! and the reserved-name set (a worker may not shadow a command word). The
//! blocked set lists Claude-side slash commands that need a real terminal
//! and are refused instead of forwarded.

/// A bridge command, independent of which alias spelled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Hire,
    End,
    Team,
    Focus,
    Pause,
    Progress,
    Relaunch,
    Settings,
    Learn,
}

pub struct CommandSpec {
    pub command: Command,
    pub name: &'static str,
    pub alias: Option<&'static str>,
    pub description: &'static str,
    /// Whether this entry appears in the bot's slash-command menu.
    pub in_menu: bool,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: Command::Hire,
        name: "hire",
        alias: Some("new"),
        description: "Add a worker: /hire <name> [workdir]",
        in_menu: true,
    },
    CommandSpec {
        command: Command::End,
        name: "end",
        alias: Some("kill"),
        description: "Dismiss a worker: /end <name>",
        in_menu: true,
    },
    CommandSpec {
        command: Command::Team,
        name: "team",
        alias: Some("list"),
        description: "List the team",
        in_menu: true,
    },
    CommandSpec {
        command: Command::Focus,
        name: "focus",
        alias: Some("use"),
        description: "Talk to a worker: /focus <name>",
        in_menu: true,
    },
    CommandSpec {
        command: Command::Pause,
        name: "pause",
        alias: Some("stop"),
        description: "Interrupt the focused worker",
        in_menu: true,
    },
    CommandSpec {
        command: Command::Progress,
        name: "progress",
        alias: Some("status"),
        description: "Show the focused worker's status",
        in_menu: true,
    },
    CommandSpec {
        command: Command::Relaunch,
        name: "relaunch",
        alias: Some("restart"),
        description: "Restart the focused worker's assistant",
        in_menu: true,
    },
    CommandSpec {
        command: Command::Settings,
        name: "settings",
        alias: Some("system"),
        description: "Show effective settings",
        in_menu: true,
    },
    CommandSpec {
        command: Command::Learn,
        name: "learn",
        alias: None,
        description: "Ask the focused worker to reflect: /learn [topic]",
        in_menu: false,
    },
];

/// Keywords reserved beyond the command table itself.
const EXTRA_RESERVED: &[&str] = &["all", "start", "help"];

/// Claude slash commands that need an interactive terminal; the bridge
/// refuses to forward them rather than leave the session wedged.
pub const BLOCKED_CLAUDE_COMMANDS: &[&str] = &[
    "mcp",
    "help",
    "config",
    "model",
    "compact",
    "cost",
    "doctor",
    "init",
    "login",
    "logout",
    "memory",
    "permissions",
    "pr",
    "review",
    "terminal",
    "vim",
    "approved-tools",
    "listen",
    "ide",
];

/// Resolve a (lowercased, suffix-stripped) token to a command.
pub fn lookup(token: &str) -> Option<Command> {
    COMMANDS
        .iter()
        .find(|spec| spec.name == token || spec.alias == Some(token))
        .map(|spec| spec.command)
}

/// Every word a worker may not be named, case folded.
pub fn reserved_words() -> Vec<&'static str> {
    let mut words: Vec<&'static str> = COMMANDS
        .iter()
        .flat_map(|spec| [Some(spec.name), spec.alias])
        .flatten()
        .collect();
    words.extend(EXTRA_RESERVED);
    words
}

/// Case-insensitive reserved-name check for `/hire`.
pub fn is_reserved(name: &str) -> bool {
    let folded = name.to_lowercase();
    reserved_words().iter().any(|w| *w == folded)
}

pub fn is_blocked_claude_command(token: &str) -> bool {
    BLOCKED_CLAUDE_COMMANDS.contains(&token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_names_and_aliases() {
        assert_eq!(lookup("hire"), Some(Command::Hire));
        assert_eq!(lookup("new"), Some(Command::Hire));
        assert_eq!(lookup("stop"), Some(Command::Pause));
        assert_eq!(lookup("restart"), Some(Command::Relaunch));
        assert_eq!(lookup("learn"), Some(Command::Learn));
        assert_eq!(lookup("frobnicate"), None);
    }

    #[test]
    fn test_reserved_set_is_complete() {
        let expected = [
            "hire", "end", "team", "focus", "pause", "progress", "relaunch", "settings",
            "learn", "new", "use", "list", "kill", "status", "stop", "restart", "system",
            "all", "start", "help",
        ];
        let words = reserved_words();
        assert_eq!(words.len(), expected.len());
        for word in expected {
            assert!(is_reserved(word), "{word} should be reserved");
        }
    }

    #[test]
    fn test_reserved_is_case_insensitive() {
        for word in reserved_words() {
            assert!(is_reserved(&word.to_uppercase()));
        }
        assert!(is_reserved("Hire"));
        assert!(!is_reserved("alice"));
    }

    #[test]
    fn test_menu_has_eight_base_entries() {
        assert_eq!(COMMANDS.iter().filter(|s| s.in_menu).count(), 8);
    }

    #[test]
    fn test_blocked_set() {
        assert!(is_blocked_claude_command("mcp"));
        assert!(is_blocked_claude_command("approved-tools"));
        assert!(!is_blocked_claude_command("clear"));
        assert_eq!(BLOCKED_CLAUDE_COMMANDS.len(), 19);
    }
}
