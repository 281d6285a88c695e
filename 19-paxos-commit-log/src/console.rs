//! Operator console commands read from stdin by the replica binary.

use anyhow::{Result, bail};

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Graceful shutdown.
    Quit,
    Status,
    Help,
}

impl ConsoleCommand {
    /// Parses one line. Case-insensitive; `exit`, `q`, `s` and `h` are aliases.
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            bail!("empty command");
        };
        let command = match first.to_lowercase().as_str() {
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            "status" | "s" => ConsoleCommand::Status,
            "help" | "h" | "?" => ConsoleCommand::Help,
            other => bail!("unknown command '{other}'. Try: status, help, quit"),
        };
        if words.next().is_some() {
            bail!("'{first}' takes no arguments");
        }
        Ok(command)
    }

    pub fn usage() -> &'static str {
        "commands:\n  status (s)      show replica id, address and tail commit\n  help (h)        show this text\n  quit/exit (q)   shut the replica down"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_commands() {
        assert_eq!(ConsoleCommand::parse("quit").unwrap(), ConsoleCommand::Quit);
        assert_eq!(ConsoleCommand::parse("EXIT").unwrap(), ConsoleCommand::Quit);
        assert_eq!(ConsoleCommand::parse("  Status ").unwrap(), ConsoleCommand::Status);
        assert_eq!(ConsoleCommand::parse("HeLp").unwrap(), ConsoleCommand::Help);
    }

    #[test]
    fn aliases() {
        assert_eq!(ConsoleCommand::parse("q").unwrap(), ConsoleCommand::Quit);
        assert_eq!(ConsoleCommand::parse("s").unwrap(), ConsoleCommand::Status);
        assert_eq!(ConsoleCommand::parse("h").unwrap(), ConsoleCommand::Help);
    }

    #[test]
    fn rejects_empty_unknown_and_extra_words() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("commit").is_err());
        assert!(ConsoleCommand::parse("status now").is_err());
    }
}
