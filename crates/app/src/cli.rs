//! Command line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use duet_core::Settings;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "One-to-one chat over a small TCP host", long_about = None)]
pub struct Args {
    /// Settings file (defaults to duet.toml in the platform config directory)
    #[arg(long, global = true, env = "DUET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host address, overrides client.server_addr
    #[arg(long, global = true, env = "DUET_SERVER")]
    pub server: Option<String>,

    /// Bearer token of the local user, overrides client.token
    #[arg(long, global = true, env = "DUET_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the conversation host
    Serve {
        /// Port to listen on, overrides server.port
        #[arg(long)]
        port: Option<u16>,
    },
    /// List your conversations
    Inbox,
    /// Open the conversation with a peer
    Chat {
        /// Peer user id
        peer: String,
    },
}

impl Args {
    /// Fold command line overrides into loaded settings
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(server) = &self.server {
            settings.client.server_addr = server.clone();
        }
        if let Some(token) = &self.token {
            settings.client.token = Some(token.clone());
        }
        if let Command::Serve { port: Some(port) } = &self.command {
            settings.server.port = *port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat() {
        let args = Args::try_parse_from(["duet", "chat", "u2", "--server", "10.0.0.5:7440"]).unwrap();
        assert_eq!(args.command, Command::Chat { peer: "u2".into() });
        assert_eq!(args.server.as_deref(), Some("10.0.0.5:7440"));
    }

    #[test]
    fn test_overrides_applied() {
        let args = Args::try_parse_from(["duet", "--token", "t0k", "serve", "--port", "9000"]).unwrap();
        let mut settings = Settings::default();
        args.apply(&mut settings);

        assert_eq!(settings.client.token.as_deref(), Some("t0k"));
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.client.server_addr, "127.0.0.1:7440");
    }

    #[test]
    fn test_chat_requires_peer() {
        assert!(Args::try_parse_from(["duet", "chat"]).is_err());
    }
}
