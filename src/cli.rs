use clap::{Parser, Subcommand};

/// gatehouse — session gateway daemon with a local credential/target cache
#[derive(Parser)]
#[command(name = "gatehouse", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the cache daemon, refreshing targets periodically
    Serve,

    /// Run one cache refresh cycle and exit
    Refresh,

    /// Proxy a session: listen locally and forward connections to a worker
    Connect {
        /// The session authorization blob
        authz: String,
        /// Local listen address, e.g. 127.0.0.1:0
        #[arg(long)]
        listen_addr: Option<std::net::SocketAddr>,
    },

    /// Manage stored auth tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Inspect cached targets
    Targets {
        /// Boundary service address the token was issued by
        #[arg(long)]
        addr: String,
        /// Keyring entry name of the auth token
        #[arg(long)]
        token_name: String,
        /// Keyring kind holding the token
        #[arg(long, default_value = "file")]
        keyring_type: String,
        /// Optional filter query, e.g. "name % 'prod'"
        #[arg(long)]
        query: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Store a reference to a keyring-held auth token
    Add {
        #[arg(long)]
        addr: String,
        #[arg(long)]
        token_name: String,
        #[arg(long, default_value = "file")]
        keyring_type: String,
        #[arg(long)]
        auth_token_id: String,
    },
    /// List stored tokens
    List,
    /// Delete a stored token
    Delete {
        #[arg(long)]
        token_name: String,
        #[arg(long, default_value = "file")]
        keyring_type: String,
    },
}
