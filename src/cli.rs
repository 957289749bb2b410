use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "audioshelf")]
#[command(about = "Import, deduplicate and organize an audiobook library", long_about = None)]
pub struct Cli {
    /// Increase log detail (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Import new files from the source root
    Import {
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
    },
    /// Relocate imported books into the destination layout
    Organize {
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
    },
    /// List groups of books sharing the same content hash
    Duplicates {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Block a content hash from future imports
    Block { hash: String, reason: String },
    /// Remove a hash from the blocklist
    Unblock { hash: String },
    /// List blocked hashes
    Blocked,
    /// List recorded operations, newest first
    Operations {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the log trail of one operation
    Logs {
        id: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print configuration values
    PrintConfig,
}
