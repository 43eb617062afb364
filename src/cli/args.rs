use clap::builder::styling::{AnsiColor, Styles};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::lsp::client::QueryKind;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().bold())
    .literal(AnsiColor::Cyan.on_default().bold())
    .placeholder(AnsiColor::Cyan.on_default())
    .error(AnsiColor::Red.on_default().bold());

const AFTER_HELP: &str = "\x1b[1;32mQuick Reference:\x1b[0m
  \x1b[1;36mJump from a position\x1b[0m (line and column are 1-based):
    mlsp definition main.go -l 7 -c 2        Where is this symbol defined?
    mlsp type-definition main.go -l 7 -c 2   Where is this value's type defined?
    mlsp implementation api.ts -l 3 -c 11    Who implements this interface?
    mlsp references main.go -l 7 -c 2        First usage across the workspace

  \x1b[1;36mWorkspace health:\x1b[0m
    mlsp check main.go                       Start the server and wait for its index
    mlsp interactive main.go                 Query repeatedly against warm servers";

#[derive(Parser)]
#[command(name = "mlsp")]
#[command(about = "Jump to definitions, implementations and references through language servers")]
#[command(version)]
#[command(styles = STYLES)]
#[command(after_help = AFTER_HELP)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root to use instead of detecting one from the file
    #[arg(long, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    #[arg(short, long)]
    pub verbose: bool,

    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
    pub format: OutputFormat,

    /// Seconds to wait for the language server to become ready
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

/// A file position as typed by a user.
#[derive(Args, Debug, Clone)]
pub struct PositionArgs {
    pub file: PathBuf,

    /// Line number (1-based)
    #[arg(short, long)]
    pub line: u32,

    /// Column number in characters (1-based)
    #[arg(short, long)]
    pub column: u32,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Jump to where the symbol at a position is defined
    #[command(
        long_about = "Jump to where the symbol under the cursor is defined. The language \
        server is picked from the file extension and started in the file's workspace.\n\n\
        Examples:\n  \
        mlsp definition main.go -l 7 -c 2\n  \
        mlsp --format json definition src/app.ts -l 12 -c 8"
    )]
    Definition(PositionArgs),

    /// Jump to an implementation of the interface or method at a position
    Implementation(PositionArgs),

    /// Jump to the definition of the type of the symbol at a position
    TypeDefinition(PositionArgs),

    /// Jump to the first reference of the symbol at a position
    #[command(
        long_about = "Jump to the first place the symbol under the cursor is referenced. \
        The declaration itself counts as a reference.\n\n\
        Examples:\n  \
        mlsp references main.go -l 7 -c 2"
    )]
    References(PositionArgs),

    /// Start the server for a file's workspace and wait for it to finish indexing
    Check { file: PathBuf },

    /// Interactive REPL for position queries
    Interactive { file: Option<PathBuf> },
}

impl Commands {
    /// Query kind and position for the jump commands.
    pub fn query(&self) -> Option<(QueryKind, &PositionArgs)> {
        match self {
            Self::Definition(args) => Some((QueryKind::Definition, args)),
            Self::Implementation(args) => Some((QueryKind::Implementation, args)),
            Self::TypeDefinition(args) => Some((QueryKind::TypeDefinition, args)),
            Self::References(args) => Some((QueryKind::References, args)),
            Self::Check { .. } | Self::Interactive { .. } => None,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}
