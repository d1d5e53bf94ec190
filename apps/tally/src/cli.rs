use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tally_client_core::model::DEFAULT_VOTING_SYSTEM;
use tally_client_core::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "tally",
    about = "Story-point estimation with peers connected directly to each other",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "TALLY_SIGNALING_URL",
        help = "Websocket URL of the tally-road rendezvous server"
    )]
    pub signaling_url: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "TALLY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "TALLY_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a new estimation session as its creator
    Create(CreateArgs),
    /// Join a session someone else created
    Join(JoinArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[arg(long, value_name = "ID", help = "Participant id (random when omitted)")]
    pub user: Option<String>,

    #[arg(long, value_name = "NAME", help = "Display name shown to other participants")]
    pub name: String,

    #[arg(
        long,
        value_name = "ID",
        value_parser = parse_session_code,
        help = "Session code to use (random when omitted)"
    )]
    pub session: Option<String>,

    #[arg(long, default_value = "Planning session")]
    pub title: String,

    #[arg(long = "voting-system", default_value = DEFAULT_VOTING_SYSTEM)]
    pub voting_system: String,
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    #[arg(long, value_name = "ID", value_parser = parse_session_code)]
    pub session: String,

    #[arg(long, value_name = "ID", help = "Participant id (random when omitted)")]
    pub user: Option<String>,

    #[arg(long, value_name = "NAME")]
    pub name: String,

    #[arg(
        long,
        help = "Seed the session from the primary store (TALLY_STORE_URL / TALLY_STORE_KEY)"
    )]
    pub load: bool,
}

/// Session codes are case-insensitive; both subcommands land in the same room.
fn parse_session_code(raw: &str) -> Result<String, String> {
    let code = raw.trim().to_uppercase();
    if code.is_empty() {
        return Err("session code must not be empty".into());
    }
    Ok(code)
}
