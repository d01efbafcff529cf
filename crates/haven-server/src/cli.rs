use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "haven-server", about = "Haven request-guard service")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/haven.toml")]
    pub config: String,

    /// Listen address (overrides config)
    #[arg(long)]
    pub bind: Option<String>,

    /// Print an argon2 hash for an `[[accounts]]` entry and exit
    #[arg(long, value_name = "PASSWORD")]
    pub hash_password: Option<String>,

    /// Print a fresh backup-code pool for an `[[accounts]]` entry and exit
    #[arg(long)]
    pub backup_codes: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}
