use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "hotswap",
    version,
    about = "Hotswap - Watch compiled classes and resources and reload them in place",
    long_about = "Hotswap watches class and resource directories, debounces bursts of changes and hands changed classes to a redefinition backend. The CLI runs the pipeline with a backend that logs what would be redefined."
)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file (hotswap-agent.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch classpath directories
    #[command(about = "Watch classpath directories and report class and resource changes")]
    Watch(WatchArgs),

    /// Inspect a class file
    #[command(about = "Parse a class file and print its structure")]
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
pub struct WatchArgs {
    /// Classpath directories to watch
    #[arg(required = true)]
    pub dirs: Vec<PathBuf>,

    /// Debounce window for change events in milliseconds
    #[arg(long, default_value = "100")]
    pub timeout_ms: u64,

    /// Also report resources whose URI matches this pattern
    #[arg(long, value_name = "REGEX")]
    pub resources: Option<String>,

    /// Print one JSON object per line instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Path to the .class file
    pub class_file: PathBuf,

    /// Print the parsed class as JSON
    #[arg(long)]
    pub json: bool,
}
