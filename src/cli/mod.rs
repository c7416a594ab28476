use std::env;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::app::App;
use crate::config::ConfigLoader;
use crate::storage;

pub mod commands;

use self::commands::{DayArgs, DeleteArgs, MonthArgs, WriteArgs};

#[derive(Parser, Debug)]
#[command(
    name = "notecal",
    version,
    about = "Shared calendar with one note per day"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over NOTECAL_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over NOTECAL_DATA)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a month grid with its notes (default)
    Month(MonthArgs),
    /// Print the note for one day
    Show(DayArgs),
    /// Claim a free day with a note
    Add(WriteArgs),
    /// Replace the text of your own note
    Edit(WriteArgs),
    /// Delete your own note
    Delete(DeleteArgs),
    /// Print your user id and the active storage backend
    Whoami,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var("NOTECAL_CONFIG", path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var("NOTECAL_DATA", path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let storage = storage::init(&paths, &config.storage)?;

    let mut app = App::new(Arc::new(config), storage)?;
    let result = execute(&mut app, cli.command);
    for warning in app.sync() {
        eprintln!("warning: {warning}");
    }
    app.shutdown();
    result
}

fn execute(app: &mut App, command: Option<Commands>) -> Result<()> {
    for warning in app.sync() {
        eprintln!("warning: {warning}");
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match command.unwrap_or_else(|| Commands::Month(MonthArgs::default())) {
        Commands::Month(args) => commands::show_month(app, args, &mut out),
        Commands::Show(args) => commands::show_day(app, args, &mut out),
        Commands::Add(args) => commands::add_message(app, args, &mut out),
        Commands::Edit(args) => commands::edit_message(app, args, &mut out),
        Commands::Delete(args) => commands::delete_message(app, args, &mut out),
        Commands::Whoami => commands::whoami(app, &mut out),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
