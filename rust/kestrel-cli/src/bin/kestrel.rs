//! Kestrel CLI: inspect and verify serialized object streams.

use clap::{Parser as ClapParser, Subcommand};
use kestrel_cli::colors::{bold, gray, green, red, status_label};
use kestrel_cli::commands;
use kestrel_cli::{CliError, KestrelConfig};
use std::path::PathBuf;

#[derive(ClapParser)]
#[command(name = "kestrel", version, about = "The Kestrel virtual machine")]
struct Cli {
    /// Use this config file instead of searching for kestrel.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the instructions of a serialized stream
    Describe {
        file: PathBuf,
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rebuild every value in a stream, reporting the first malformation
    Check {
        file: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serialize JSON documents into a stream
    Encode {
        input: PathBuf,
        /// Output path
        #[arg(short, long)]
        output: PathBuf,
        /// Reject atoms the named module cannot see
        #[arg(long)]
        module: Option<String>,
    },
    /// Print the effective configuration
    Config,
    /// Create a kestrel.toml in the current directory
    Init,
}

fn main() {
    let cli = Cli::parse();
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => fail(e),
    };
    kestrel_cli::init_logging(&config.log);
    if let Err(e) = run(cli.command, &config) {
        fail(e);
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<KestrelConfig, CliError> {
    Ok(match path {
        Some(path) => KestrelConfig::load_from(path)?,
        None => KestrelConfig::load()?,
    })
}

fn run(command: Commands, config: &KestrelConfig) -> Result<(), CliError> {
    match command {
        Commands::Describe { file, json } => {
            let description = commands::cmd_describe(&file)?;
            println!("{}", commands::render_describe(&description, json)?);
        }
        Commands::Check { file, json } => {
            let report = commands::cmd_check(&file, config)?;
            if json {
                let text = serde_json::to_string_pretty(&report).map_err(|source| CliError::Json {
                    path: file.clone(),
                    source,
                })?;
                println!("{}", text);
            } else {
                let name = file.display().to_string();
                println!("{} {} {}", green("✓"), bold(&name), gray(&report.to_string()));
            }
        }
        Commands::Encode {
            input,
            output,
            module,
        } => {
            println!("{} {}", status_label("Encoding"), input.display());
            let bytes = commands::cmd_encode(&input, &output, module.as_deref(), config)?;
            println!("{} {} ({} bytes)", status_label("Wrote"), output.display(), bytes);
        }
        Commands::Config => print!("{}", commands::cmd_config(config)?),
        Commands::Init => {
            let cwd = std::env::current_dir().map_err(CliError::io("."))?;
            let path = commands::cmd_init(&cwd)?;
            println!("{} {}", status_label("Created"), path.display());
        }
    }
    Ok(())
}

fn fail(error: CliError) -> ! {
    eprintln!("{} {}", red("error:"), error);
    std::process::exit(1);
}
