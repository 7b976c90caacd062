// CLI application
use baretk_cli::commands;
use baretk_core::Language;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "baretk")]
#[command(about = "Load, disassemble and decompile ELF and PE executables")]
#[command(version)]
struct Cli {
    /// JSON file with analysis settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Disassembly listing
    Dis {
        /// Input executable
        input: PathBuf,

        /// Output file (default: stdout)
        output: Option<PathBuf>,
    },
    /// Decompile to pseudocode or C
    Decomp {
        /// Input executable
        input: PathBuf,

        /// Output file (default: stdout)
        output: Option<PathBuf>,

        /// Output language: C, c, pseudo or pseudocode
        #[arg(long, default_value = "pseudocode")]
        lang: Language,
    },
    /// Segment and section tables
    Dump {
        /// Input executable
        input: PathBuf,

        /// Output file (default: stdout)
        output: Option<PathBuf>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// ASCII strings in the raw file
    Strings {
        /// Input file
        input: PathBuf,

        /// Output file (default: stdout)
        output: Option<PathBuf>,

        /// Minimum string length (default: 4, or the config value)
        #[arg(short = 'n', long = "min-len")]
        min_len: Option<usize>,

        /// Do not accept line breaks inside strings
        #[arg(long)]
        printable: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Dis { input, output } => {
            let pb = create_progress_bar("Disassembling...");
            let result = commands::disassemble(&input, output.as_deref(), &config);
            pb.finish_and_clear();
            result?;
        }
        Commands::Decomp {
            input,
            output,
            lang,
        } => {
            let pb = create_progress_bar("Decompiling...");
            let result = commands::decompile(&input, output.as_deref(), lang, &config);
            pb.finish_and_clear();
            result?;
        }
        Commands::Dump {
            input,
            output,
            json,
        } => {
            commands::dump(&input, output.as_deref(), json)?;
        }
        Commands::Strings {
            input,
            output,
            min_len,
            printable,
        } => {
            commands::strings(&input, output.as_deref(), min_len, printable, &config)?;
        }
    }

    Ok(())
}

fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
