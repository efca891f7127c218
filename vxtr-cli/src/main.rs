use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vxtr_core::TaskKind;
use vxtr_core::load_or_initialize_config;

mod commands;
mod view;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTask {
    Profile,
    Receipt,
    Age,
    Describe,
    Statement,
}

impl From<CliTask> for TaskKind {
    fn from(task: CliTask) -> Self {
        match task {
            CliTask::Profile => TaskKind::ProfileExtraction,
            CliTask::Receipt => TaskKind::ReceiptExtraction,
            CliTask::Age => TaskKind::AgeClassification,
            CliTask::Describe => TaskKind::Description,
            CliTask::Statement => TaskKind::StatementExtraction,
        }
    }
}

#[derive(Parser)]
#[command(name = "vxtr")]
#[command(about = "Structured extraction from images", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[arg(long, short, global = true, help = "Show verbose debug output")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Extract structured data from one image")]
    Extract {
        #[arg(long, value_enum, help = "Task kind to run")]
        task: CliTask,

        #[arg(long, help = "Image file, http(s) URL, or '-' for stdin")]
        image: String,

        #[arg(long, help = "Extra context appended to the prompt")]
        note: Option<String>,

        #[arg(long, help = "Override the configured attempt budget")]
        attempts: Option<u32>,

        #[arg(long, help = "Pretty-print the record instead of one line")]
        pretty: bool,

        #[arg(long, short, help = "Write the record to a file instead of stdout")]
        output: Option<PathBuf>,

        #[arg(long, help = "Append to the output file instead of overwriting")]
        append: bool,
    },

    #[command(about = "Run a JSONL manifest of extractions, one record per line")]
    Batch {
        #[arg(help = "Manifest with one {\"task\", \"image\", \"note\"?} object per line")]
        manifest: PathBuf,

        #[arg(long, short, help = "Write JSONL results to a file instead of stdout")]
        output: Option<PathBuf>,

        #[arg(long, help = "Append to the output file instead of overwriting")]
        append: bool,
    },

    #[command(about = "Inspect a JSONL results file as a table")]
    View {
        #[arg(help = "Results file written by extract --output or batch")]
        file: PathBuf,

        #[arg(long, help = "Comma-separated columns to show, e.g. place_name,total")]
        columns: Option<String>,

        #[arg(long, help = "Row filter such as 'total >= 10' or 'date == 05/03/2024'")]
        filter: Option<String>,

        #[arg(long, help = "Column to sort by")]
        sort: Option<String>,

        #[arg(long, requires = "sort", help = "Sort descending")]
        desc: bool,

        #[arg(long, default_value_t = 20, help = "Maximum rows to show")]
        limit: usize,

        #[arg(long, help = "Print column and missing-value counts instead of rows")]
        stats: bool,

        #[arg(long, help = "Write the filtered rows to a JSONL file")]
        export: Option<PathBuf>,
    },

    #[command(about = "List registered task kinds and their fields")]
    Tasks,

    #[command(about = "Print a config override skeleton for a task schema")]
    Schema {
        #[arg(value_enum, help = "Task kind")]
        task: CliTask,
    },
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("vxtr error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    // Exit code 2 is reserved for exhausted validation, so argument errors
    // are mapped to 1 instead of clap's default.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            err.print()?;
            return Ok(code);
        }
    };
    init_tracing(cli.verbose);

    let bundle = load_or_initialize_config("vxtr")?;
    debug!(config = %bundle.paths.config_file.display(), "configuration loaded");

    match cli.command {
        Commands::Extract {
            task,
            image,
            note,
            attempts,
            pretty,
            output,
            append,
        } => {
            let options = commands::ExtractOptions {
                task: task.into(),
                note,
                attempts,
                pretty,
                output,
                append,
            };
            commands::handle_extract(&bundle, &image, options).await
        }
        Commands::Batch {
            manifest,
            output,
            append,
        } => commands::handle_batch(&bundle, &manifest, output.as_deref(), append).await,
        Commands::View {
            file,
            columns,
            filter,
            sort,
            desc,
            limit,
            stats,
            export,
        } => {
            let options = view::ViewOptions {
                columns,
                filter,
                sort,
                desc,
                limit,
                stats,
                export,
            };
            view::handle_view(&file, options)
        }
        Commands::Tasks => commands::handle_tasks(&bundle),
        Commands::Schema { task } => commands::handle_schema(&bundle, task.into()),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "vxtr=debug,vxtr_core=debug"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Diagnostics go to stderr so stdout stays pure JSON.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
