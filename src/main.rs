use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use chunk_weaver::config::settings_io::{load_settings, save_settings, settings_path};
use chunk_weaver::engine::figures::FileFigureSink;
use chunk_weaver::engine::kernel_client::HttpKernel;
use chunk_weaver::{
    Chunk, ContentWithOptions, DocumentPaths, Engine, NormalizedWhitespace, RawContent,
};

#[derive(Parser)]
#[command(name = "chunk_weaver")]
#[command(about = "Execute the code chunks of a parsed literate document")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run parsed chunks (a JSON array) and write the executed chunks
    Weave {
        /// Parser output to execute
        chunks: PathBuf,

        /// Source document the chunks came from; names the cache file
        #[arg(long)]
        document: Option<PathBuf>,

        /// Where to write executed chunks (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Enable result caching
        #[arg(long, conflicts_with = "no_cache")]
        cache: bool,

        /// Disable result caching
        #[arg(long)]
        no_cache: bool,

        #[arg(long)]
        cache_dir: Option<PathBuf>,

        #[arg(long)]
        fig_dir: Option<PathBuf>,

        /// Per-call timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long)]
        kernel_url: Option<String>,

        /// Kernel name to start
        #[arg(long)]
        kernel: Option<String>,

        #[arg(long, value_enum, default_value = "raw")]
        comparison: Comparison,
    },

    /// Show the settings file, optionally writing the defaults to it
    Settings {
        #[arg(long)]
        save: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Comparison {
    Raw,
    Normalized,
    Options,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_module("reqwest", log::LevelFilter::Warn)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Weave {
            chunks,
            document,
            output,
            cache,
            no_cache,
            cache_dir,
            fig_dir,
            timeout,
            kernel_url,
            kernel,
            comparison,
        } => {
            let mut settings = load_settings();
            if cache {
                settings.caching = true;
            }
            if no_cache {
                settings.caching = false;
            }
            if let Some(dir) = cache_dir {
                settings.cache_dir = dir;
            }
            if let Some(dir) = fig_dir {
                settings.fig_dir = dir;
            }
            if timeout.is_some() {
                settings.timeout_secs = timeout;
            }
            if let Some(url) = kernel_url {
                settings.kernel_url = url;
            }
            if let Some(name) = kernel {
                settings.kernel_name = name;
            }

            let text = fs::read_to_string(&chunks)
                .with_context(|| format!("reading {}", chunks.display()))?;
            let parsed: Vec<Chunk> = serde_json::from_str(&text)
                .with_context(|| format!("parsing chunks from {}", chunks.display()))?;

            let document = DocumentPaths::new(document.unwrap_or(chunks));
            let figures = FileFigureSink::new(document.fig_dir(&settings), document.basename.clone());
            let backend = HttpKernel::new(&settings)?;

            let engine = Engine::new(backend, settings, document).with_figure_sink(figures);
            let mut engine = match comparison {
                Comparison::Raw => engine.with_comparison(RawContent),
                Comparison::Normalized => engine.with_comparison(NormalizedWhitespace),
                Comparison::Options => engine.with_comparison(ContentWithOptions),
            };

            let executed = engine.run(&parsed)?;
            let json = serde_json::to_string_pretty(&executed)?;

            match output {
                Some(path) => fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", json),
            }
        }

        Commands::Settings { save } => {
            let settings = load_settings();
            if save {
                save_settings(&settings)?;
                log::info!("Saved settings to {}", settings_path().display());
            }
            println!("# {}", settings_path().display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}
