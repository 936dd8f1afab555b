use clap::{Parser, Subcommand};
use pictor::context::ProcessingContext;
use pictor::params::TagParams;
use pictor::pipeline::Pipeline;
use pictor::pipeline::stages::Initialize;
use pictor::services::ServiceBundle;
use pictor::{action, cache, config, output};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pictor")]
#[command(about = "On-demand image transformation and cache pipeline")]
#[command(long_about = "\
On-demand image transformation and cache pipeline

Parameters are given as key=value pairs, the same ones a template tag takes:

  pictor render src=photo.jpg width=300 height=200 fit=crop
  pictor render src=photo.jpg width=800 srcset=320|640 lazy=lqip
  pictor render src=photo.jpg palette=yes palette_size=5
  pictor render colour_fill=#336699 width=40 url_only=yes

Artifacts are written to the cache directory of the chosen connection
(default: ./public/images/cache) and reused until their freshness window
expires. Run 'pictor gen-config' to generate a documented pictor.toml.")]
#[command(version)]
struct Cli {
    /// Settings file
    #[arg(long, default_value = config::SETTINGS_FILENAME, global = true)]
    config: PathBuf,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline for one set of parameters and print the result
    Render {
        /// key=value parameters
        params: Vec<String>,
        /// Render this template with the output variables instead of a tag
        #[arg(long)]
        tag_data: Option<String>,
        /// Print the run's metadata as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve a signed action-link packet
    Fetch {
        #[arg(long)]
        packet: String,
        #[arg(long)]
        sig: String,
        /// Write the image here
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Print the cache key and artifact name for a set of parameters
    Key {
        /// key=value parameters
        params: Vec<String>,
    },
    /// Inspect or clear a cache directory
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
        /// Connection to use (default: the configured default)
        #[arg(long, global = true)]
        connection: Option<String>,
    },
    /// Print a stock pictor.toml with all options documented
    GenConfig,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// List artifacts with their log rows
    List,
    /// Delete every artifact and the cache log
    Clear,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config;
    let services = || -> Result<Arc<ServiceBundle>, config::ConfigError> {
        let settings = config::load_settings_file(&config_path)?;
        Ok(Arc::new(ServiceBundle::from_settings(settings)))
    };

    match cli.command {
        Command::Render {
            params,
            tag_data,
            json,
        } => {
            let params = TagParams::from_args(&params);
            let mut ctx = ProcessingContext::paired(params, tag_data, None);
            Pipeline::standard(services()?).run(&mut ctx)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ctx.metadata)?);
            } else {
                output::print_render_output(&ctx);
            }
        }
        Command::Fetch { packet, sig, out } => {
            let response = action::serve_packet(&services()?, &packet, &sig);
            if response.status != 200 {
                output::print_fetch_output(&response, None);
                return Err(format!("direct fetch failed with HTTP {}", response.status).into());
            }
            match out {
                Some(path) => {
                    std::fs::write(&path, &response.body)?;
                    output::print_fetch_output(&response, Some(&path.display().to_string()));
                }
                None => output::print_fetch_output(&response, None),
            }
        }
        Command::Key { params } => {
            let mut ctx = ProcessingContext::new(TagParams::from_args(&params));
            Pipeline::new()
                .with_stage(Initialize::new(services()?))
                .run(&mut ctx)?;
            println!("{}", ctx.cache_key());
            println!("{}_{}", ctx.base_identifier(), ctx.cache_key());
        }
        Command::Cache { action, connection } => {
            let services = services()?;
            let (name, storage) = services.connections.get(connection.as_deref())?;
            let dir = services.settings.cache.dir.trim_matches('/');
            match action {
                CacheCommand::List => {
                    println!("==> {name}: {dir}");
                    let artifacts = cache::list_artifacts(&services.cache_log, storage, dir)?;
                    output::print_cache_list(&artifacts);
                }
                CacheCommand::Clear => {
                    let removed = services.cache_log.clear(storage, dir)?;
                    println!("{}", output::format_cache_cleared(dir, removed));
                }
            }
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
