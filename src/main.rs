use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use depot::config::{config_path, Config};
use depot::engine::StrategyMode;
use depot::oci::OciReference;
use depot::resolver::Transport;
use depot::transfer::progress::format_bytes;
use depot::{Context, PathMode, ResolvedModel, Resolver};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Resolve, verify and cache model artifacts", long_about = None)]
struct Cli {
    /// Store root (overrides config)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Container engine binary (overrides config)
    #[arg(long, global = true)]
    engine: Option<String>,

    /// auto, artifact, image or http
    #[arg(long, global = true)]
    strategy: Option<String>,

    /// Backend for references without a prefix
    #[arg(long, global = true)]
    default_transport: Option<String>,

    /// Hide progress bars
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a model into the store
    Pull {
        reference: String,
        /// Draft model for speculative decoding
        #[arg(long)]
        draft: Option<String>,
    },
    /// Remove a model's tag from the store
    Rm {
        reference: String,
        /// Do not fail when the model is not present
        #[arg(long)]
        ignore: bool,
    },
    /// List pulled models
    Ls,
    /// Print the path of a pulled model
    Path {
        reference: String,
        /// Path as seen inside a container
        #[arg(long)]
        container: bool,
    },
    /// Delete blobs no ref points at
    Gc,
    /// Show which strategy an OCI reference resolves to
    Strategy { reference: String },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("depot=info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load().with_context(|| format!("loading {}", config_path().display()))?;
    if let Some(store) = &cli.store {
        config.store.path.clone_from(store);
    }
    if let Some(engine) = &cli.engine {
        config.engine.binary = Some(engine.clone());
    }
    if let Some(strategy) = &cli.strategy {
        strategy.parse::<StrategyMode>()?;
        config.engine.strategy.clone_from(strategy);
    }
    if let Some(transport) = &cli.default_transport {
        Transport::from_name(transport)?;
        config.transport.default.clone_from(transport);
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let ctx = Context::new(config)?.quiet(cli.quiet);
    let resolver = Resolver::new(&ctx)?;

    match cli.command {
        Commands::Pull { reference, draft } => {
            let model = resolver.resolve_with_draft(&reference, draft.as_deref())?;
            print_model(&model)?;
        }
        Commands::Rm { reference, ignore } => {
            let removed = resolver.remove(&reference)?;
            if !removed && !ignore {
                anyhow::bail!("{reference} is not in the store");
            }
        }
        Commands::Ls => list(&ctx)?,
        Commands::Path { reference, container } => {
            let mode = if container { PathMode::Container } else { PathMode::Host };
            let model = resolver.lookup(&reference)?;
            println!("{}", model.entry_path(mode)?.display());
        }
        Commands::Gc => {
            let report = ctx.store().collect_garbage()?;
            println!(
                "Removed {} blob(s) and {} snapshot dir(s), reclaimed {}; {} blob(s) still referenced",
                report.removed_blobs.len(),
                report.removed_snapshots,
                format_bytes(report.reclaimed_bytes),
                report.kept_blobs
            );
        }
        Commands::Strategy { reference } => {
            let oci: OciReference = reference.parse()?;
            let strategies = resolver.strategies();
            let caps = strategies.capabilities();
            match strategies.engine() {
                Some(engine) => println!(
                    "engine:     {} ({})",
                    engine.binary().display(),
                    caps.engine_version.map_or_else(|| "unknown version".to_string(), |v| v.to_string())
                ),
                None => println!("engine:     none"),
            }
            let order: Vec<String> = caps.strategy_order.iter().map(ToString::to_string).collect();
            println!("supported:  {}", order.join(", "));
            println!("selected:   {}", strategies.resolve(&oci)?);
        }
    }
    Ok(())
}

fn print_model(model: &ResolvedModel) -> Result<()> {
    if let Some(kind) = model.strategy() {
        println!("strategy:   {kind}");
    }
    match model.entry_path(PathMode::Host) {
        Ok(path) => println!("model:      {}", path.display()),
        Err(_) => println!("model:      {}", model.entry_path(PathMode::Container)?.display()),
    }
    if let Some(path) = model.mmproj_path(PathMode::Host).ok().flatten() {
        println!("mmproj:     {}", path.display());
    }
    if let Some(path) = model.chat_template_path(PathMode::Host).ok().flatten() {
        println!("template:   {}", path.display());
    }
    if let Some(path) = model.draft_path(PathMode::Host).ok().flatten() {
        println!("draft:      {}", path.display());
    }
    println!("mount:      {}", model.mount_argument(model.mount_dir())?);
    Ok(())
}

fn list(ctx: &Context) -> Result<()> {
    let models = ctx.store().list_models()?;
    if models.is_empty() {
        println!("No models in {}", ctx.store().root().display());
        return Ok(());
    }
    for listing in models {
        println!(
            "{:<60} {:>10}  {}",
            listing.reference(),
            format_bytes(listing.size_bytes),
            listing.ref_file.pulled_at
        );
    }
    Ok(())
}
