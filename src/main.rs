use clap::{Parser, Subcommand};
use light_reid::config::RunConfig;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "light-reid")]
#[command(about = "Train and evaluate compact person re-identification models")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log debug events as well.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train with a JSON run configuration.
    Train { config: PathBuf },
    /// Evaluate the newest checkpoint of a run.
    Eval {
        config: PathBuf,
        /// Compute distances one query at a time.
        #[arg(long)]
        onebyone: bool,
        /// Also write the precision-recall curve.
        #[arg(long)]
        pr: bool,
        /// Write the top-k ranked gallery samples of every query.
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Train on generated identities.
    Demo {
        #[arg(default_value = "./out/")]
        results_dir: PathBuf,
        /// Save the demo configuration here instead of running it.
        #[arg(long)]
        write_config: Option<PathBuf>,
        #[arg(long)]
        light_model: bool,
        #[arg(long)]
        light_feat: bool,
        #[arg(long)]
        light_search: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (mean_ap, cmc) = match cli.command {
        Command::Train { config } => light_reid::train(&RunConfig::load(config)?)?,
        Command::Eval {
            config,
            onebyone,
            pr,
            top_k,
        } => light_reid::evaluate(&RunConfig::load(config)?, onebyone, pr, top_k)?,
        Command::Demo {
            results_dir,
            write_config,
            light_model,
            light_feat,
            light_search,
        } => {
            let config = RunConfig {
                light_model,
                light_feat,
                light_search,
                ..RunConfig::demo(results_dir)
            };
            if let Some(path) = write_config {
                config.save(&path)?;
                tracing::info!(path = %path.display(), "demo configuration written");
                return Ok(());
            }
            light_reid::train(&config)?
        }
    };
    tracing::info!(
        mean_ap,
        rank1 = cmc.first().copied().unwrap_or(0.),
        "evaluation finished"
    );
    Ok(())
}
