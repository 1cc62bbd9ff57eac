use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use feedback_common::{Config, Environment, NodeType};
use feedback_graph::{ClusteringJob, LlmTopicNamer, ScoreReport, Storage};

#[derive(Parser)]
#[command(name = "feedback-admin", about = "Operator tools for the feedback graph")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Delete every node and vector of an environment
    Reset {
        /// Environment to wipe; must match APP_ENV
        environment: Environment,
        /// Repeat the environment name to confirm
        #[arg(long)]
        confirm: String,
    },
    /// Group embedded nodes into topics
    Cluster {
        #[arg(value_enum, default_value_t = Kind::Observations)]
        target: Kind,
        /// Delete existing topics first (observations only)
        #[arg(long)]
        full_rebuild: bool,
    },
    /// Find nodes whose text is similar to a query
    Search {
        query: String,
        #[arg(long, value_enum, default_value_t = Kind::Observations)]
        kind: Kind,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
        #[arg(long, default_value_t = 0.0)]
        min_score: f32,
    },
    /// Print the debounce timestamps
    AppState,
    /// Mean score per score name for observations
    Scores,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    FeedbackItems,
    Observations,
    ActionItems,
    Topics,
}

impl From<Kind> for NodeType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::FeedbackItems => NodeType::FeedbackItem,
            Kind::Observations => NodeType::Observation,
            Kind::ActionItems => NodeType::ActionItem,
            Kind::Topics => NodeType::Topic,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("feedback=info".parse()?))
        .init();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.log_redacted();

    let storage = Arc::new(Storage::connect(&config).await?);
    info!(environment = %storage.environment(), "Connected to storage");

    match cli.command {
        Command::Reset { environment, confirm } => {
            if environment != config.environment {
                bail!("APP_ENV is {}, refusing to reset {environment}", config.environment);
            }
            storage.reset_storage(environment, &confirm).await?;
            info!(%environment, "Storage reset");
        }
        Command::Cluster { target, full_rebuild } => {
            let namer = Arc::new(LlmTopicNamer::new(&config.openai_api_key, &config.topic_model));
            let stats = ClusteringJob::new(storage, namer, target.into())?
                .with_full_rebuild(full_rebuild)
                .run()
                .await?;
            println!("{stats}");
        }
        Command::Search {
            query,
            kind,
            top_k,
            min_score,
        } => {
            let results = storage
                .search_semantically(kind.into(), &query, top_k, min_score)
                .await?;
            if results.is_empty() {
                println!("No matches");
            }
            for (node, score) in results.iter() {
                println!("{score:.3}  {}  {}", node.id(), node.embedding_text().unwrap_or(""));
            }
        }
        Command::AppState => {
            let state = storage.get_app_state().await?;
            for (key, at) in &state.stamps {
                println!("{key:<40} {at}");
            }
        }
        Command::Scores => {
            let report = ScoreReport::build(&storage, NodeType::Observation).await?;
            print!("{report}");
        }
    }

    Ok(())
}
