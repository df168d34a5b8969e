//! goalrunner - inspect persisted turns and workflow definitions.

use clap::{Parser, Subcommand};
use goalrunner::{
    config::Config,
    state::TurnId,
    store::{create_turn_store, TurnRecord},
    workflow::WorkflowLibrary,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "goalrunner")]
#[command(about = "Inspect goalrunner turns", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List recent turns")]
    List {
        #[arg(long, default_value_t = 20, help = "Maximum number of turns to show")]
        limit: usize,

        #[arg(long, default_value_t = 0, help = "Number of turns to skip")]
        offset: usize,
    },

    #[command(about = "Print one turn document as JSON")]
    Show {
        #[arg(help = "Turn id")]
        id: String,
    },

    #[command(about = "List turns left running by a crash or shutdown")]
    Incomplete,

    #[command(about = "Validate and list the configured workflow library")]
    Workflows,
}

fn summary_line(turn: &TurnRecord) -> String {
    let request: String = turn.request.chars().take(60).collect();
    format!(
        "{}  {:<20}  {}  {}",
        turn.id,
        turn.status.to_string(),
        turn.updated_at,
        request
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "goalrunner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: store={:?}, data_dir={}",
        config.store.backend,
        config.store.data_dir.display()
    );

    if let Commands::Workflows = cli.command {
        let Some(dir) = &config.workflow.dir else {
            anyhow::bail!("GOALRUNNER_WORKFLOW_DIR is not set");
        };
        let library = WorkflowLibrary::load_dir(dir).await?;
        for name in library.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let store = create_turn_store(&config.store)
        .await
        .map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::List { limit, offset } => {
            for turn in store.list_turns(limit, offset).await.map_err(anyhow::Error::msg)? {
                println!("{}", summary_line(&turn));
            }
        }
        Commands::Show { id } => {
            let id: TurnId = id.parse()?;
            let Some(turn) = store.get_turn(id).await.map_err(anyhow::Error::msg)? else {
                anyhow::bail!("Turn {} not found", id);
            };
            println!("{}", serde_json::to_string_pretty(&turn)?);
        }
        Commands::Incomplete => {
            let turns = store.get_incomplete_turns().await.map_err(anyhow::Error::msg)?;
            if turns.is_empty() {
                info!("No incomplete turns");
            }
            for turn in turns {
                println!("{}", summary_line(&turn));
            }
        }
        Commands::Workflows => {}
    }

    Ok(())
}
