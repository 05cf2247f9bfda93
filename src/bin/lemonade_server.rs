//! `lemonade-server`: serve the gateway or drive a running one.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use lemonade::api::{self, AppState};
use lemonade::client::ServerClient;
use lemonade::config::{ModelCaps, ServerConfig};
use lemonade::hardware::SystemOracle;
use lemonade::realtime::RealtimeSessionManager;
use lemonade::registry::{ModelRegistry, RECIPES};
use lemonade::router::Router;
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Lemonade Server: local OpenAI-compatible inference gateway.
#[derive(Parser)]
#[command(name = "lemonade-server", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server.
    Serve(ServeArgs),

    /// Start the server and load a model.
    Run {
        /// The model to load.
        model: String,
        #[command(flatten)]
        serve: ServeArgs,
    },

    /// List available models.
    List {
        /// Include models that are not downloaded yet.
        #[arg(long)]
        show_all: bool,
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Download a model (registering it first when new).
    Pull {
        /// The model to download.
        model: String,
        /// HuggingFace checkpoint (`org/model:variant`) or an absolute
        /// local directory to import.
        #[arg(long)]
        checkpoint: Option<String>,
        /// Recipe for new registrations.
        #[arg(long)]
        recipe: Option<String>,
        /// Tag the model as a reasoning model.
        #[arg(long)]
        reasoning: bool,
        /// Tag the model as vision-capable.
        #[arg(long)]
        vision: bool,
        /// Tag the model as an embeddings model.
        #[arg(long)]
        embedding: bool,
        /// Tag the model as a reranking model.
        #[arg(long)]
        reranking: bool,
        /// Multimodal projector filename.
        #[arg(long)]
        mmproj: Option<String>,
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Delete a model.
    Delete {
        /// The model to delete.
        model: String,
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Show whether a server is running.
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Stop a running server.
    Stop {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// List the supported backend recipes.
    Recipes,
}

#[derive(Args)]
struct ServeArgs {
    /// Port number to serve on.
    #[arg(long, env = "LEMONADE_PORT", default_value_t = 8000)]
    port: u16,

    /// Address to bind for connections.
    #[arg(long, env = "LEMONADE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Log level for the server.
    #[arg(long, env = "LEMONADE_LOG_LEVEL", default_value = "info",
          value_parser = ["critical", "error", "warning", "info", "debug", "trace"])]
    log_level: String,

    /// Context size for text backends.
    #[arg(long, env = "LEMONADE_CTX_SIZE", default_value_t = 4096)]
    ctx_size: u32,

    /// Max loaded models: LLMS [EMBEDDINGS] [RERANKINGS] [AUDIO] [IMAGE].
    #[arg(long, value_name = "N [E] [R] [A] [I]", num_args = 1..=5)]
    max_loaded_models: Option<Vec<usize>>,

    /// Secondary directory to scan for loose GGUF model files.
    #[arg(long, env = "LEMONADE_EXTRA_MODELS_DIR")]
    extra_models_dir: Option<String>,

    /// llama.cpp backend variant (vulkan | rocm | metal | cpu).
    #[arg(long = "llamacpp", env = "LEMONADE_LLAMACPP")]
    llamacpp: Option<String>,

    /// Disable UDP broadcasting on private networks.
    #[arg(long, env = "LEMONADE_NO_BROADCAST")]
    no_broadcast: bool,

    /// Start without the tray (the gateway is always headless; accepted
    /// for compatibility).
    #[arg(long)]
    no_tray: bool,

    /// Skip all network access; serve from cached artifacts only.
    #[arg(long, env = "LEMONADE_OFFLINE")]
    offline: bool,
}

#[derive(Args)]
struct ClientArgs {
    /// Server port.
    #[arg(long, env = "LEMONADE_PORT", default_value_t = 8000)]
    port: u16,

    /// Server host.
    #[arg(long, default_value = "localhost")]
    host: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => serve(args, None).await,
        Command::Run { model, serve: args } => serve(args, Some(model)).await,
        Command::List { show_all, client } => list(&client, show_all).await,
        Command::Pull {
            model,
            checkpoint,
            recipe,
            reasoning,
            vision,
            embedding,
            reranking,
            mmproj,
            client,
        } => {
            let mut body = json!({ "model": model });
            if let Some(checkpoint) = checkpoint {
                body["checkpoint"] = json!(checkpoint);
            }
            if let Some(recipe) = recipe {
                body["recipe"] = json!(recipe);
            }
            body["reasoning"] = json!(reasoning);
            body["vision"] = json!(vision);
            body["embedding"] = json!(embedding);
            body["reranking"] = json!(reranking);
            if let Some(mmproj) = mmproj {
                body["mmproj"] = json!(mmproj);
            }
            pull(&client, body).await
        }
        Command::Delete { model, client } => delete(&client, &model).await,
        Command::Status { client } => status(&client).await,
        Command::Stop { client } => stop(&client).await,
        Command::Recipes => {
            for recipe in RECIPES {
                println!("{recipe}");
            }
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn serve(args: ServeArgs, run_model: Option<String>) -> anyhow::Result<()> {
    init_tracing(&args.log_level);

    let mut config = ServerConfig::from_env();
    config.host = args.host;
    config.port = args.port;
    config.log_level = args.log_level;
    config.ctx_size = args.ctx_size;
    config.no_broadcast |= args.no_broadcast;
    config.offline |= args.offline;
    if let Some(backend) = args.llamacpp {
        config.llamacpp_backend = backend;
    }
    if let Some(dir) = args.extra_models_dir {
        config.extra_models_dir = Some(dir);
    }
    if let Some(values) = args.max_loaded_models {
        config.caps = ModelCaps::from_values(&values).context("invalid --max-loaded-models")?;
    }

    let oracle = Arc::new(SystemOracle::new());
    let registry = Arc::new(
        ModelRegistry::new(
            oracle.clone(),
            config.extra_models_dir.clone().map(Into::into),
            config.offline,
        )
        .context("failed to load model catalogue")?,
    );
    let router = Arc::new(Router::new(registry, oracle, config.clone()));
    let sessions = Arc::new(RealtimeSessionManager::new(Arc::clone(&router)));

    let state = AppState {
        router: Arc::clone(&router),
        sessions,
        shutdown: Arc::new(tokio::sync::Notify::new()),
    };

    if let Some(model) = run_model {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            match router.load_model(&model, true).await {
                Ok(loaded) => {
                    tracing::info!(model = %loaded.name(), "model loaded at startup")
                }
                Err(e) => tracing::error!(model = %model, error = %e, "startup load failed"),
            }
        });
    }

    api::serve(state, &config.host, config.port)
        .await
        .context("server failed")?;
    Ok(())
}

async fn list(client_args: &ClientArgs, show_all: bool) -> anyhow::Result<()> {
    let client = ServerClient::new(&client_args.host, client_args.port);
    let models = client.list_models(show_all).await?;
    if models.is_empty() {
        println!("No models.");
        return Ok(());
    }
    for model in models {
        let id = model.get("id").and_then(|v| v.as_str()).unwrap_or("?");
        let recipe = model.get("recipe").and_then(|v| v.as_str()).unwrap_or("?");
        let downloaded = model
            .get("downloaded")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let marker = if downloaded { "downloaded" } else { "available" };
        println!("{id:<48} {recipe:<12} {marker}");
    }
    Ok(())
}

async fn pull(client_args: &ClientArgs, body: serde_json::Value) -> anyhow::Result<()> {
    let client = ServerClient::new(&client_args.host, client_args.port);
    anyhow::ensure!(
        client.is_running().await,
        "no server running on {}:{} (start one with `lemonade-server serve`)",
        client_args.host,
        client_args.port
    );
    client.pull(body).await?;
    Ok(())
}

async fn delete(client_args: &ClientArgs, model: &str) -> anyhow::Result<()> {
    let client = ServerClient::new(&client_args.host, client_args.port);
    client.delete(model).await?;
    println!("Deleted {model}.");
    Ok(())
}

async fn status(client_args: &ClientArgs) -> anyhow::Result<()> {
    let client = ServerClient::new(&client_args.host, client_args.port);
    if !client.is_running().await {
        println!("Server is not running.");
        return Ok(());
    }
    let health = client.health().await?;
    let loaded = health
        .get("all_models_loaded")
        .and_then(|v| v.as_array())
        .map(|v| v.len())
        .unwrap_or(0);
    println!(
        "Server is running on port {} ({loaded} model(s) loaded).",
        client_args.port
    );
    Ok(())
}

async fn stop(client_args: &ClientArgs) -> anyhow::Result<()> {
    let client = ServerClient::new(&client_args.host, client_args.port);
    if !client.is_running().await {
        println!("Server is not running.");
        return Ok(());
    }
    client.stop().await?;
    println!("Server stopped.");
    Ok(())
}

fn init_tracing(log_level: &str) {
    // CLI levels map onto tracing's: "warning" → warn, "critical" → error.
    let level = match log_level {
        "critical" => "error",
        "warning" => "warn",
        other => other,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lemonade={level},tower_http=warn")));

    let log_path = lemonade::paths::log_file();
    let file_appender = tracing_appender::rolling::never(
        log_path.parent().unwrap_or_else(|| std::path::Path::new(".")),
        log_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("lemonade-server.log")),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_appender),
        )
        .init();
}
