use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rag_chat_gateway::{
    api,
    app_state::AppState,
    config::{Cli, Command, IngestArgs, ServeArgs},
    ingest,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Resolver el subcomando
    match Cli::parse().command {
        Command::Ingest(args) => run_ingest(args).await,
        Command::Serve(args) => run_serve(args).await,
    }
}

async fn run_ingest(args: IngestArgs) -> anyhow::Result<()> {
    let cfg = args
        .into_config()
        .context("Error al cargar la configuración de ingesta")?;
    info!(
        "Iniciando ingesta de {} ('{}') en {}",
        cfg.documents_root.display(),
        cfg.glob,
        cfg.index_path.display()
    );

    let summary = ingest::run_ingestion(&cfg)
        .await
        .context("La ingesta ha fallado")?;
    println!("{summary}");
    Ok(())
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let cfg = args
        .into_config()
        .context("Error al cargar la configuración del servidor")?;

    // El índice debe existir antes de aceptar conexiones
    let app_state = AppState::initialize(&cfg).context("Error inicializando el servidor")?;
    let app = api::create_router(app_state, cfg.max_concurrency);

    let listener = tokio::net::TcpListener::bind((cfg.host.as_str(), cfg.port))
        .await
        .with_context(|| format!("No se pudo escuchar en {}:{}", cfg.host, cfg.port))?;
    info!("🚀 Servidor escuchando en http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
