use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use connect_transform::{
    archive,
    auth::AccessTokenSource,
    config::Args,
    handler::AppState,
    report::TransformationReporter,
    router::create_router,
    rule_registry::RuleRegistry,
    transformation_engine::TransformationEngine,
    warehouse::{self, BigQueryClient},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,connect_transform=debug")),
        )
        .init();

    let args = Args::parse();

    let mut registry = match &args.rules_path {
        Some(path) => RuleRegistry::from_file(path)
            .with_context(|| format!("loading naming rules from {}", path.display()))?,
        None => RuleRegistry::embedded().context("loading built-in naming rules")?,
    };
    if let Some(path) = &args.false_array_reference {
        registry = registry
            .with_false_array_reference(path)
            .context("loading false array reference")?;
    }
    tracing::info!(
        "Naming rules ready: {} strip rules, key column {}",
        registry.strip_rules().len(),
        registry.key_column()
    );

    let client = reqwest::Client::builder()
        .timeout(warehouse::http_timeout())
        .build()
        .context("building HTTP client")?;
    let tokens = AccessTokenSource::from_env(client.clone());

    let bigquery = BigQueryClient::new(client.clone(), tokens.clone(), &args.project)
        .with_location(args.bq_location.clone());
    let archive: Arc<dyn archive::ArchiveStore> =
        Arc::from(archive::from_location(&args.archive_location, client, tokens)?);
    tracing::info!("Archiving submitted SQL to {}", archive.location());

    let engine = TransformationEngine::new(
        Arc::new(registry),
        Arc::new(bigquery),
        archive,
        TransformationReporter::new(&args.service_name),
    );
    let app = create_router(Arc::new(AppState { engine }));

    let listener = tokio::net::TcpListener::bind(args.bind_address)
        .await
        .with_context(|| format!("binding {}", args.bind_address))?;
    tracing::info!("{} listening on {}", args.service_name, args.bind_address);
    axum::serve(listener, app).await?;

    Ok(())
}
