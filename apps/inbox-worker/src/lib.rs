mod cli;

pub use cli::{Args, UserArg, VERSION, styles};

use tracing_subscriber::EnvFilter;

use inbox_service::SyncEngine;

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = inbox_config::load(&args.config)?;
	init_tracing(&config)?;
	let engine = SyncEngine::connect(config).await?;

	engine.start_maintenance()?;

	for user in &args.users {
		engine.start(user.user_id, &user.email)?;
	}

	tracing::info!(users = args.users.len(), "Inbox worker running.");
	tokio::signal::ctrl_c().await?;
	tracing::info!("Shutdown requested.");
	engine.shutdown().await;

	Ok(())
}

fn init_tracing(config: &inbox_config::Config) -> color_eyre::Result<()> {
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).init();
	Ok(())
}
