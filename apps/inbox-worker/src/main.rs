use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;
	let args = inbox_worker::Args::parse();
	inbox_worker::run(args).await
}
