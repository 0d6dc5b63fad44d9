use anyhow::Result;
use clap::Parser;
use tokio::task::JoinSet;
use tracing_subscriber::{self, EnvFilter};

use routecodex::config::{GatewayConfig, Settings};
use routecodex::ingress::build_router;
use routecodex::GatewayState;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Load config from a JSON byte string (mutually exclusive with --file)
	#[arg(short, long, value_name = "config")]
	config: Option<bytes::Bytes>,

	/// Load config from a YAML or JSON file (mutually exclusive with --config)
	#[arg(short, long, value_name = "file")]
	file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();

	let cfg: GatewayConfig = match (args.file, args.config) {
		(Some(path), None) => {
			let text = tokio::fs::read_to_string(&path).await?;
			let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
			GatewayConfig::from_str(&text, is_json)?
		},
		(None, Some(bytes)) => {
			let text = std::str::from_utf8(&bytes)?;
			GatewayConfig::from_str(text, true)?
		},
		(Some(_), Some(_)) => {
			eprintln!("config error: both --file and --config cannot be provided, exiting");
			std::process::exit(1);
		},
		(None, None) => {
			eprintln!("Error: either --file or --config must be provided, exiting");
			std::process::exit(1);
		},
	};

	let settings = Settings::from_config(cfg);
	let host = settings.host.clone();
	let port = settings.port;

	let state = GatewayState::bootstrap(settings).await;
	tracing::info!(
		live = state.registry.live_provider_keys().await.len(),
		"provider runtimes initialised"
	);

	let router = build_router(state);

	let mut run_set = JoinSet::new();
	let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
	run_set.spawn(async move {
		axum::serve(listener, router.into_make_service_with_connect_info::<std::net::SocketAddr>())
			.await
			.map_err(anyhow::Error::from)
	});

	while let Some(result) = run_set.join_next().await {
		result??;
	}
	Ok(())
}
