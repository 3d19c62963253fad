// tradestore/src/main.rs

mod cli;

use anyhow::Context;

use tradestore_core::builder;
use tradestore_core::client;
use tradestore_core::ingest;
use tradestore_core::layout;
use tradestore_core::query;
use tradestore_core::server;
use tradestore_core::settings;

fn setup_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

fn main() -> anyhow::Result<()> {
    setup_logging();

    let args = cli::Args::parse();
    let settings = settings::Settings::load(args.config.as_deref())?;

    match args.command {
        cli::Command::Ingest { input } => run_ingest(&settings, &input),
        cli::Command::Serve => run_server(&settings),
        cli::Command::Query { request } => run_query(&settings, &request),
    }
}

fn run_ingest(settings: &settings::Settings, input: &std::path::Path) -> anyhow::Result<()> {
    let start_time = std::time::Instant::now();

    let store_layout = layout::StoreLayout::from_settings(&settings.storage);
    let index_builder = builder::IndexBuilder::create(&store_layout, settings.ingest.block_size)?;
    let summary = ingest::ingest_file(input, index_builder, settings.ingest.has_headers)?;

    println!(
        "Ingestion complete. Records: {}, Blocks: {}",
        summary.record_count,
        summary.block_count,
    );
    if summary.skipped > 0 {
        println!("Skipped {} malformed lines", summary.skipped);
    }
    if summary.duplicate_keys > 0 {
        println!("{} records share a (slot, tx_idx) key with an earlier record", summary.duplicate_keys);
    }
    println!("Finished in {:.3} seconds", start_time.elapsed().as_secs_f64());

    anyhow::Ok(())
}

fn run_server(settings: &settings::Settings) -> anyhow::Result<()> {
    let shutdown = server::Shutdown::install_signal_handlers()?;
    let state = server::ServerState::load(settings)?;
    let metadata = *state.engine().metadata();
    let request_server = server::Server::bind(state)?;

    println!("Server running (PID: {})", std::process::id());
    println!("Records: {}, Blocks: {}", metadata.record_count, metadata.block_count);
    log::info!("Listening on {}", request_server.request_pipe().display());

    let stats = request_server.run(&shutdown)?;
    println!("Server stopped after {} requests", stats.served + stats.failed);

    anyhow::Ok(())
}

fn run_query(settings: &settings::Settings, request: &query::SearchRequest) -> anyhow::Result<()> {
    let search_client = client::Client::connect(&settings.server)?;
    let records = search_client.search(request)?;

    for record in &records {
        let line = serde_json::to_string(record).context("Failed to format record")?;
        println!("{}", line);
    }
    log::info!("{} results ({})", records.len(), request.plan());

    anyhow::Ok(())
}
