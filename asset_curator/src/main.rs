use std::{path::PathBuf, sync::Arc, time::Duration};

use asset_common::{CuratorEvent, TransformState};
use asset_curator::{
    plugins::{builtin_document_types, builtin_generators},
    task_pool::TaskPool,
    AssetCurator, AssetProcessor, AssetWatcher, AssetsConfig, DocumentImporter, FileChangeReceiver,
};
use clap::{Parser, Subcommand};
use env_logger::Env;

#[derive(Parser, Debug)]
#[command(version, about = "Keeps transformed assets in sync with their documents")]
struct Cli {
    /// Project config. Created with default values if it doesn't exist.
    #[arg(short, long, default_value = "assets_config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the data directories and transform assets until Ctrl+C.
    Watch,
    /// Transform every asset once, then exit.
    Transform,
    /// Print how many assets are in which state.
    Stats,
    /// Create asset documents for source files.
    Import { files: Vec<PathBuf> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = AssetsConfig::load_or_create(&cli.config)?;
    let curator = Arc::new(AssetCurator::new(config, builtin_document_types())?);
    curator.open_project()?;

    let result = match cli.command {
        Command::Watch => watch(curator.clone()).await,
        Command::Transform => {
            let curator = curator.clone();
            tokio::task::spawn_blocking(move || transform_all(&curator)).await?
        }
        Command::Stats => {
            print_stats(&curator);
            Ok(())
        }
        Command::Import { files } => {
            let curator = curator.clone();
            tokio::task::spawn_blocking(move || import(curator, &files)).await?
        }
    };

    curator.close_project()?;
    result
}

async fn watch(curator: Arc<AssetCurator>) -> anyhow::Result<()> {
    let pool = TaskPool::current();
    let mut watcher = AssetWatcher::from_config(
        curator.clone() as Arc<dyn FileChangeReceiver>,
        curator.config(),
        pool.clone(),
    );
    let processor = AssetProcessor::new(curator.clone(), pool, curator.config().processor_workers);
    processor.start_process_task();

    let mut events = curator.subscribe();
    let mut interval =
        tokio::time::interval(Duration::from_millis(curator.config().tick_interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => watcher.main_thread_tick(),
            Some(event) = events.recv() => log_event(&curator, event),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    log::info!("Shutting down");
    tokio::task::spawn_blocking(move || {
        processor.stop_process_task(true);
        watcher.shutdown();
    })
    .await?;
    print_stats(&curator);
    Ok(())
}

fn log_event(curator: &AssetCurator, event: CuratorEvent) {
    match event {
        CuratorEvent::AssetUpdated { guid, state } if state.is_error() => {
            let info = curator.asset_info(guid);
            let path = info.as_ref().map(|info| info.path.clone()).unwrap_or_default();
            let message = info.and_then(|info| info.last_error).unwrap_or_default();
            log::warn!("{} {:?} is {}: {}", guid, path, state, message);
        }
        event => log::debug!("{:?}", event),
    }
}

fn transform_all(curator: &AssetCurator) -> anyhow::Result<()> {
    for guid in curator.assets() {
        let state = curator.transform_asset(guid)?;
        if state != TransformState::UpToDate {
            let path = curator
                .asset_info(guid)
                .map(|info| info.path)
                .unwrap_or_default();
            log::warn!("{} {:?} ended up as {}", guid, path, state);
        }
    }
    print_stats(curator);
    Ok(())
}

fn import(curator: Arc<AssetCurator>, files: &[PathBuf]) -> anyhow::Result<()> {
    let mut importer = DocumentImporter::new(curator, &builtin_generators());
    let report = importer.import_assets(files);
    for (file, guid) in &report.imported {
        println!("imported {:?} as {}", file, guid);
    }
    for group in &report.undecided {
        let options: Vec<&str> = group
            .options
            .iter()
            .map(|option| option.display_name.as_str())
            .collect();
        println!(
            "{:?} could be imported as one of: {}",
            group.input_file_absolute,
            options.join(", ")
        );
    }
    for (file, err) in &report.failed {
        println!("failed to import {:?}: {}", file, err);
    }
    Ok(())
}

fn print_stats(curator: &AssetCurator) {
    println!("{}", curator.get_asset_transform_stats());
}
