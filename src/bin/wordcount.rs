use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use dashmap::DashMap;
use emit::config::{ConfigManager, EnvConfigManager, RouterConfig};
use emit::logger::{LogLevel, init_tracing};
use emit::{Message, NodeSpec, Output, Router, tuple};
use serde_json::json;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "wordcount",
    about = "Count words by pushing a document through an emit graph",
    version
)]
struct Cli {
    /// Document to count; read from stdin when omitted
    #[arg(long)]
    text: Option<String>,

    /// Print the route graph as graphviz instead of counting
    #[arg(long)]
    dot: bool,

    /// How many of the most common words to print
    #[arg(long, default_value_t = 5)]
    top: usize,

    /// Overrides EMIT_LOG_LEVEL (trace, debug, info, warn, error, critical)
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// .env file to read settings from
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

type Counts = Arc<DashMap<String, u64>>;

fn build_graph(router: &Router, counts: Counts) -> anyhow::Result<()> {
    router.register(
        NodeSpec::new("wordcount.words", ["word"]).entry_point(),
        |msg| {
            let words: Vec<String> = msg
                .get_str("document")?
                .split_whitespace()
                .map(str::to_string)
                .collect();
            Ok(Output::yielding(words))
        },
    )?;

    router.register(
        NodeSpec::new("wordcount.count_word", ["word", "count"]).subscribe("wordcount.words"),
        move |msg| {
            let word = msg.get_str("word")?.to_lowercase();
            let count = {
                let mut entry = counts.entry(word.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            Ok(tuple!(word, count).into())
        },
    )?;

    Ok(())
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = ConfigManager(EnvConfigManager::new(cli.env_file.clone()));
    let mut config = RouterConfig::load(&config_manager).await?;
    if let Some(level) = cli.log_level {
        config.log.log_level = level;
    }
    let _guard = init_tracing(&config.log).context("could not set up logging")?;

    let parts = config.build();
    let router = parts.router;
    let counts: Counts = Arc::new(DashMap::new());
    build_graph(&router, counts.clone())?;

    if cli.dot {
        println!("{}", router.to_dot("wordcount"));
        return Ok(());
    }

    let document = match cli.text {
        Some(text) => text,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("could not read document from stdin")?;
            buffer
        }
    };

    let worker = parts
        .worker
        .map(|worker| tokio::spawn(worker.run(router.clone())));

    router.call(Message::from_pairs([("document", json!(document))]))?;

    if let (Some(queue), Some(worker)) = (parts.queue, worker) {
        if !queue.wait_idle(Duration::from_secs(60)).await {
            bail!("queue did not drain within 60s");
        }
        queue.close(&config.queue.queue);
        worker.await?;
    }
    info!("counted {} distinct words", counts.len());

    let mut top: Vec<(String, u64)> = counts
        .iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    println!("Top {} words:", cli.top);
    for (word, count) in top.into_iter().take(cli.top) {
        println!("    {word}: {count}");
    }
    Ok(())
}
