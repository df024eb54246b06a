//! kgdial CLI
//!
//! Operator surface over the dataset pipeline:
//! - `pack`: bootstrap the id spaces and pack a split
//! - `inspect`: print the shapes of the first collated batch of a split
//! - `sample`: print a replica's sampler blocks for an epoch
//! - `retrieve`: query the knowledge graph around a word

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use kgdial_data::{
    BatchLoader, DatasetConfig, DialDataset, DistributedSampler, LoaderOptions, RedisGraphService,
    FIELDS,
};

#[derive(Parser)]
#[command(name = "kgdial")]
#[command(author, version, about = "Knowledge-grounded dialogue dataset pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConfigArgs {
    /// JSON dataset config; defaults apply to missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<DatasetConfig> {
        let config = match &self.config {
            Some(path) => DatasetConfig::from_file(path)?,
            None => DatasetConfig::default(),
        };
        let config = config.apply_env()?;
        config.validate()?;
        tracing::debug!(data_dir = %config.data_dir.display(), graph = %config.graph_name, "config loaded");
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build the vocabulary (if missing) and pack a split into its array store.
    Pack {
        #[command(flatten)]
        config: ConfigArgs,
        /// train, valid or test
        #[arg(short, long, default_value = "train")]
        split: String,
    },

    /// Collate the first batch of a split and print its field shapes.
    Inspect {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(short, long, default_value = "train")]
        split: String,
        #[arg(short, long, default_value_t = 32)]
        batch_size: usize,
    },

    /// Print the blocks a replica receives in one epoch.
    Sample {
        #[arg(long)]
        rows: usize,
        #[arg(long, default_value_t = 1)]
        replicas: usize,
        #[arg(long, default_value_t = 0)]
        rank: usize,
        #[arg(long, default_value_t = 1)]
        batch_access: usize,
        #[arg(long, default_value_t = 0)]
        epoch: u64,
        #[arg(long)]
        no_shuffle: bool,
    },

    /// Retrieve graph facts around a word from the graph-query service.
    Retrieve {
        #[command(flatten)]
        config: ConfigArgs,
        /// Split whose store is opened (packed first when missing)
        #[arg(short, long, default_value = "train")]
        split: String,
        #[arg(short, long)]
        word: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Pack { config, split } => cmd_pack(&config.load()?, &split),
        Commands::Inspect {
            config,
            split,
            batch_size,
        } => cmd_inspect(&config.load()?, &split, batch_size),
        Commands::Sample {
            rows,
            replicas,
            rank,
            batch_access,
            epoch,
            no_shuffle,
        } => cmd_sample(rows, replicas, rank, batch_access, epoch, !no_shuffle),
        Commands::Retrieve {
            config,
            split,
            word,
        } => cmd_retrieve(&config.load()?, &split, &word),
    }
}

fn open(config: &DatasetConfig, split: &str) -> Result<DialDataset> {
    DialDataset::open(config, split).with_context(|| {
        format!(
            "failed to open split `{split}` under {}",
            display(&config.data_dir)
        )
    })
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn cmd_pack(config: &DatasetConfig, split: &str) -> Result<()> {
    let dataset = open(config, split)?;
    println!(
        "{} {} ({} rows) at {}",
        "packed".green().bold(),
        split.bold(),
        dataset.len(),
        display(dataset.store().root())
    );
    for name in FIELDS {
        println!("  {name:<16} {:?}", dataset.store().shape(name)?);
    }
    Ok(())
}

fn cmd_inspect(config: &DatasetConfig, split: &str, batch_size: usize) -> Result<()> {
    let dataset = open(config, split)?;
    let options = LoaderOptions {
        batch_size,
        shuffle: false,
        ..Default::default()
    };
    let loader = BatchLoader::new(&dataset, options)?;
    let Some(batch) = loader.epoch(0).next() else {
        bail!("split `{split}` yields no batches");
    };
    let batch = batch?;
    println!("{} {} rows", "batch".green().bold(), batch.len());
    for (name, array) in batch.fields() {
        println!("  {name:<16} {:?}", array.shape());
    }
    Ok(())
}

fn cmd_sample(
    rows: usize,
    replicas: usize,
    rank: usize,
    batch_access: usize,
    epoch: u64,
    shuffle: bool,
) -> Result<()> {
    let sampler = DistributedSampler::new(rows, replicas, rank, batch_access, shuffle)?;
    println!(
        "{} rank {rank}/{replicas}, epoch {epoch}: {} blocks of {batch_access} (padded total {})",
        "sampler".green().bold(),
        sampler.blocks_per_replica(),
        sampler.total_size()
    );
    for block in sampler.blocks(epoch) {
        println!("  {block:?}");
    }
    Ok(())
}

fn cmd_retrieve(config: &DatasetConfig, split: &str, word: &str) -> Result<()> {
    let dataset = open(config, split)?;
    let words = &dataset.vocabulary().words;
    let Some(id) = words.word_id(word) else {
        bail!("`{word}` is not in the vocabulary");
    };

    let service = RedisGraphService::open(&config.graph_url, config.graph_name.clone())
        .with_context(|| format!("cannot reach graph service at {}", config.graph_url))?;
    let facts = dataset.retriever(&service).retrieve(id)?;
    println!("{} {} fact(s) for {}", "retrieved".green().bold(), facts.len(), word.bold());

    let relations = dataset.relations();
    let name = |id| words.word(id).unwrap_or("?");
    for [h, r, t] in facts {
        println!(
            "  {} -[{}]-> {}",
            name(h),
            relations.name(r).unwrap_or("?"),
            name(t)
        );
    }
    Ok(())
}
