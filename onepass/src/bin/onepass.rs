use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::PathBuf,
};

use clap::Parser;
use metrics::counter;
use onepass::{
    config,
    jsonl::{self, Format, Reader},
};
use onepass_engine::Engine;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Failed to load onepass config: {0}")]
    Config(#[from] config::Error),
    #[error("Engine returned an error: {0}")]
    Engine(#[from] onepass_engine::Error),
    #[error(transparent)]
    Jsonl(#[from] jsonl::Error),
    #[error("Failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Args {
    /// path on disk to the request configuration file
    #[clap(long)]
    config_path: PathBuf,
    /// path on disk to the JSON-lines batch input
    #[clap(long)]
    input: PathBuf,
    /// path on disk to write JSON-lines outputs to, stdout if absent
    #[clap(long)]
    output: Option<PathBuf>,
}

fn open_output(path: Option<&PathBuf>) -> Result<Box<dyn Write>, Error> {
    match path {
        Some(path) => {
            let file = File::create(path).map_err(|source| Error::Open {
                path: path.clone(),
                source,
            })?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout().lock())),
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting onepass {version} run.");

    let args = Args::parse();
    let request = config::load(&args.config_path)?;
    let mut engine = Engine::new(request)?;

    let input = File::open(&args.input).map_err(|source| Error::Open {
        path: args.input.clone(),
        source,
    })?;
    let mut format = Format::new(open_output(args.output.as_ref())?);

    let mut batches = 0u64;
    let mut outputs = 0u64;
    for batch in Reader::new(BufReader::new(input)) {
        let batch = batch?;
        for output in engine.ingest(&batch)? {
            debug!(file_stem = %output.file_stem(), kind = ?output.kind, "Writing output");
            format.write_output(&output)?;
            outputs += 1;
        }
        batches += 1;
        counter!("batches_ingested").increment(1);
    }
    format.flush()?;

    info!(batches, outputs, phase = ?engine.phase(), "onepass run complete.");
    Ok(())
}
