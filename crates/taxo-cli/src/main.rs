//! Taxo CLI - Command-line interface
//!
//! Usage:
//!   taxo annotate "Escherichia coli (E. coli) is a bacterium."
//!   taxo annotate --filename paper.txt --with-abbrev --with-linking
//!   taxo annotate --input-dir corpus/ --output-dir ann/ --workers 4
//!   taxo build --registry gbif_backbone
//!   taxo build --kb taxa.jsonl --prefix NCBI: --out linkers/taxa
//!   taxo linkers
//!
//! Author: hephaex@gmail.com

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use taxo_core::{AppConfig, EntityRecord, LoggingConfig};
use taxo_kb::registry::LINKER_CONFIG_FILE;
use taxo_kb::{KbSource, KnowledgeBase, RegistryEntry, REGISTRY};
use taxo_linker::{
    ann_file_name, build_linker_artifacts, corpus_files, write_records, TaxonRecognizer,
};

#[derive(Parser)]
#[command(name = "taxo")]
#[command(about = "Taxonomic named entity recognition and linking")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find taxon mentions in text, a file, or a directory of .txt files
    Annotate(AnnotateArgs),
    /// Build linker artifacts from a knowledge base
    Build(BuildArgs),
    /// List registered linkers
    Linkers,
}

#[derive(Args)]
struct AnnotateArgs {
    /// Text to annotate
    text: Option<String>,

    /// Name of a text file
    #[arg(short = 'f', long)]
    filename: Option<PathBuf>,

    /// Directory of .txt files
    #[arg(short = 'i', long)]
    input_dir: Option<PathBuf>,

    /// Where .ann files are written (stdout if absent)
    #[arg(short = 'o', long)]
    output_dir: Option<PathBuf>,

    /// Add abbreviation detection to the pipeline
    #[arg(short = 'a', long)]
    with_abbrev: bool,

    /// Link mentions to a knowledge base
    #[arg(short = 'l', long)]
    with_linking: bool,

    /// Add the sentence index to each row
    #[arg(short = 's', long)]
    with_sentence: bool,

    /// Registry name or linker config path
    #[arg(long)]
    linker: Option<String>,

    /// Minimum linking score
    #[arg(long)]
    threshold: Option<f32>,

    /// Parallel workers for --input-dir
    #[arg(short = 'w', long, default_value_t = 1)]
    workers: usize,
}

#[derive(Args)]
struct BuildArgs {
    /// Build a registered linker from its source under the data directory
    #[arg(long, conflicts_with_all = ["kb", "out"])]
    registry: Option<String>,

    /// Knowledge base source (JSONL or JSON array)
    #[arg(long, requires = "out")]
    kb: Option<PathBuf>,

    /// Prefix prepended to concept ids
    #[arg(long, default_value = "")]
    prefix: String,

    /// Output directory
    #[arg(long)]
    out: Option<PathBuf>,

    /// Linker name (defaults to the source file stem)
    #[arg(long)]
    name: Option<String>,

    /// Override the minimum n-gram document frequency
    #[arg(long)]
    min_df: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Annotate(args) => annotate(config, args).await,
        Commands::Build(args) => build(&config, args),
        Commands::Linkers => {
            list_linkers(&config);
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ============================================================================
// Annotate
// ============================================================================

async fn annotate(mut config: AppConfig, args: AnnotateArgs) -> anyhow::Result<()> {
    config.pipeline.with_abbrev |= args.with_abbrev;
    config.pipeline.with_linking |= args.with_linking;
    config.pipeline.with_sentence |= args.with_sentence;
    if let Some(linker) = args.linker {
        config.linker.linker_name = Some(linker);
    }
    if let Some(threshold) = args.threshold {
        config.linker.threshold = threshold;
    }

    let recognizer = TaxonRecognizer::from_config(&config)
        .await
        .context("Failed to load the pipeline")?;

    if let Some(text) = args.text {
        let records = recognizer.find_entities(&text)?;
        emit(None, &records, None)?;
    } else if let Some(filename) = args.filename {
        let records = recognizer.find_in_file(&filename)?;
        emit(Some(&filename), &records, args.output_dir.as_deref())?;
    } else if let Some(input_dir) = args.input_dir {
        annotate_corpus(recognizer, &input_dir, args.output_dir, args.workers).await?;
    } else {
        bail!("Nothing to annotate: pass TEXT, --filename or --input-dir");
    }
    Ok(())
}

/// Spread the corpus over `workers` forked pipelines
async fn annotate_corpus(
    recognizer: TaxonRecognizer,
    input_dir: &Path,
    output_dir: Option<PathBuf>,
    workers: usize,
) -> anyhow::Result<()> {
    let files = corpus_files(input_dir)?;
    let workers = workers.clamp(1, files.len().max(1));
    tracing::info!(files = files.len(), workers, "Annotating corpus");

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let share: Vec<PathBuf> = files.iter().skip(worker).step_by(workers).cloned().collect();
        let pipeline = recognizer.fork()?;
        let output_dir = output_dir.clone();

        handles.push(tokio::task::spawn_blocking(move || {
            let mut annotated = 0usize;
            for path in share {
                let result = pipeline
                    .find_in_file(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|records| emit(Some(&path), &records, output_dir.as_deref()));
                match result {
                    Ok(()) => annotated += 1,
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping file"),
                }
            }
            annotated
        }));
    }

    let mut annotated = 0;
    for handle in handles {
        annotated += handle.await?;
    }
    tracing::info!(annotated, skipped = files.len() - annotated, "Corpus finished");
    Ok(())
}

/// Write records to `<output_dir>/<stem>.ann`, or to stdout
fn emit(
    input: Option<&Path>,
    records: &[EntityRecord],
    output_dir: Option<&Path>,
) -> anyhow::Result<()> {
    match (input, output_dir) {
        (Some(input), Some(dir)) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let path = dir.join(ann_file_name(input));
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut writer = std::io::BufWriter::new(file);
            write_records(&mut writer, records)?;
            writer.flush()?;
            tracing::debug!(path = %path.display(), entities = records.len(), "Wrote annotations");
        }
        _ => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            write_records(&mut lock, records)?;
        }
    }
    Ok(())
}

// ============================================================================
// Build
// ============================================================================

fn build(config: &AppConfig, args: BuildArgs) -> anyhow::Result<()> {
    let mut index = config.index.clone();
    if let Some(min_df) = args.min_df {
        index.min_df = min_df;
    }

    let (name, source, out) = match (args.registry, args.kb, args.out) {
        (Some(name), _, _) => {
            let Some(entry) = RegistryEntry::find(&name) else {
                bail!("Unknown linker '{name}'");
            };
            let spec = entry.spec(&config.cache);
            (name, spec.kb, entry.artifact_dir(&config.cache))
        }
        (None, Some(kb), Some(out)) => {
            let name = args.name.unwrap_or_else(|| {
                kb.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "custom".to_string())
            });
            (name, KbSource::new(kb, args.prefix), out)
        }
        _ => bail!("Pass --registry NAME, or --kb FILE with --out DIR"),
    };

    let kb = KnowledgeBase::open(source)?;
    let spec = build_linker_artifacts(&name, &kb, &out, &index)?;
    println!(
        "Built linker '{}' in {} ({} concepts)",
        spec.name,
        out.display(),
        kb.len()?
    );
    Ok(())
}

fn list_linkers(config: &AppConfig) {
    for entry in REGISTRY {
        let built = entry
            .artifact_dir(&config.cache)
            .join(LINKER_CONFIG_FILE)
            .is_file();
        println!(
            "{:<16} {:<8} {:<6} {}",
            entry.name,
            entry.prefix,
            if built { "built" } else { "-" },
            config.cache.data_dir.join(entry.kb_file).display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotate_flags() {
        let cli = Cli::try_parse_from(["taxo", "annotate", "-a", "-l", "-w", "4", "-i", "corpus"])
            .unwrap();
        let Commands::Annotate(args) = cli.command else {
            panic!("expected annotate");
        };
        assert!(args.with_abbrev && args.with_linking && !args.with_sentence);
        assert_eq!(args.workers, 4);
        assert_eq!(args.input_dir, Some(PathBuf::from("corpus")));
    }

    #[test]
    fn test_build_registry_conflicts_with_kb() {
        let result = Cli::try_parse_from([
            "taxo", "build", "--registry", "taxref", "--kb", "a.jsonl", "--out", "x",
        ]);
        assert!(result.is_err());
    }
}
