//! CLI shim over the library: ingest documents, run queries, generate QA
//! datasets. The heavy lifting all lives in the library; this binary only
//! parses arguments, wires the client, and prints JSON results.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use straylight::budget::TokenBudgeter;
use straylight::client::ModelClient;
use straylight::config::{ApiCredentials, StraylightConfig};
use straylight::engine::{IngestOptions, KnowledgeEngine, QueryOpts, StoreTarget};
use straylight::providers::HttpChatTransport;
use straylight::qa::save::{save_qa, SaveFormat};
use straylight::qa::{generate_qa, QaOptions};
use straylight::types::Document;

#[derive(Debug, Parser)]
#[command(name = "straylight", about = "Reflective LLM environment", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest document fixture files (JSON) into a store.
    Ingest {
        /// Store directory.
        #[arg(long)]
        store: PathBuf,
        /// Document files to ingest.
        #[arg(required = true)]
        docs: Vec<PathBuf>,
        /// Extract entities and relationships from text pages.
        #[arg(long)]
        extract_entities: bool,
    },
    /// Answer a query against a store.
    Query {
        /// Store directory.
        #[arg(long)]
        store: PathBuf,
        /// The question.
        query: String,
        /// Iteration cap override.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Run the refine loop on the answer.
        #[arg(long)]
        refine: bool,
        /// Collect verified claims into the result.
        #[arg(long)]
        verify: bool,
        /// Persist an insight learning afterwards.
        #[arg(long)]
        learn: bool,
    },
    /// Generate a QA dataset from a store.
    Generate {
        /// Store directory.
        #[arg(long)]
        store: PathBuf,
        /// Target question count.
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Output base path (extension added per format).
        #[arg(long)]
        out: PathBuf,
        /// Output formats: json, markdown.
        #[arg(long, value_delimiter = ',', default_values_t = ["json".to_string(), "markdown".to_string()])]
        formats: Vec<String>,
        /// Generation worker count.
        #[arg(long, default_value_t = 3)]
        parallelism: usize,
        /// Candidates per passage.
        #[arg(long, default_value_t = 1)]
        k_candidates: usize,
        /// Also generate cross-section questions.
        #[arg(long)]
        multi_hop: bool,
        /// Persona instruction for the generator.
        #[arg(long)]
        persona: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    straylight::logging::init_cli();

    let cli = Cli::parse();
    let config = Arc::new(StraylightConfig::load()?);
    let credentials = ApiCredentials::from_env().context("API credentials")?;

    let transport = Arc::new(HttpChatTransport::new(
        credentials.base_url.clone(),
        credentials.api_key.clone(),
    ));
    let client = Arc::new(ModelClient::new(
        transport,
        TokenBudgeter::new(),
        config.retry.clone(),
        config.request.clone(),
    ));
    let engine = KnowledgeEngine::new(client, config);

    match cli.command {
        Command::Ingest {
            store,
            docs,
            extract_entities,
        } => {
            let env = engine.create_env(StoreTarget::Path(store))?;
            let mut documents = Vec::with_capacity(docs.len());
            for path in docs {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let doc: Document = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?;
                documents.push(doc);
            }
            let reports = engine
                .ingest(
                    &env,
                    documents,
                    IngestOptions {
                        extract_entities,
                        vision_rescan: false,
                        ..IngestOptions::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            engine.dispose_env(env)?;
        }
        Command::Query {
            store,
            query,
            max_iterations,
            refine,
            verify,
            learn,
        } => {
            let env = engine.create_env(StoreTarget::Path(store))?;
            let outcome = engine
                .query(
                    &env,
                    &query,
                    QueryOpts {
                        max_iterations,
                        refine,
                        verify,
                        learn,
                        ..QueryOpts::default()
                    },
                )
                .await?;
            let rendered = serde_json::json!({
                "answer": outcome.answer,
                "status": format!("{:?}", outcome.status),
                "iterations": outcome.iterations,
                "refinement-count": outcome.refinement_count,
                "eval-scores": outcome.eval_scores,
                "verified-claims": outcome.verified_claims,
                "tokens": outcome.tokens.total_tokens,
            });
            println!("{}", serde_json::to_string_pretty(&rendered)?);
            engine.dispose_env(env)?;
        }
        Command::Generate {
            store,
            count,
            out,
            formats,
            parallelism,
            k_candidates,
            multi_hop,
            persona,
        } => {
            let env = engine.create_env(StoreTarget::Path(store))?;
            let result = generate_qa(
                &env,
                QaOptions {
                    count,
                    parallelism,
                    k_candidates,
                    multi_hop,
                    persona,
                    ..QaOptions::default()
                },
            )
            .await?;

            let parsed_formats: Vec<SaveFormat> = formats
                .iter()
                .filter_map(|f| {
                    let parsed = SaveFormat::parse(f);
                    if parsed.is_none() {
                        eprintln!("unknown format {f:?}, skipping");
                    }
                    parsed
                })
                .collect();
            let written = save_qa(&result, &out, &parsed_formats, Some(env.store().as_ref()))?;
            for path in written {
                println!("{}", path.display());
            }
            eprintln!(
                "{} questions ({} generated, {} duplicates removed)",
                result.stats.final_count,
                result.stats.total_generated,
                result.stats.duplicates_removed
            );
            engine.dispose_env(env)?;
        }
    }

    Ok(())
}
