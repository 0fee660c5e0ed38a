// Allow clippy warnings for CLI application
#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use clap::Parser;

mod commands;

/// RepoLens - repository analysis over PostgreSQL and Neo4j
///
/// Typical flows:
///
/// **Index an active repository**: `repolens --index ./my-project`
///
/// **Learn from a reference**: `repolens --clone-ref ./styleguide-repo
/// --learn-ref styleguide-repo`
///
/// **Cross-repository learning**: `repolens --multi-ref 2,3,4
/// --deep-learning`
#[derive(Parser, Debug)]
#[command(name = "repolens")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Repository analysis engine - index, search, learn", long_about = None)]
struct Cli {
    /// Drop and recreate both stores before anything else
    #[arg(long)]
    clean: bool,

    /// Drop and recreate only the relational store
    #[arg(long)]
    clean_postgres: bool,

    /// Drop and recreate only the graph store
    #[arg(long)]
    clean_neo4j: bool,

    /// Verbose (debug-level) logging
    #[arg(long)]
    debug: bool,

    /// Index the repository working tree at this path as an active
    /// repository
    #[arg(long, value_name = "PATH")]
    index: Option<std::path::PathBuf>,

    /// Index a local checkout as a reference repository
    #[arg(long, value_name = "PATH")]
    clone_ref: Option<std::path::PathBuf>,

    /// Share documents with another repository, as "DOC_IDS:TARGET"
    /// (e.g. "1,2,3:4")
    #[arg(long, value_name = "DOC_IDS:TARGET")]
    share_docs: Option<String>,

    /// Semantic search over documentation
    #[arg(long, value_name = "QUERY")]
    search_docs: Option<String>,

    /// Watch the indexed path and re-index on change
    #[arg(long, requires = "index")]
    watch: bool,

    /// Learn patterns from a reference repository (by name)
    #[arg(long, value_name = "REPO")]
    learn_ref: Option<String>,

    /// Comma-separated repository ids for cross-repository operations
    #[arg(long, value_name = "IDS")]
    multi_ref: Option<String>,

    /// Apply learned reference patterns, as "REFERENCE_ID:TARGET_ID"
    #[arg(long, value_name = "REF:TARGET")]
    apply_ref_patterns: Option<String>,

    /// Run cross-repository deep learning over the --multi-ref set
    #[arg(long, requires = "multi_ref")]
    deep_learning: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let config = repolens::config::RepoLensConfig::from_env();
    let ctx = repolens_engine::EngineContext::connect(config).await?;

    if cli.clean || cli.clean_postgres {
        ctx.relational.drop_schema().await?;
    }
    if cli.clean || cli.clean_neo4j {
        ctx.graph.clear().await?;
    }

    ctx.initialize().await?;

    let result = commands::run(&ctx, &cli).await;

    ctx.shutdown_all().await;
    result
}
