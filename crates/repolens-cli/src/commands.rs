//! Flag dispatch.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use repolens::model::RepositoryRecord;
use repolens_engine::{EngineContext, HeuristicParser};

use crate::Cli;

pub(crate) async fn run(ctx: &Arc<EngineContext>, cli: &Cli) -> Result<()> {
    if let Some(path) = &cli.index {
        let summary = index_path(ctx, path, false).await?;
        report_ingest(&summary);
        if cli.watch {
            watch_path(ctx, path).await?;
        }
    }

    if let Some(path) = &cli.clone_ref {
        let summary = index_path(ctx, path, true).await?;
        report_ingest(&summary);
    }

    if let Some(spec) = &cli.share_docs {
        let (doc_ids, target) = parse_share_spec(spec)?;
        let shared = ctx.gateway.share_docs_with_repo(&doc_ids, target).await?;
        println!("shared {} document(s) with repository {target}", shared.len());
    }

    if let Some(query) = &cli.search_docs {
        let hits = ctx.search.search_docs(query, None, Some(10)).await;
        if hits.is_empty() {
            println!("no matches");
        }
        for hit in hits {
            println!(
                "{:.4}  repo {}  {}",
                hit.distance, hit.repo_id, hit.file_path
            );
        }
    }

    if let Some(name) = &cli.learn_ref {
        let repo = ctx
            .relational
            .get_repository_by_name(name)
            .await?
            .with_context(|| format!("repository {name:?} is not indexed"))?;
        let repo_id = repo.id.context("repository has no id")?;
        let report = ctx.learner.learn_from_repository(repo_id).await?;
        println!(
            "learned from {name}: {} code, {} doc, {} architecture pattern(s); {} stored",
            report.code_patterns, report.doc_patterns, report.arch_patterns, report.stored
        );
    }

    if cli.deep_learning {
        let ids = parse_id_list(cli.multi_ref.as_deref().unwrap_or_default())?;
        let report = ctx.learner.deep_learn(&ids).await?;
        println!(
            "deep learning over {:?}: {} comparison(s), {} cross-repository pattern(s) under meta-repository {}",
            ids, report.comparisons, report.common_patterns, report.meta_repo_id
        );
        for entry in &report.entries {
            if !entry.success {
                warn!(
                    repo_id = entry.repo_id,
                    error = entry.error.as_deref().unwrap_or("unknown"),
                    "repository failed during deep learning"
                );
            }
        }
    }

    if let Some(spec) = &cli.apply_ref_patterns {
        let (reference, target) = parse_pair(spec)
            .context("--apply-ref-patterns expects REFERENCE_ID:TARGET_ID")?;
        let report = ctx.learner.apply_patterns(reference, target).await?;
        println!(
            "applied {} pattern(s) to repository {target} ({} recommendation(s), similarity score {:.2})",
            report.applied_patterns,
            report.recommendations.len(),
            report.similarity_score
        );
        for rec in report.recommendations.iter().take(10) {
            println!("  [{:.2}] {}", rec.confidence, rec.advice);
        }
    }

    ctx.refresh_health().await;
    info!(status = ?ctx.health.overall(), "engine health");
    Ok(())
}

async fn index_path(
    ctx: &Arc<EngineContext>,
    path: &Path,
    reference: bool,
) -> Result<repolens_engine::IngestSummary> {
    if !path.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    let name = path
        .canonicalize()?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("cannot derive a repository name from the path")?;

    let record = if reference {
        RepositoryRecord::reference(name, None)
    } else {
        RepositoryRecord::active(name)
    };
    let summary = ctx.indexer.ingest(&record, path, &HeuristicParser).await?;
    Ok(summary)
}

fn report_ingest(summary: &repolens_engine::IngestSummary) {
    println!(
        "indexed repository {} ({} code file(s), {} doc(s), {} skipped)",
        summary.repo_id, summary.files_indexed, summary.docs_indexed, summary.skipped
    );
    for (path, error) in &summary.failures {
        warn!(path = %path, error = %error, "file failed during ingest");
    }
}

/// Re-index whenever the tree's newest mtime moves. Polling keeps the
/// loop dependency-free; two seconds is plenty for a dev loop.
async fn watch_path(ctx: &Arc<EngineContext>, path: &Path) -> Result<()> {
    info!(path = %path.display(), "watching for changes (ctrl-c to stop)");
    let mut last_seen = newest_mtime(path);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("watch stopped");
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                let newest = newest_mtime(path);
                if newest > last_seen {
                    last_seen = newest;
                    match index_path(ctx, path, false).await {
                        Ok(summary) => report_ingest(&summary),
                        Err(err) => warn!(error = %err, "re-index failed"),
                    }
                }
            }
        }
    }
}

fn newest_mtime(path: &Path) -> SystemTime {
    walk_mtimes(path).unwrap_or(SystemTime::UNIX_EPOCH)
}

fn walk_mtimes(path: &Path) -> Option<SystemTime> {
    let mut newest = None;
    let entries = std::fs::read_dir(path).ok()?;
    for entry in entries.flatten() {
        let metadata = entry.metadata().ok()?;
        let candidate = if metadata.is_dir() {
            walk_mtimes(&entry.path())
        } else {
            metadata.modified().ok()
        };
        newest = match (newest, candidate) {
            (Some(a), Some(b)) => Some(std::cmp::max(a, b)),
            (a, b) => a.or(b),
        };
    }
    newest
}

fn parse_id_list(raw: &str) -> Result<Vec<i64>> {
    let ids: Vec<i64> = raw
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.trim().parse::<i64>())
        .collect::<std::result::Result<_, _>>()
        .context("--multi-ref expects comma-separated repository ids")?;
    if ids.is_empty() {
        bail!("--multi-ref expects at least one repository id");
    }
    Ok(ids)
}

fn parse_pair(raw: &str) -> Option<(i64, i64)> {
    let (a, b) = raw.split_once(':')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

fn parse_share_spec(raw: &str) -> Result<(Vec<i64>, i64)> {
    let (ids, target) = raw
        .split_once(':')
        .context("--share-docs expects DOC_IDS:TARGET_REPO_ID")?;
    let doc_ids = parse_id_list(ids).context("--share-docs expects comma-separated doc ids")?;
    let target = target
        .trim()
        .parse()
        .context("--share-docs target must be a repository id")?;
    Ok((doc_ids, target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_lists_parse_and_reject_garbage() {
        assert_eq!(parse_id_list("1,2, 3").unwrap(), vec![1, 2, 3]);
        assert!(parse_id_list("").is_err());
        assert!(parse_id_list("1,x").is_err());
    }

    #[test]
    fn share_specs_split_ids_and_target() {
        let (ids, target) = parse_share_spec("4,5:9").unwrap();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(target, 9);
        assert!(parse_share_spec("4,5").is_err());
    }

    #[test]
    fn pairs_parse_reference_and_target() {
        assert_eq!(parse_pair("3:7"), Some((3, 7)));
        assert_eq!(parse_pair("3"), None);
        assert_eq!(parse_pair("a:b"), None);
    }
}
