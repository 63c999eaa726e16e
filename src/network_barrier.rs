//! Waits for the repository to converge between sync phases: outgoing
//! (local writes reached the relay) and incoming (the reachable subtree's
//! heads stopped changing).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineResult;
use crate::repo::{DocUrl, Handle, Repo};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct BarrierOutcome {
    pub converged: bool,
    pub timed_out: bool,
}

/// Waits until every handle has been acknowledged by the relay, or the
/// timeout elapses. A timeout is a warning, never a fatal error.
pub async fn wait_for_sync(
    repo: &Arc<dyn Repo>,
    handles: &[Handle],
    relay_id: &str,
    timeout: Duration,
) -> EngineResult<BarrierOutcome> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let mut all_synced = true;
        for handle in handles {
            if !repo.is_synced(handle, relay_id).await.unwrap_or(false) {
                all_synced = false;
                break;
            }
        }
        if all_synced {
            return Ok(BarrierOutcome {
                converged: true,
                timed_out: false,
            });
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(BarrierOutcome {
                converged: false,
                timed_out: true,
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Recursively collects `{plain url -> heads}` for every document reachable
/// from `root_url`, waiting for that map to stop changing across
/// `stable_checks_required` consecutive polls.
pub async fn wait_for_bidirectional_sync(
    repo: &Arc<dyn Repo>,
    root_url: &str,
    timeout: Duration,
    poll_interval: Duration,
    stable_checks_required: u32,
) -> EngineResult<BarrierOutcome> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut previous: Option<HashMap<String, Vec<u8>>> = None;
    let mut stable_count = 0;

    loop {
        let current = collect_heads_map(repo, root_url).await;
        match &previous {
            Some(prev) if *prev == current => {
                stable_count += 1;
            }
            _ => {
                stable_count = 0;
            }
        }
        previous = Some(current);

        if stable_count >= stable_checks_required {
            return Ok(BarrierOutcome {
                converged: true,
                timed_out: false,
            });
        }
        if tokio::time::Instant::now() >= deadline {
            crate::logging::info("bidirectional sync barrier timed out, proceeding anyway");
            return Ok(BarrierOutcome {
                converged: false,
                timed_out: true,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

async fn collect_heads_map(repo: &Arc<dyn Repo>, root_url: &str) -> HashMap<String, Vec<u8>> {
    let mut out = HashMap::new();
    let mut stack = vec![root_url.to_string()];
    let mut seen = std::collections::HashSet::new();
    while let Some(url) = stack.pop() {
        let Ok(doc_url) = DocUrl::parse(&url) else {
            continue;
        };
        if !seen.insert(doc_url.plain().to_string()) {
            continue;
        }
        let Ok(handle) = repo.find(&doc_url).await else {
            continue;
        };
        out.insert(doc_url.plain().to_string(), handle.heads());
        if let Ok(body) = handle.doc() {
            if let Some(dir) = body.as_directory() {
                for entry in &dir.docs {
                    stack.push(entry.url.clone());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{Content, DocBody, FileDocument, InMemoryRepo};
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn wait_for_sync_resolves_immediately_with_no_real_relay() {
        let repo: Arc<dyn Repo> = InMemoryRepo::new();
        let handle = repo
            .create(DocBody::File(FileDocument {
                name: "a.txt".into(),
                extension: "txt".into(),
                mime_type: "text/plain".into(),
                content: Content::Text("hi".into()),
                permissions: 0o644,
            }))
            .await
            .unwrap();
        let outcome = wait_for_sync(&repo, &[handle], "relay", Duration::from_millis(500))
            .await
            .unwrap();
        assert!(outcome.converged);
        assert!(!outcome.timed_out);
        let _ = StdArc::strong_count(&repo);
    }

    #[tokio::test]
    async fn wait_for_bidirectional_sync_converges_on_a_stable_tree() {
        let repo: Arc<dyn Repo> = InMemoryRepo::new();
        let root = repo
            .create(DocBody::Directory(crate::repo::DirectoryDocument::default()))
            .await
            .unwrap();
        let outcome = wait_for_bidirectional_sync(
            &repo,
            &root.url().to_string(),
            Duration::from_secs(2),
            Duration::from_millis(10),
            2,
        )
        .await
        .unwrap();
        assert!(outcome.converged);
    }
}
