use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{DeckhandError, Result};

/// Version-control operations the repository cache depends on.
///
/// Everything here is non-transactional and may fail on network trouble;
/// callers decide whether to degrade or surface the error.
#[async_trait]
pub trait GitClient: Send + Sync {
    async fn clone_repo(&self, url: &str, reference: &str, dest: &Path, shallow: bool)
        -> Result<()>;
    /// Fetch only the given ref, never all branches.
    async fn fetch_ref(&self, dest: &Path, reference: &str) -> Result<()>;
    async fn checkout(&self, dest: &Path, reference: &str) -> Result<()>;
    async fn list_remote_tags(&self, url: &str) -> Result<Vec<String>>;
    async fn list_remote_branches(&self, url: &str) -> Result<Vec<String>>;
    /// Garbage-collect the object store of a local clone.
    async fn gc(&self, dest: &Path) -> Result<()>;
    /// Truncate a full clone to depth 1 at the given ref and prune.
    async fn convert_to_shallow(&self, dest: &Path, reference: &str) -> Result<()>;
    fn is_shallow(&self, dest: &Path) -> bool;
}

/// `git` on the PATH, invoked per operation.
#[derive(Debug, Default)]
pub struct CliGit;

async fn run_git(args: &[&str], working_directory: Option<&Path>) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    let output = cmd
        .output()
        .await
        .map_err(|e| DeckhandError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeckhandError::Git(format!(
            "git {} failed (exit {}): {stderr}",
            args.join(" "),
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl GitClient for CliGit {
    async fn clone_repo(
        &self,
        url: &str,
        reference: &str,
        dest: &Path,
        shallow: bool,
    ) -> Result<()> {
        let dest_str = dest.to_string_lossy();
        if shallow {
            run_git(
                &["clone", "--depth", "1", "--branch", reference, url, &dest_str],
                None,
            )
            .await?;
        } else {
            run_git(&["clone", "--branch", reference, url, &dest_str], None).await?;
        }
        Ok(())
    }

    async fn fetch_ref(&self, dest: &Path, reference: &str) -> Result<()> {
        run_git(&["fetch", "origin", reference], Some(dest)).await?;
        run_git(&["checkout", "--force", "FETCH_HEAD"], Some(dest)).await?;
        Ok(())
    }

    async fn checkout(&self, dest: &Path, reference: &str) -> Result<()> {
        run_git(&["checkout", reference], Some(dest)).await?;
        Ok(())
    }

    async fn list_remote_tags(&self, url: &str) -> Result<Vec<String>> {
        let output = run_git(&["ls-remote", "--tags", "--refs", url], None).await?;
        let mut tags = parse_refs(&output, "refs/tags/");
        tags.sort_unstable_by(|a, b| b.cmp(a));
        Ok(tags)
    }

    async fn list_remote_branches(&self, url: &str) -> Result<Vec<String>> {
        let output = run_git(&["ls-remote", "--heads", url], None).await?;
        let mut branches = parse_refs(&output, "refs/heads/");
        branches.sort_unstable();
        Ok(branches)
    }

    async fn gc(&self, dest: &Path) -> Result<()> {
        run_git(&["gc", "--auto"], Some(dest)).await?;
        Ok(())
    }

    async fn convert_to_shallow(&self, dest: &Path, reference: &str) -> Result<()> {
        run_git(&["fetch", "--depth", "1", "origin", reference], Some(dest)).await?;
        run_git(&["reflog", "expire", "--expire=now", "--all"], Some(dest)).await?;
        run_git(&["gc", "--prune=now"], Some(dest)).await?;
        Ok(())
    }

    fn is_shallow(&self, dest: &Path) -> bool {
        dest.join(".git").join("shallow").exists()
    }
}

/// Extract ref names with the given prefix from `git ls-remote` output.
fn parse_refs(output: &str, prefix: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|r| r.strip_prefix(prefix))
        .map(|r| r.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tags_from_ls_remote() {
        let output = "\
abc123\trefs/tags/v1.2.0\n\
def456\trefs/tags/v1.10.0\n\
012345\trefs/heads/main\n";
        let tags = parse_refs(output, "refs/tags/");
        assert_eq!(tags, vec!["v1.2.0", "v1.10.0"]);
    }

    #[test]
    fn parse_branches_from_ls_remote() {
        let output = "\
abc123\trefs/heads/main\n\
def456\trefs/heads/17.0-develop\n";
        let branches = parse_refs(output, "refs/heads/");
        assert_eq!(branches, vec!["main", "17.0-develop"]);
    }

    #[test]
    fn parse_refs_ignores_garbage() {
        assert!(parse_refs("", "refs/tags/").is_empty());
        assert!(parse_refs("not a ref line", "refs/tags/").is_empty());
    }
}
