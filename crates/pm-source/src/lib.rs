//! Source descriptors: where a package's content comes from, and how to get
//! it onto disk.
//!
//! A [`Source`] is a closed sum type over the VCS/archive kinds a package id
//! can resolve to. `download` materializes it into a directory; `apply_version`
//! substitutes version-field placeholders into URLs and refs before download.

use pm_types::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid url for {kind} source: {url}")]
    InvalidUrl { kind: &'static str, url: String },
    #[error("git error: {0}")]
    Git(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("all {attempts} attempts failed, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// A revision selector shared by the VCSes that distinguish tag/branch/commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GitRef {
    Tag(String),
    Branch(String),
    Commit(String),
}

/// `Hg` additionally supports a numeric local revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HgRef {
    Tag(String),
    Branch(String),
    Commit(String),
    Revision(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BzrRef {
    Tag(String),
    Revision(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SvnRef {
    Tag(String),
    Branch(String),
    Revision(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CvsRef {
    Tag(String),
    Branch(String),
    Revision(String),
}

/// The source descriptor sum type. Variants mirror the VCS/archive kinds a
/// package id can point at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Empty,
    RemoteFile { url: String },
    RemoteFiles { urls: BTreeSet<String> },
    Git { url: String, r#ref: GitRef },
    Hg { url: String, r#ref: HgRef },
    Bzr { url: String, r#ref: BzrRef },
    Fossil { url: String, r#ref: GitRef },
    Cvs { url: String, module: String, r#ref: CvsRef },
    Svn { url: String, r#ref: SvnRef },
}

impl Source {
    fn kind(&self) -> &'static str {
        match self {
            Source::Empty => "empty",
            Source::RemoteFile { .. } => "remote",
            Source::RemoteFiles { .. } => "files",
            Source::Git { .. } => "git",
            Source::Hg { .. } => "hg",
            Source::Bzr { .. } => "bzr",
            Source::Fossil { .. } => "fossil",
            Source::Cvs { .. } => "cvs",
            Source::Svn { .. } => "svn",
        }
    }

    /// Canonicalized key used to dedup concurrent downloads of the same
    /// source — effectively its serialized form.
    pub fn canonical_key(&self) -> String {
        format!("{:?}", self)
    }

    /// Source-kind-specific URL grammar check.
    pub fn is_valid_url(&self) -> bool {
        match self {
            Source::Empty => true,
            Source::RemoteFile { url } => is_http_like(url),
            Source::RemoteFiles { urls } => !urls.is_empty() && urls.iter().all(|u| is_http_like(u)),
            Source::Git { url, .. } | Source::Fossil { url, .. } => is_http_like(url) || is_scp_like(url),
            Source::Hg { url, .. } | Source::Bzr { url, .. } | Source::Svn { url, .. } => {
                is_http_like(url) || is_scp_like(url)
            }
            // CVS's pserver/ext grammar: -d:method:user@host:path
            Source::Cvs { url, .. } => url.starts_with("-d:") && url.matches(':').count() >= 3,
        }
    }

    /// Substitute `{version}`/`{major}`/`{minor}`/`{patch}` placeholders into
    /// the URL and any tag/branch ref fields.
    pub fn apply_version(&mut self, v: &Version) -> Result<(), SourceError> {
        let subst = |s: &str| -> String { substitute_version_fields(s, v) };
        match self {
            Source::Empty => {}
            Source::RemoteFile { url } => *url = subst(url),
            Source::RemoteFiles { urls } => {
                *urls = urls.iter().map(|u| subst(u)).collect();
            }
            Source::Git { url, r#ref } | Source::Fossil { url, r#ref } => {
                *url = subst(url);
                *r#ref = match r#ref {
                    GitRef::Tag(t) => GitRef::Tag(subst(t)),
                    GitRef::Branch(b) => GitRef::Branch(subst(b)),
                    GitRef::Commit(c) => GitRef::Commit(c.clone()),
                };
            }
            Source::Hg { url, r#ref } => {
                *url = subst(url);
                *r#ref = match r#ref {
                    HgRef::Tag(t) => HgRef::Tag(subst(t)),
                    HgRef::Branch(b) => HgRef::Branch(subst(b)),
                    HgRef::Commit(c) => HgRef::Commit(c.clone()),
                    HgRef::Revision(r) => HgRef::Revision(*r),
                };
            }
            Source::Bzr { url, r#ref } => {
                *url = subst(url);
                if let BzrRef::Tag(t) = r#ref {
                    *t = subst(t);
                }
            }
            Source::Cvs { url, module, r#ref } => {
                *url = subst(url);
                *module = subst(module);
                if let CvsRef::Tag(t) = r#ref {
                    *t = subst(t);
                }
            }
            Source::Svn { url, r#ref } => {
                *url = subst(url);
                if let SvnRef::Tag(t) = r#ref {
                    *t = subst(t);
                }
            }
        }
        Ok(())
    }

    /// Materialize the source into `dir`. Each network operation retries a
    /// small fixed number of times on transient failure.
    pub async fn download(&self, dir: &Path) -> Result<DownloadOutcome, SourceError> {
        if !self.is_valid_url() && !matches!(self, Source::Empty) {
            return Err(SourceError::InvalidUrl {
                kind: self.kind(),
                url: self.display_url(),
            });
        }
        with_retries(3, || self.download_once(dir)).await
    }

    fn display_url(&self) -> String {
        match self {
            Source::Empty => String::new(),
            Source::RemoteFile { url } => url.clone(),
            Source::RemoteFiles { urls } => urls.iter().next().cloned().unwrap_or_default(),
            Source::Git { url, .. }
            | Source::Fossil { url, .. }
            | Source::Hg { url, .. }
            | Source::Bzr { url, .. }
            | Source::Cvs { url, .. }
            | Source::Svn { url, .. } => url.clone(),
        }
    }

    async fn download_once(&self, dir: &Path) -> Result<DownloadOutcome, SourceError> {
        tokio::fs::create_dir_all(dir).await?;
        match self {
            Source::Empty => Ok(DownloadOutcome { revision: None }),
            Source::RemoteFile { url } => {
                download_and_unpack(url, dir).await?;
                Ok(DownloadOutcome { revision: None })
            }
            Source::RemoteFiles { urls } => {
                for url in urls {
                    download_and_unpack(url, dir).await?;
                }
                Ok(DownloadOutcome { revision: None })
            }
            Source::Git { url, r#ref } => download_git(url, r#ref, dir).await,
            Source::Fossil { url, r#ref } => download_git(url, r#ref, dir).await,
            Source::Hg { url, r#ref } => download_hg(url, r#ref, dir).await,
            Source::Bzr { url, r#ref } => download_bzr(url, r#ref, dir).await,
            Source::Svn { url, r#ref } => download_svn(url, r#ref, dir).await,
            Source::Cvs { url, module, r#ref } => download_cvs(url, module, r#ref, dir).await,
        }
    }
}

/// Result of materializing a source: the resolved revision, if the source
/// kind tracks one.
#[derive(Debug, Clone, Default)]
pub struct DownloadOutcome {
    pub revision: Option<String>,
}

fn is_http_like(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://") || url.starts_with("git://")
}

fn is_scp_like(url: &str) -> bool {
    // e.g. git@github.com:user/repo.git
    url.contains('@') && url.contains(':') && !url.contains("://")
}

fn substitute_version_fields(s: &str, v: &Version) -> String {
    let (major, minor, patch) = match v {
        Version::Number { major, minor, patch, .. } => (*major, *minor, *patch),
        _ => (0, 0, 0),
    };
    s.replace("{version}", &v.to_string())
        .replace("{major}", &major.to_string())
        .replace("{minor}", &minor.to_string())
        .replace("{patch}", &patch.to_string())
}

async fn with_retries<F, Fut>(attempts: u32, mut f: F) -> Result<DownloadOutcome, SourceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<DownloadOutcome, SourceError>>,
{
    let mut last = String::new();
    for attempt in 0..attempts {
        match f().await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => {
                last = e.to_string();
                if attempt + 1 < attempts {
                    tracing::warn!("download attempt {} failed: {}, retrying", attempt + 1, last);
                    tokio::time::sleep(std::time::Duration::from_millis(200 * (attempt as u64 + 1))).await;
                }
            }
        }
    }
    Err(SourceError::RetriesExhausted { attempts, last })
}

const ARCHIVE_HOSTS: &[&str] = &["github.com", "gitlab.com", "bitbucket.org"];

fn archive_url_for(url: &str, r#ref: &GitRef) -> Option<String> {
    let host_recognized = ARCHIVE_HOSTS.iter().any(|h| url.contains(h));
    if !host_recognized {
        return None;
    }
    let rev = match r#ref {
        GitRef::Tag(t) => t.clone(),
        GitRef::Branch(b) => b.clone(),
        GitRef::Commit(c) => c.clone(),
    };
    let repo = url
        .trim_end_matches(".git")
        .trim_end_matches('/');
    if url.contains("github.com") {
        Some(format!("{repo}/archive/{rev}.tar.gz"))
    } else if url.contains("gitlab.com") {
        Some(format!("{repo}/-/archive/{rev}/archive.tar.gz"))
    } else if url.contains("bitbucket.org") {
        Some(format!("{repo}/get/{rev}.tar.gz"))
    } else {
        None
    }
}

async fn download_git(url: &str, r#ref: &GitRef, dir: &Path) -> Result<DownloadOutcome, SourceError> {
    if let Some(archive) = archive_url_for(url, r#ref) {
        if download_and_unpack(&archive, dir).await.is_ok() {
            let rev = match r#ref {
                GitRef::Commit(c) => Some(c.clone()),
                _ => None,
            };
            return Ok(DownloadOutcome { revision: rev });
        }
        tracing::warn!("archive download failed for {url}, falling back to clone");
    }
    clone_git(url, r#ref, dir).await
}

async fn clone_git(url: &str, r#ref: &GitRef, dir: &Path) -> Result<DownloadOutcome, SourceError> {
    let url = url.to_string();
    let dir = dir.to_path_buf();
    let r#ref = r#ref.clone();
    // Shell to the git binary: more reliable for annotated tags than
    // driving gix's refspec plumbing.
    tokio::task::spawn_blocking(move || -> Result<DownloadOutcome, SourceError> {
        let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
        match &r#ref {
            GitRef::Tag(t) => {
                args.push("--branch".to_string());
                args.push(t.clone());
            }
            GitRef::Branch(b) => {
                args.push("--branch".to_string());
                args.push(b.clone());
            }
            GitRef::Commit(_) => {}
        }
        args.push(url.clone());
        args.push(dir.to_string_lossy().to_string());

        let output = StdCommand::new("git")
            .args(&args)
            .output()
            .map_err(|e| SourceError::Git(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            return Err(SourceError::Git(String::from_utf8_lossy(&output.stderr).into_owned()));
        }

        if let GitRef::Commit(c) = &r#ref {
            let co = StdCommand::new("git")
                .args(["checkout", c])
                .current_dir(&dir)
                .output()
                .map_err(|e| SourceError::Git(format!("failed to run git: {e}")))?;
            if !co.status.success() {
                return Err(SourceError::Git(String::from_utf8_lossy(&co.stderr).into_owned()));
            }
        }

        let rev_output = StdCommand::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&dir)
            .output()
            .map_err(|e| SourceError::Git(format!("failed to get revision: {e}")))?;
        let revision = String::from_utf8_lossy(&rev_output.stdout).trim().to_string();
        Ok(DownloadOutcome { revision: Some(revision) })
    })
    .await
    .map_err(|e| SourceError::Git(format!("task join error: {e}")))?
}

async fn download_hg(url: &str, r#ref: &HgRef, dir: &Path) -> Result<DownloadOutcome, SourceError> {
    let url = url.to_string();
    let dir = dir.to_path_buf();
    let r#ref = r#ref.clone();
    tokio::task::spawn_blocking(move || -> Result<DownloadOutcome, SourceError> {
        let mut args = vec!["clone".to_string(), url.clone(), dir.to_string_lossy().to_string()];
        let rev = match &r#ref {
            HgRef::Tag(t) => Some(t.clone()),
            HgRef::Branch(b) => Some(b.clone()),
            HgRef::Commit(c) => Some(c.clone()),
            HgRef::Revision(r) => Some(r.to_string()),
        };
        if let Some(rev) = &rev {
            args.push("-u".to_string());
            args.push(rev.clone());
        }
        let output = StdCommand::new("hg")
            .args(&args)
            .output()
            .map_err(|e| SourceError::Git(format!("failed to run hg: {e}")))?;
        if !output.status.success() {
            return Err(SourceError::Git(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(DownloadOutcome { revision: rev })
    })
    .await
    .map_err(|e| SourceError::Git(format!("task join error: {e}")))?
}

async fn download_bzr(url: &str, r#ref: &BzrRef, dir: &Path) -> Result<DownloadOutcome, SourceError> {
    let url = url.to_string();
    let dir = dir.to_path_buf();
    let r#ref = r#ref.clone();
    tokio::task::spawn_blocking(move || -> Result<DownloadOutcome, SourceError> {
        let mut args = vec!["branch".to_string(), url.clone(), dir.to_string_lossy().to_string()];
        let rev = match &r#ref {
            BzrRef::Tag(t) => Some(t.clone()),
            BzrRef::Revision(r) => Some(r.to_string()),
        };
        if let Some(rev) = &rev {
            args.push("-r".to_string());
            args.push(rev.clone());
        }
        let output = StdCommand::new("bzr")
            .args(&args)
            .output()
            .map_err(|e| SourceError::Git(format!("failed to run bzr: {e}")))?;
        if !output.status.success() {
            return Err(SourceError::Git(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(DownloadOutcome { revision: rev })
    })
    .await
    .map_err(|e| SourceError::Git(format!("task join error: {e}")))?
}

async fn download_svn(url: &str, r#ref: &SvnRef, dir: &Path) -> Result<DownloadOutcome, SourceError> {
    let url = url.to_string();
    let dir = dir.to_path_buf();
    let r#ref = r#ref.clone();
    tokio::task::spawn_blocking(move || -> Result<DownloadOutcome, SourceError> {
        let mut args = vec!["checkout".to_string(), url.clone(), dir.to_string_lossy().to_string()];
        let rev = match &r#ref {
            SvnRef::Revision(r) => Some(r.to_string()),
            SvnRef::Tag(t) | SvnRef::Branch(t) => Some(t.clone()),
        };
        if let SvnRef::Revision(r) = &r#ref {
            args.push("-r".to_string());
            args.push(r.to_string());
        }
        let output = StdCommand::new("svn")
            .args(&args)
            .output()
            .map_err(|e| SourceError::Git(format!("failed to run svn: {e}")))?;
        if !output.status.success() {
            return Err(SourceError::Git(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(DownloadOutcome { revision: rev })
    })
    .await
    .map_err(|e| SourceError::Git(format!("task join error: {e}")))?
}

async fn download_cvs(url: &str, module: &str, r#ref: &CvsRef, dir: &Path) -> Result<DownloadOutcome, SourceError> {
    let url = url.to_string();
    let module = module.to_string();
    let dir = dir.to_path_buf();
    let r#ref = r#ref.clone();
    tokio::task::spawn_blocking(move || -> Result<DownloadOutcome, SourceError> {
        let mut args = vec!["-d".to_string(), url.clone(), "checkout".to_string()];
        let rev = match &r#ref {
            CvsRef::Tag(t) | CvsRef::Branch(t) => Some(t.clone()),
            CvsRef::Revision(r) => Some(r.clone()),
        };
        if let Some(rev) = &rev {
            args.push("-r".to_string());
            args.push(rev.clone());
        }
        args.push(module.clone());
        let output = StdCommand::new("cvs")
            .args(&args)
            .current_dir(dir.parent().unwrap_or(&dir))
            .output()
            .map_err(|e| SourceError::Git(format!("failed to run cvs: {e}")))?;
        if !output.status.success() {
            return Err(SourceError::Git(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(DownloadOutcome { revision: rev })
    })
    .await
    .map_err(|e| SourceError::Git(format!("task join error: {e}")))?
}

async fn download_and_unpack(url: &str, dir: &Path) -> Result<(), SourceError> {
    let resp = reqwest::get(url).await?.error_for_status()?;
    let bytes = resp.bytes().await?;

    let is_archive = url.ends_with(".tar.gz") || url.ends_with(".tgz") || url.ends_with(".tar.zst");
    if !is_archive {
        let file_name = url.rsplit('/').next().unwrap_or("download");
        tokio::fs::write(dir.join(file_name), &bytes).await?;
        return Ok(());
    }

    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), SourceError> {
        if url.ends_with(".tar.zst") {
            let decoder = zstd::Decoder::new(std::io::Cursor::new(&bytes[..]))?;
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(&dir)?;
        } else {
            let decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(&bytes[..]));
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(&dir)?;
        }
        Ok(())
    })
    .await
    .map_err(|e| SourceError::Git(format!("task join error: {e}")))??;
    Ok(())
}

/// Downloads are keyed in memory by a canonicalized source value so that
/// identical sources fetched concurrently share a single directory.
#[derive(Default)]
pub struct DownloadCache {
    inflight: Mutex<HashMap<String, Arc<OnceCell<Result<PathBuf, String>>>>>,
}

impl DownloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Download `source` into `dir`, sharing the result with any other
    /// concurrent caller downloading the same canonical source.
    pub async fn download_dedup(&self, source: &Source, dir: &Path) -> Result<PathBuf, SourceError> {
        let key = source.canonical_key();
        let cell = {
            let mut map = self.inflight.lock().unwrap();
            Arc::clone(map.entry(key).or_insert_with(|| Arc::new(OnceCell::new())))
        };
        let result = cell
            .get_or_init(|| async {
                source
                    .download(dir)
                    .await
                    .map(|_| dir.to_path_buf())
                    .map_err(|e| e.to_string())
            })
            .await;
        result.clone().map_err(SourceError::Git)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_url_validation() {
        let s = Source::Git {
            url: "https://github.com/org/repo.git".to_string(),
            r#ref: GitRef::Tag("v1.0.0".to_string()),
        };
        assert!(s.is_valid_url());

        let bad = Source::Git {
            url: "not a url".to_string(),
            r#ref: GitRef::Tag("v1.0.0".to_string()),
        };
        assert!(!bad.is_valid_url());
    }

    #[test]
    fn cvs_url_grammar() {
        let good = Source::Cvs {
            url: "-d:pserver:anonymous@cvs.example.com:/cvsroot".to_string(),
            module: "mymodule".to_string(),
            r#ref: CvsRef::Tag("REL_1_0".to_string()),
        };
        assert!(good.is_valid_url());

        let bad = Source::Cvs {
            url: "cvs.example.com/cvsroot".to_string(),
            module: "mymodule".to_string(),
            r#ref: CvsRef::Tag("REL_1_0".to_string()),
        };
        assert!(!bad.is_valid_url());
    }

    #[test]
    fn apply_version_substitutes_placeholders() {
        let mut s = Source::Git {
            url: "https://example.com/repo/archive/v{version}.tar.gz".to_string(),
            r#ref: GitRef::Tag("v{major}.{minor}.{patch}".to_string()),
        };
        s.apply_version(&Version::new(1, 2, 3)).unwrap();
        match &s {
            Source::Git { url, r#ref } => {
                assert_eq!(url, "https://example.com/repo/archive/v1.2.3.tar.gz");
                assert_eq!(*r#ref, GitRef::Tag("v1.2.3".to_string()));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn archive_url_recognizes_github() {
        let url = archive_url_for(
            "https://github.com/org/repo.git",
            &GitRef::Tag("v1.0.0".to_string()),
        )
        .unwrap();
        assert_eq!(url, "https://github.com/org/repo/archive/v1.0.0.tar.gz");
    }

    #[test]
    fn archive_url_none_for_unknown_host() {
        assert!(archive_url_for("https://example.com/org/repo.git", &GitRef::Tag("v1".into())).is_none());
    }

    #[test]
    fn canonical_key_distinguishes_sources() {
        let a = Source::Git {
            url: "https://example.com/a.git".to_string(),
            r#ref: GitRef::Branch("main".to_string()),
        };
        let b = Source::Git {
            url: "https://example.com/b.git".to_string(),
            r#ref: GitRef::Branch("main".to_string()),
        };
        assert_ne!(a.canonical_key(), b.canonical_key());
    }

    #[tokio::test]
    async fn empty_source_download_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = Source::Empty.download(dir.path()).await.unwrap();
        assert!(outcome.revision.is_none());
    }
}
