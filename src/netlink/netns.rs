//! Netlink work inside named network namespaces.
//!
//! `setns()` changes the namespace of the calling OS thread, so every switch
//! happens on one dedicated thread. Each job gets a fresh rtnetlink
//! connection opened inside the target namespace, and the original
//! namespace is restored before the next job runs.

use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};

use futures::future::LocalBoxFuture;
use nix::sched::{CloneFlags, setns};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::{Error, Result};

/// Name of the namespace the agent itself runs in.
pub const MAIN_NETNS: &str = "main";

type Job = Box<dyn FnOnce(Result<rtnetlink::Handle>) -> LocalBoxFuture<'static, ()> + Send>;

struct Request {
    netns: String,
    job: Job,
}

/// Restores the namespace saved at creation when dropped.
struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    fn enter(path: &Path) -> std::io::Result<Self> {
        let original = File::open("/proc/self/ns/net")?;
        let target = File::open(path)?;
        setns(&target, CloneFlags::CLONE_NEWNET)?;
        Ok(Self { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            error!("failed to restore network namespace: {e}");
        }
    }
}

/// Path of the bind-mounted namespace file created by `ip netns add`.
pub fn netns_path(run_dir: &Path, netns: &str) -> PathBuf {
    run_dir.join(netns)
}

pub fn is_main(netns: &str) -> bool {
    netns.is_empty() || netns == MAIN_NETNS
}

/// Open a namespace file, e.g. to move a link into it.
pub fn open_netns(run_dir: &Path, netns: &str) -> Result<File> {
    let path = if is_main(netns) {
        PathBuf::from("/proc/1/ns/net")
    } else {
        netns_path(run_dir, netns)
    };
    File::open(&path).map_err(|e| Error::Namespace {
        netns: netns.to_string(),
        reason: format!("cannot open {}: {e}", path.display()),
    })
}

/// Handle to the namespace worker thread; cheap to clone.
#[derive(Clone)]
pub struct NetnsWorker {
    tx: mpsc::UnboundedSender<Request>,
    run_dir: PathBuf,
}

impl NetnsWorker {
    /// Start the worker thread. `run_dir` holds the namespace files.
    pub fn spawn(run_dir: impl Into<PathBuf>) -> Result<Self> {
        let run_dir = run_dir.into();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let thread_dir = run_dir.clone();
        std::thread::Builder::new()
            .name("netns-worker".into())
            .spawn(move || worker_loop(rt, &thread_dir, rx))?;
        Ok(Self { tx, run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Run `f` with a netlink handle bound to `netns` and wait for its result.
    pub async fn run<T, F, Fut>(&self, netns: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(rtnetlink::Handle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |handle| {
            Box::pin(async move {
                let result = match handle {
                    Ok(handle) => f(handle).await,
                    Err(e) => Err(e),
                };
                let _ = reply_tx.send(result);
            })
        });
        let worker_gone = || Error::Namespace {
            netns: netns.to_string(),
            reason: "namespace worker is not running".into(),
        };
        self.tx
            .send(Request {
                netns: netns.to_string(),
                job,
            })
            .map_err(|_| worker_gone())?;
        reply_rx.await.map_err(|_| worker_gone())?
    }
}

fn worker_loop(
    rt: tokio::runtime::Runtime,
    run_dir: &Path,
    mut rx: mpsc::UnboundedReceiver<Request>,
) {
    while let Some(Request { netns, job }) = rx.blocking_recv() {
        let guard = if is_main(&netns) {
            Ok(None)
        } else {
            NetnsGuard::enter(&netns_path(run_dir, &netns)).map(Some)
        };
        match guard {
            Ok(_guard) => {
                debug!(netns = %netns, "running netlink job");
                rt.block_on(async {
                    match rtnetlink::new_connection() {
                        Ok((conn, handle, _)) => {
                            let conn = tokio::spawn(conn);
                            job(Ok(handle)).await;
                            conn.abort();
                        }
                        Err(e) => job(Err(e.into())).await,
                    }
                });
            }
            Err(e) => {
                let err = Error::Namespace {
                    netns: netns.clone(),
                    reason: format!("cannot enter: {e}"),
                };
                rt.block_on(job(Err(err)));
            }
        }
    }
    debug!("namespace worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_namespace_names() {
        assert!(is_main(""));
        assert!(is_main(MAIN_NETNS));
        assert!(!is_main("network-lan"));
        assert_eq!(
            netns_path(Path::new("/var/run/netns"), "endpoint-web"),
            PathBuf::from("/var/run/netns/endpoint-web")
        );
    }

    #[tokio::test]
    async fn missing_namespace_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let worker = NetnsWorker::spawn(dir.path()).unwrap();
        let result = worker.run("nonexistent", |_handle| async { Ok(()) }).await;
        match result {
            Err(Error::Namespace { netns, .. }) => assert_eq!(netns, "nonexistent"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn open_missing_namespace_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            open_netns(dir.path(), "nope"),
            Err(Error::Namespace { .. })
        ));
    }
}
