use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::closer::Closer;

/// 文件变更回调
pub type WatchCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// 监视单个文件：事件经去抖后调用回调
///
/// 监视的是父目录（编辑器常用“写临时文件再 rename”的方式保存），
/// 按文件名过滤事件。
pub struct FileWatcher {
    name: String,
    path: PathBuf,
    cancel: CancellationToken,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileWatcher {
    /// 启动监视；必须在 tokio 运行时内调用
    pub fn spawn(
        path: &Path,
        debounce: Duration,
        parent: &CancellationToken,
        callback: WatchCallback,
    ) -> anyhow::Result<Self> {
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .with_context(|| format!("watch path has no file name: {}", path.display()))?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel::<()>();
        let watcher = build_watcher(&dir, file_name, tx)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        let cancel = parent.child_token();
        tokio::spawn(debounce_loop(
            path.to_path_buf(),
            rx,
            debounce,
            cancel.clone(),
            callback,
        ));

        info!(path = %path.display(), debounce_ms = debounce.as_millis() as u64, "file watcher started");
        Ok(Self {
            name: format!("watcher:{}", path.display()),
            path: path.to_path_buf(),
            cancel,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if watcher.is_some() {
            debug!(path = %self.path.display(), "file watcher stopped");
        }
    }
}

#[async_trait]
impl Closer for FileWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.stop();
        Ok(())
    }
}

fn build_watcher(
    dir: &Path,
    file_name: OsString,
    tx: mpsc::UnboundedSender<()>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "file watcher error");
                return;
            }
        };
        let interested = event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove();
        if interested
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()))
        {
            let _ = tx.send(());
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

async fn debounce_loop(
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    cancel: CancellationToken,
    callback: WatchCallback,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                if event.is_none() {
                    break;
                }
                // 窗口内的后续事件合并为一次
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(debounce) => break,
                        more = rx.recv() => {
                            if more.is_none() {
                                break;
                            }
                        }
                    }
                }
                debug!(path = %path.display(), "watched file changed");
                callback().await;
            }
        }
    }
    debug!(path = %path.display(), "file watcher loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback() -> (Arc<AtomicUsize>, Arc<tokio::sync::Notify>, WatchCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(tokio::sync::Notify::new());
        let (c, f) = (count.clone(), fired.clone());
        let cb: WatchCallback = Arc::new(move || {
            let (c, f) = (c.clone(), f.clone());
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                f.notify_one();
            })
        });
        (count, fired, cb)
    }

    #[tokio::test]
    async fn burst_of_writes_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        let (count, fired, cb) = counting_callback();
        let cancel = CancellationToken::new();
        let watcher = FileWatcher::spawn(&path, Duration::from_millis(200), &cancel, cb).unwrap();

        for i in 0..3 {
            std::fs::write(&path, format!("{{\"n\": {}}}", i)).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), fired.notified())
            .await
            .expect("callback not fired");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        watcher.close().await.unwrap();
    }

    #[tokio::test]
    async fn unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user_servers.json");
        let (count, _fired, cb) = counting_callback();
        let cancel = CancellationToken::new();
        let _watcher = FileWatcher::spawn(&path, Duration::from_millis(50), &cancel, cb).unwrap();

        std::fs::write(dir.path().join("other.json"), "{}").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_watcher_stays_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        let (count, _fired, cb) = counting_callback();
        let cancel = CancellationToken::new();
        let _watcher = FileWatcher::spawn(&path, Duration::from_millis(50), &cancel, cb).unwrap();

        cancel.cancel();
        std::fs::write(&path, "{}").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("servers.json");
        let (_, _, cb) = counting_callback();
        assert!(FileWatcher::spawn(&path, Duration::from_millis(50), &CancellationToken::new(), cb).is_err());
    }
}
