use crate::processor::{ItemOutcome, ItemProcessor};
use crate::remote::{RemoteKey, RemoteStore};
use crate::staging;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    /// Maximum items pulled per cycle.
    pub batch_size: usize,
    /// Base idle wait; the n-th consecutive empty poll waits `base_wait * n`.
    pub base_wait: Duration,
    /// Consecutive empty polls before the worker exits cleanly.
    pub max_idle_checks: u32,
    pub max_concurrent_items: usize,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            inbox: PathBuf::from(
                std::env::var("LOCAL_INBOX").unwrap_or_else(|_| "data/inbox".into()),
            ),
            outbox: PathBuf::from(
                std::env::var("LOCAL_OUTBOX").unwrap_or_else(|_| "data/outbox".into()),
            ),
            batch_size: std::env::var("BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(10),
            base_wait: Duration::from_secs(
                std::env::var("BASE_WAIT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(600),
            ),
            max_idle_checks: std::env::var("MAX_IDLE_CHECKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(10),
            max_concurrent_items: std::env::var("MAX_CONCURRENT_ITEMS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(4),
        }
    }
}

/// The control loop: POLLING → PROCESSING → PUBLISHING → CLEANUP →
/// (IDLE_BACKOFF | POLLING) → … → TERMINATED.
///
/// Cycle-level remote failures are logged and retried on the next cycle;
/// the loop only ends on the idle ceiling or a shutdown request.
pub struct Scheduler<R> {
    config: SchedulerConfig,
    remote: Arc<R>,
    processor: Arc<ItemProcessor>,
    shutdown: CancellationToken,
}

impl<R: RemoteStore + 'static> Scheduler<R> {
    pub fn new(
        config: SchedulerConfig,
        remote: Arc<R>,
        processor: Arc<ItemProcessor>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            remote,
            processor,
            shutdown,
        }
    }

    pub async fn run(&self) -> eyre::Result<()> {
        staging::ensure(&self.config.inbox)?;
        staging::ensure(&self.config.outbox)?;

        let mut idle_checks: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                info!(target: "attrib.scheduler", "shutdown requested, exiting main loop");
                break;
            }

            let pulled = match self
                .remote
                .pull_batch(&self.config.inbox, self.config.batch_size)
                .await
            {
                Ok(keys) => keys,
                Err(err) => {
                    error!(target: "attrib.scheduler", error = %err, "polling failed, retrying next cycle");
                    if !self.pause(self.config.base_wait).await {
                        break;
                    }
                    continue;
                }
            };

            let downloaded = pulled.len();
            info!(target: "attrib.scheduler", downloaded, "downloaded batch");

            if downloaded == 0 {
                idle_checks += 1;
                if idle_checks >= self.config.max_idle_checks {
                    info!(
                        target: "attrib.scheduler",
                        idle_checks,
                        "no new items after repeated polls, work is drained, stopping"
                    );
                    break;
                }
                let wait = self.config.base_wait * idle_checks;
                warn!(
                    target: "attrib.scheduler",
                    idle_checks,
                    wait_secs = wait.as_secs(),
                    "no new items found, backing off"
                );
                if !self.pause(wait).await {
                    break;
                }
                continue;
            }
            idle_checks = 0;

            let (processed, interrupted) = self.process_batch(&pulled).await?;
            info!(
                target: "attrib.scheduler",
                processed = processed.len(),
                of = downloaded,
                "finished processing batch"
            );

            if !processed.is_empty() {
                match self
                    .remote
                    .publish_results(&self.config.outbox, &processed)
                    .await
                {
                    Ok(report) => {
                        info!(
                            target: "attrib.scheduler",
                            uploaded = report.uploaded,
                            archived = report.archived,
                            archive_failures = report.archive_failures.len(),
                            "published results"
                        );
                    }
                    Err(err) => {
                        error!(
                            target: "attrib.scheduler",
                            error = %err,
                            "publishing failed, results stay local and originals stay inbound"
                        );
                        if !self.pause(self.config.base_wait).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            if interrupted || self.shutdown.is_cancelled() {
                info!(
                    target: "attrib.scheduler",
                    "shutdown requested during this cycle, keeping local staging for the next start"
                );
                break;
            }

            staging::purge(&self.config.inbox);
            staging::purge(&self.config.outbox);

            if downloaded == self.config.batch_size {
                info!(
                    target: "attrib.scheduler",
                    batch_size = self.config.batch_size,
                    "processed a full batch, more items may be pending, polling again immediately"
                );
            } else {
                info!(
                    target: "attrib.scheduler",
                    downloaded,
                    "processed fewer items than the batch size, inbound likely drained"
                );
            }
        }

        info!(target: "attrib.scheduler", "worker exiting");
        Ok(())
    }

    /// PROCESSING: run items concurrently up to the configured limit, with a
    /// shutdown check before each dispatch. Returns the keys of items whose
    /// result file landed in the outbox, plus whether dispatch was cut short.
    async fn process_batch(&self, pulled: &[RemoteKey]) -> eyre::Result<(Vec<RemoteKey>, bool)> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_items));
        let mut tasks: JoinSet<Option<RemoteKey>> = JoinSet::new();
        let mut interrupted = false;

        for key in pulled {
            if self.shutdown.is_cancelled() {
                info!(target: "attrib.scheduler", "shutdown requested, stopping item dispatch");
                interrupted = true;
                break;
            }

            let name = key.basename().to_string();
            let mut item = match staging::read_json(&self.config.inbox, &name) {
                Ok(item) => item,
                Err(err) => {
                    error!(target: "attrib.scheduler", file = %name, error = %err, "excluding item from batch");
                    continue;
                }
            };

            let permit = semaphore.clone().acquire_owned().await?;
            // the permit may have taken a while, re-check before dispatching
            if self.shutdown.is_cancelled() {
                info!(target: "attrib.scheduler", "shutdown requested, stopping item dispatch");
                interrupted = true;
                break;
            }

            let processor = self.processor.clone();
            let outbox = self.config.outbox.clone();
            let key = key.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = processor.process(&mut item).await;
                if outcome == ItemOutcome::SkippedNoMedia {
                    warn!(target: "attrib.scheduler", file = %name, "publishing item unresolved, no usable media");
                }
                match staging::write_json(&outbox, &name, &item) {
                    Ok(()) => {
                        info!(target: "attrib.scheduler", file = %name, "result staged");
                        Some(key)
                    }
                    Err(err) => {
                        error!(
                            target: "attrib.scheduler",
                            file = %name,
                            error = %err,
                            "could not stage result, item will be re-fetched next run"
                        );
                        None
                    }
                }
            });
        }

        let mut processed = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Some(key)) => processed.push(key),
                Ok(None) => {}
                Err(err) => error!(target: "attrib.scheduler", error = %err, "item task failed"),
            }
        }
        Ok((processed, interrupted))
    }

    /// Cancellable sleep. Returns `false` when shutdown fired first.
    async fn pause(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!(target: "attrib.scheduler", "shutdown requested during wait");
                false
            }
            _ = sleep(wait) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failures::FailureLog;
    use crate::http::build_client;
    use crate::llm::LlmError;
    use crate::media::MediaFetcher;
    use crate::processor::{AttributeQuery, Classifier};
    use crate::remote::{PublishReport, RemoteError};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// In-memory remote endpoint: `inbound` maps key path → body.
    #[derive(Default)]
    struct MockRemote {
        inbound: Mutex<BTreeMap<String, String>>,
        archived: Mutex<Vec<String>>,
        uploaded: Mutex<Vec<String>>,
        pulls: AtomicUsize,
    }

    impl MockRemote {
        fn seed(items: &[(&str, String)]) -> Arc<Self> {
            let remote = Self::default();
            let mut inbound = remote.inbound.lock().unwrap();
            for (key, body) in items {
                inbound.insert(key.to_string(), body.clone());
            }
            drop(inbound);
            Arc::new(remote)
        }
    }

    #[async_trait]
    impl RemoteStore for MockRemote {
        async fn pull_batch(
            &self,
            inbox: &Path,
            max_items: usize,
        ) -> Result<Vec<RemoteKey>, RemoteError> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            let inbound = self.inbound.lock().unwrap();
            let mut keys = Vec::new();
            for (path, body) in inbound.iter().take(max_items) {
                let key = RemoteKey::new(path.clone());
                std::fs::write(inbox.join(key.basename()), body).unwrap();
                keys.push(key);
            }
            Ok(keys)
        }

        async fn publish_results(
            &self,
            outbox: &Path,
            processed: &[RemoteKey],
        ) -> Result<PublishReport, RemoteError> {
            let mut uploaded = self.uploaded.lock().unwrap();
            for name in staging::list_files(outbox).unwrap() {
                uploaded.push(name);
            }
            let count = uploaded.len();
            drop(uploaded);

            let mut inbound = self.inbound.lock().unwrap();
            let mut archived = self.archived.lock().unwrap();
            for key in processed {
                inbound.remove(&key.path);
                archived.push(key.path.clone());
            }
            Ok(PublishReport {
                uploaded: count,
                archived: processed.len(),
                archive_failures: Vec::new(),
            })
        }
    }

    struct ScriptedClassifier;

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn resolve_attribute(&self, _query: &AttributeQuery) -> Result<String, LlmError> {
            Ok("v".into())
        }
    }

    /// Requests shutdown from inside the first classification, as a signal
    /// arriving while an item is in flight would.
    struct CancellingClassifier {
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl Classifier for CancellingClassifier {
        async fn resolve_attribute(&self, _query: &AttributeQuery) -> Result<String, LlmError> {
            self.shutdown.cancel();
            Ok("v".into())
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: SchedulerConfig,
        processor: Arc<ItemProcessor>,
        shutdown: CancellationToken,
    }

    fn fixture(batch_size: usize, max_idle_checks: u32) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let shutdown = CancellationToken::new();
        let config = SchedulerConfig {
            inbox: dir.path().join("inbox"),
            outbox: dir.path().join("outbox"),
            batch_size,
            base_wait: Duration::from_secs(1),
            max_idle_checks,
            max_concurrent_items: 1,
        };
        let processor = Arc::new(ItemProcessor::new(
            Arc::new(ScriptedClassifier),
            MediaFetcher::new(build_client()),
            Arc::new(FailureLog::new(dir.path().join("failed.txt"))),
        ));
        Fixture {
            _dir: dir,
            config,
            processor,
            shutdown,
        }
    }

    // Items have no media, so the processor takes the no-media path and no
    // network is touched; the control-flow assertions are unaffected.
    fn no_media_item(id: u64) -> String {
        format!(
            r#"{{"ProduktID": {id}, "Klassifikations-Attribute": [{{"Identifier": "kragenform"}}]}}"#
        )
    }

    fn media_item(id: u64, image_base: &str) -> String {
        format!(
            r#"{{"ProduktID": {id}, "Hauptbild": "{image_base}/{id}.jpg", "Klassifikations-Attribute": [{{"Identifier": "kragenform"}}]}}"#
        )
    }

    #[tokio::test(start_paused = true)]
    async fn drains_three_items_in_two_cycles_then_idles_out() {
        let remote = MockRemote::seed(&[
            ("inbound/a.json", no_media_item(1)),
            ("inbound/b.json", no_media_item(2)),
            ("inbound/c.json", no_media_item(3)),
        ]);
        let fx = fixture(2, 3);
        let scheduler = Scheduler::new(
            fx.config.clone(),
            remote.clone(),
            fx.processor.clone(),
            fx.shutdown.clone(),
        );
        scheduler.run().await.expect("run");

        let archived = remote.archived.lock().unwrap().clone();
        assert_eq!(
            archived,
            vec![
                "inbound/a.json".to_string(),
                "inbound/b.json".to_string(),
                "inbound/c.json".to_string(),
            ]
        );
        // cycle 1 (full batch), cycle 2 (remainder), then 3 idle polls
        assert_eq!(remote.pulls.load(Ordering::SeqCst), 2 + 3);
        // cleanup ran: both staging dirs are empty again
        assert!(staging::list_files(&fx.config.inbox).unwrap().is_empty());
        assert!(staging::list_files(&fx.config.outbox).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminates_after_idle_ceiling_without_more_polls() {
        let remote = MockRemote::seed(&[]);
        let fx = fixture(2, 4);
        let scheduler = Scheduler::new(
            fx.config.clone(),
            remote.clone(),
            fx.processor.clone(),
            fx.shutdown.clone(),
        );
        scheduler.run().await.expect("run");
        assert_eq!(remote.pulls.load(Ordering::SeqCst), 4);
        assert!(remote.archived.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_before_a_cycle_exits_without_polling() {
        let remote = MockRemote::seed(&[("inbound/a.json", no_media_item(1))]);
        let fx = fixture(2, 3);
        let scheduler = Scheduler::new(
            fx.config.clone(),
            remote.clone(),
            fx.processor.clone(),
            fx.shutdown.clone(),
        );

        fx.shutdown.cancel();
        scheduler.run().await.expect("run");

        assert_eq!(remote.pulls.load(Ordering::SeqCst), 0);
        assert!(remote.archived.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_mid_batch_publishes_finished_item_and_keeps_the_rest() {
        let mut server = mockito::Server::new_async().await;
        let _image = server
            .mock("GET", "/1.jpg")
            .with_status(200)
            .with_header("content-type", "image/jpeg")
            .with_body(vec![0xffu8, 0xd8])
            .create_async()
            .await;
        let remote = MockRemote::seed(&[
            ("inbound/a.json", media_item(1, &server.url())),
            ("inbound/b.json", media_item(2, &server.url())),
        ]);

        let dir = tempfile::tempdir().expect("tempdir");
        let shutdown = CancellationToken::new();
        let config = SchedulerConfig {
            inbox: dir.path().join("inbox"),
            outbox: dir.path().join("outbox"),
            batch_size: 2,
            base_wait: Duration::from_secs(1),
            max_idle_checks: 3,
            max_concurrent_items: 1,
        };
        let processor = Arc::new(ItemProcessor::new(
            Arc::new(CancellingClassifier {
                shutdown: shutdown.clone(),
            }),
            MediaFetcher::new(build_client()),
            Arc::new(FailureLog::new(dir.path().join("failed.txt"))),
        ));
        let scheduler = Scheduler::new(config.clone(), remote.clone(), processor, shutdown);
        scheduler.run().await.expect("run");

        // the in-flight item completed, was uploaded and archived
        assert_eq!(
            remote.archived.lock().unwrap().clone(),
            vec!["inbound/a.json".to_string()]
        );
        assert_eq!(
            remote.uploaded.lock().unwrap().clone(),
            vec!["a.json".to_string()]
        );
        // the unstarted item stays inbound for the next run
        assert!(
            remote
                .inbound
                .lock()
                .unwrap()
                .contains_key("inbound/b.json")
        );
        // cleanup was skipped, local staging survives
        assert_eq!(
            staging::list_files(&config.inbox).unwrap(),
            vec!["a.json".to_string(), "b.json".to_string()]
        );
        assert_eq!(
            staging::list_files(&config.outbox).unwrap(),
            vec!["a.json".to_string()]
        );
    }

    #[tokio::test]
    async fn shutdown_during_processing_keeps_unstarted_items_remote() {
        let remote = MockRemote::seed(&[
            ("inbound/a.json", no_media_item(1)),
            ("inbound/b.json", no_media_item(2)),
        ]);
        let fx = fixture(2, 3);
        let scheduler = Scheduler::new(
            fx.config.clone(),
            remote.clone(),
            fx.processor.clone(),
            fx.shutdown.clone(),
        );

        // pull the batch ourselves, then drive PROCESSING with shutdown
        // already requested
        staging::ensure(&fx.config.inbox).unwrap();
        staging::ensure(&fx.config.outbox).unwrap();
        let pulled = remote
            .pull_batch(&fx.config.inbox, fx.config.batch_size)
            .await
            .unwrap();
        fx.shutdown.cancel();
        let (processed, interrupted) = scheduler.process_batch(&pulled).await.unwrap();

        assert!(interrupted);
        assert!(processed.is_empty());
        assert!(staging::list_files(&fx.config.outbox).unwrap().is_empty());
    }
}
