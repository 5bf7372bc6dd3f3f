use crate::action::{AfterTransactionCompletionProcess, BeforeTransactionCompletionProcess};
use crate::core::{OrmError, Result};
use crate::session::SessionContext;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{Level, event};

// Callbacks may register further callbacks while a queue drains, so each
// drain step pops one process and releases the lock before awaiting it.

/// FIFO of callbacks run before the transaction commits
#[derive(Default)]
pub struct BeforeTransactionCompletionProcessQueue {
    processes: Mutex<VecDeque<Box<dyn BeforeTransactionCompletionProcess>>>,
}

impl BeforeTransactionCompletionProcessQueue {
    pub fn register(&self, process: Box<dyn BeforeTransactionCompletionProcess>) -> Result<()> {
        self.processes.lock()?.push_back(process);
        Ok(())
    }

    pub fn has_actions(&self) -> bool {
        self.processes.lock().map(|q| !q.is_empty()).unwrap_or(false)
    }

    fn pop(&self) -> Result<Option<Box<dyn BeforeTransactionCompletionProcess>>> {
        Ok(self.processes.lock()?.pop_front())
    }

    /// Runs every process in registration order; the first error aborts the drain.
    pub async fn before_transaction_completion(&self, session: &SessionContext) -> Result<()> {
        while let Some(process) = self.pop()? {
            process.do_before_transaction_completion(session).await?;
        }
        Ok(())
    }
}

/// FIFO of callbacks run after commit or rollback, plus the query spaces to
/// invalidate once they have run
#[derive(Default)]
pub struct AfterTransactionCompletionProcessQueue {
    processes: Mutex<VecDeque<Box<dyn AfterTransactionCompletionProcess>>>,
    query_spaces_to_invalidate: Mutex<BTreeSet<String>>,
}

impl AfterTransactionCompletionProcessQueue {
    pub fn register(&self, process: Box<dyn AfterTransactionCompletionProcess>) -> Result<()> {
        self.processes.lock()?.push_back(process);
        Ok(())
    }

    pub fn has_actions(&self) -> bool {
        self.processes.lock().map(|q| !q.is_empty()).unwrap_or(false)
    }

    pub fn add_space_to_invalidate(&self, space: impl Into<String>) -> Result<()> {
        self.query_spaces_to_invalidate.lock()?.insert(space.into());
        Ok(())
    }

    pub fn spaces_to_invalidate(&self) -> Result<Vec<String>> {
        Ok(self.query_spaces_to_invalidate.lock()?.iter().cloned().collect())
    }

    fn pop(&self) -> Result<Option<Box<dyn AfterTransactionCompletionProcess>>> {
        Ok(self.processes.lock()?.pop_front())
    }

    /// Runs every process, tolerating cache-release failures, then applies
    /// the pending query-space invalidations.
    pub async fn after_transaction_completion(&self, success: bool, session: &SessionContext) -> Result<()> {
        while let Some(process) = self.pop()? {
            match process.do_after_transaction_completion(success, session).await {
                Ok(()) => {}
                Err(e) if e.is_cache_release() => {
                    event!(Level::WARN, error = %e, "unable to release cache lock");
                }
                Err(e) => {
                    return Err(OrmError::AssertionFailure(format!(
                        "Unable to perform after_transaction_completion callback: {}",
                        e
                    )));
                }
            }
        }

        let spaces: Vec<String> = std::mem::take(&mut *self.query_spaces_to_invalidate.lock()?)
            .into_iter()
            .collect();
        if session.is_query_cache_enabled() && !spaces.is_empty() {
            session.timestamps().invalidate(&spaces)?;
        }
        Ok(())
    }
}

/// Both completion queues; shared between a primary session and the
/// secondary sessions that use its transaction
#[derive(Clone, Default)]
pub struct TransactionCompletionProcesses {
    pub before: Arc<BeforeTransactionCompletionProcessQueue>,
    pub after: Arc<AfterTransactionCompletionProcessQueue>,
}

impl TransactionCompletionProcesses {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for TransactionCompletionProcesses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCompletionProcesses")
            .field("before", &self.before.has_actions())
            .field("after", &self.after.has_actions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::MemoryBackend;
    use crate::event::ListenerRegistry;
    use crate::metadata::Metamodel;
    use crate::session::{FactoryServices, SessionFactoryOptions};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    fn session(query_cache: bool) -> SessionContext {
        let options = SessionFactoryOptions::default().query_cache_enabled(query_cache);
        let services = FactoryServices::new(options, Metamodel::new(), ListenerRegistry::new());
        SessionContext::new(services, Box::new(MemoryBackend::new().connect(1)))
    }

    type Log = Arc<StdMutex<Vec<String>>>;

    struct Record {
        name: &'static str,
        log: Log,
        outcome: Option<OrmError>,
        chain: Option<Arc<BeforeTransactionCompletionProcessQueue>>,
    }

    impl Record {
        fn new(name: &'static str, log: &Log) -> Box<Self> {
            Box::new(Self {
                name,
                log: log.clone(),
                outcome: None,
                chain: None,
            })
        }
    }

    #[async_trait]
    impl BeforeTransactionCompletionProcess for Record {
        async fn do_before_transaction_completion(self: Box<Self>, _session: &SessionContext) -> Result<()> {
            self.log.lock().unwrap().push(self.name.to_string());
            if let Some(queue) = &self.chain {
                queue.register(Record::new("chained", &self.log))?;
            }
            match self.outcome {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl AfterTransactionCompletionProcess for Record {
        async fn do_after_transaction_completion(
            self: Box<Self>,
            success: bool,
            _session: &SessionContext,
        ) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, success));
            match self.outcome {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_before_queue_runs_reentrant_registrations() {
        let session = session(false);
        let log: Log = Arc::default();
        let queue = Arc::new(BeforeTransactionCompletionProcessQueue::default());

        let mut first = Record::new("first", &log);
        first.chain = Some(queue.clone());
        queue.register(first).unwrap();
        queue.register(Record::new("second", &log)).unwrap();

        queue.before_transaction_completion(&session).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "chained"]);
        assert!(!queue.has_actions());
    }

    #[tokio::test]
    async fn test_before_queue_error_aborts_remaining() {
        let session = session(false);
        let log: Log = Arc::default();
        let queue = BeforeTransactionCompletionProcessQueue::default();

        let mut failing = Record::new("failing", &log);
        failing.outcome = Some(OrmError::Connection("down".into()));
        queue.register(failing).unwrap();
        queue.register(Record::new("skipped", &log)).unwrap();

        let err = queue.before_transaction_completion(&session).await.unwrap_err();
        assert!(matches!(err, OrmError::Connection(_)));
        assert_eq!(*log.lock().unwrap(), vec!["failing"]);
        assert!(queue.has_actions());
    }

    #[tokio::test]
    async fn test_after_queue_tolerates_cache_release_failures() {
        let session = session(true);
        let log: Log = Arc::default();
        let queue = AfterTransactionCompletionProcessQueue::default();

        let mut release = Record::new("release", &log);
        release.outcome = Some(OrmError::CacheRelease("region busy".into()));
        queue.register(release).unwrap();
        queue.register(Record::new("next", &log)).unwrap();
        queue.add_space_to_invalidate("orders").unwrap();

        queue.after_transaction_completion(true, &session).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["release:true", "next:true"]);
        assert!(queue.spaces_to_invalidate().unwrap().is_empty());
        assert!(session.timestamps().last_invalidation("orders").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_after_queue_other_errors_are_fatal() {
        let session = session(false);
        let log: Log = Arc::default();
        let queue = AfterTransactionCompletionProcessQueue::default();

        let mut broken = Record::new("broken", &log);
        broken.outcome = Some(OrmError::IllegalState("bad".into()));
        queue.register(broken).unwrap();
        queue.register(Record::new("never", &log)).unwrap();

        let err = queue.after_transaction_completion(false, &session).await.unwrap_err();
        assert!(matches!(err, OrmError::AssertionFailure(_)));
        assert_eq!(*log.lock().unwrap(), vec!["broken:false"]);
    }
}
