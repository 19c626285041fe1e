use flowtx::errors::{ErrorKind, TxError, TxResult};
use flowtx::runtime::TxRuntime;
use flowtx::transaction::{
    ManagedTransaction, Resource, ResourceFactoryHolder, ResourceKey, SingleResourceHooks,
    Transaction, TransactionEventInfo, TransactionEventListener, TransactionEvents,
    TransactionFactory, TransactionManager, TransactionStatus, XaResource,
};
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Runs a test with retry logic and error handling.
/// Tests run on the current thread because transactions are bound per worker thread.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> TxResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> TxResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> TxResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    const MAX_RETRIES: u32 = 3;
    let mut last_error: Option<String> = None;
    let mut last_backtrace: Option<String> = None;

    for attempt in 1..=MAX_RETRIES {
        let start_time = Instant::now();

        let result = std::panic::catch_unwind(|| {
            let backtrace = Backtrace::capture();
            match before() {
                Ok(ctx) => match test(ctx.clone()) {
                    Ok(_) => after(ctx)
                        .map_err(|e| (format!("After run failed: {:?}", e), backtrace.to_string())),
                    Err(e) => {
                        let _ = after(ctx);
                        Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                    }
                },
                Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
            }
        });

        let elapsed = start_time.elapsed();

        match result {
            Ok(Ok(_)) => return,
            Ok(Err((e, bt))) => {
                last_error = Some(e.clone());
                last_backtrace = Some(bt);
                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Failed (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Error: {}", e);
                    eprintln!("Retrying in {}ms...\n", 100 * attempt);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
            Err(panic_err) => {
                let err_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };

                last_error = Some(format!("Panic: {}", err_msg));
                last_backtrace = Some(Backtrace::capture().to_string());

                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Panicked (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Panic: {}", err_msg);
                    eprintln!("Retrying in {}ms...\n", 100 * attempt);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
        }
    }

    eprintln!("\n==================== TEST FAILED ====================");
    eprintln!("Failed after {} attempts", MAX_RETRIES);
    eprintln!("Last error: {}", last_error.as_deref().unwrap_or("Unknown"));
    if let Some(bt) = &last_backtrace {
        if !bt.is_empty() && !bt.contains("disabled") {
            eprintln!("\nBacktrace:\n{}", bt);
        }
    }
    eprintln!("=====================================================\n");

    panic!(
        "Test failed after {} attempts. Last error: {}",
        MAX_RETRIES,
        last_error.unwrap_or_default()
    );
}

#[derive(Clone)]
pub struct TestContext {
    runtime: TxRuntime,
    manager: Arc<ScriptedManager>,
}

impl TestContext {
    pub fn new(runtime: TxRuntime, manager: Arc<ScriptedManager>) -> Self {
        Self { runtime, manager }
    }

    pub fn runtime(&self) -> TxRuntime {
        self.runtime.clone()
    }

    pub fn manager(&self) -> Arc<ScriptedManager> {
        self.manager.clone()
    }
}

pub fn random_application_name() -> String {
    format!("int-test-{}", uuid::Uuid::new_v4())
}

/// A runtime wired to a fresh [ScriptedManager].
pub fn create_test_context() -> TxResult<TestContext> {
    let manager = ScriptedManager::new();
    let runtime = TxRuntime::builder()
        .application_name(&random_application_name())
        .default_transaction_timeout(5_000)
        .transaction_manager(manager.clone())
        .build()?;
    Ok(TestContext::new(runtime, manager))
}

/// A runtime without a transaction manager.
pub fn create_local_test_context() -> TxResult<TestContext> {
    let runtime = TxRuntime::builder()
        .application_name(&random_application_name())
        .build()?;
    Ok(TestContext::new(runtime, ScriptedManager::new()))
}

/// Fails if the test left a transaction bound, then closes the runtime.
pub fn cleanup(ctx: TestContext) -> TxResult<()> {
    let registry = ctx.runtime.registry();
    let leaked = registry.transaction_count();
    registry.clear();
    ctx.runtime.close()?;

    if leaked > 0 {
        return Err(TxError::new(
            &format!("{} transactions were left bound", leaked),
            ErrorKind::InternalError,
        ));
    }
    Ok(())
}

/// Resource side of a local transaction that counts every call.
#[derive(Default)]
pub struct LocalResourceHooks {
    delay: Option<Duration>,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    bound: AtomicUsize,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

impl LocalResourceHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalResourceHooks::default())
    }

    /// Commit and rollback sleep for `delay` before completing.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(LocalResourceHooks {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn fail_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self) {
        self.fail_rollback.store(true, Ordering::SeqCst);
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn bound(&self) -> usize {
        self.bound.load(Ordering::SeqCst)
    }

    fn complete(&self, counter: &AtomicUsize, fail: &AtomicBool, operation: &str) -> TxResult<()> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if fail.load(Ordering::SeqCst) {
            return Err(TxError::new(&format!("{} refused by resource", operation), ErrorKind::ResourceError));
        }
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl SingleResourceHooks for LocalResourceHooks {
    fn begin(&self, _transaction_id: &str) -> TxResult<()> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn resource_bound(&self, _key: &ResourceKey, _resource: &Resource) -> TxResult<()> {
        self.bound.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self, _key: &ResourceKey, _resource: &Resource) -> TxResult<()> {
        self.complete(&self.commits, &self.fail_commit, "commit")
    }

    fn rollback(&self, _key: &ResourceKey, _resource: &Resource) -> TxResult<()> {
        self.complete(&self.rollbacks, &self.fail_rollback, "rollback")
    }
}

/// How a [ScriptedTransaction] answers `commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Commit,
    HeuristicRollback,
    Fail,
}

type Associations = Mutex<HashMap<ThreadId, Arc<ScriptedTransaction>>>;

/// A manager transaction that follows a scripted commit outcome.
pub struct ScriptedTransaction {
    associations: Weak<Associations>,
    outcome: Mutex<CommitOutcome>,
    committed: AtomicBool,
    rolled_back: AtomicBool,
    rollback_only: AtomicBool,
    enlisted: AtomicUsize,
}

impl ScriptedTransaction {
    fn new(associations: &Arc<Associations>, outcome: CommitOutcome) -> Arc<Self> {
        Arc::new(ScriptedTransaction {
            associations: Arc::downgrade(associations),
            outcome: Mutex::new(outcome),
            committed: AtomicBool::new(false),
            rolled_back: AtomicBool::new(false),
            rollback_only: AtomicBool::new(false),
            enlisted: AtomicUsize::new(0),
        })
    }

    pub fn set_commit_outcome(&self, outcome: CommitOutcome) {
        *self.outcome.lock() = outcome;
    }

    /// Marks rollback-only as another participant would.
    pub fn mark_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    pub fn committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> bool {
        self.rolled_back.load(Ordering::SeqCst)
    }

    pub fn is_marked_rollback(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    pub fn enlisted(&self) -> usize {
        self.enlisted.load(Ordering::SeqCst)
    }

    // completion ends the association with every worker
    fn disassociate(&self) {
        if let Some(associations) = self.associations.upgrade() {
            associations
                .lock()
                .retain(|_, transaction| !std::ptr::eq(Arc::as_ptr(transaction), self));
        }
    }
}

impl ManagedTransaction for ScriptedTransaction {
    fn commit(&self) -> TxResult<()> {
        self.disassociate();
        match *self.outcome.lock() {
            CommitOutcome::Commit => {
                self.committed.store(true, Ordering::SeqCst);
                Ok(())
            }
            CommitOutcome::HeuristicRollback => {
                self.rolled_back.store(true, Ordering::SeqCst);
                Err(TxError::new("participant voted to roll back", ErrorKind::HeuristicRollback))
            }
            CommitOutcome::Fail => Err(TxError::new("coordinator unreachable", ErrorKind::ResourceError)),
        }
    }

    fn rollback(&self) -> TxResult<()> {
        self.disassociate();
        self.rolled_back.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_rollback_only(&self) -> TxResult<()> {
        self.rollback_only.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> TxResult<TransactionStatus> {
        Ok(if self.rolled_back() {
            TransactionStatus::RolledBack
        } else if self.committed() {
            TransactionStatus::Committed
        } else if self.is_marked_rollback() {
            TransactionStatus::MarkedRollback
        } else {
            TransactionStatus::Active
        })
    }

    fn enlist_resource(&self, _resource: &Arc<dyn XaResource>) -> TxResult<bool> {
        self.enlisted.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// In-memory transaction manager associating transactions per thread.
pub struct ScriptedManager {
    associations: Arc<Associations>,
    started: Mutex<Vec<Arc<ScriptedTransaction>>>,
    next_outcome: Mutex<CommitOutcome>,
    last_timeout: Mutex<Option<u32>>,
    suspends: AtomicUsize,
    resumes: AtomicUsize,
}

impl ScriptedManager {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedManager {
            associations: Arc::new(Mutex::new(HashMap::new())),
            started: Mutex::new(Vec::new()),
            next_outcome: Mutex::new(CommitOutcome::Commit),
            last_timeout: Mutex::new(None),
            suspends: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
        })
    }

    /// Outcome of every transaction begun from now on.
    pub fn set_next_outcome(&self, outcome: CommitOutcome) {
        *self.next_outcome.lock() = outcome;
    }

    /// Associates a transaction with the calling thread as if code outside
    /// the runtime had begun it.
    pub fn start_external(&self) -> Arc<ScriptedTransaction> {
        let transaction = ScriptedTransaction::new(&self.associations, *self.next_outcome.lock());
        self.associations.lock().insert(thread::current().id(), transaction.clone());
        transaction
    }

    /// The transaction associated with the calling thread.
    pub fn associated(&self) -> Option<Arc<ScriptedTransaction>> {
        self.associations.lock().get(&thread::current().id()).cloned()
    }

    pub fn last_transaction(&self) -> Option<Arc<ScriptedTransaction>> {
        self.started.lock().last().cloned()
    }

    pub fn begins(&self) -> usize {
        self.started.lock().len()
    }

    pub fn suspends(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn last_timeout(&self) -> Option<u32> {
        *self.last_timeout.lock()
    }
}

impl TransactionManager for ScriptedManager {
    fn set_transaction_timeout(&self, seconds: u32) -> TxResult<()> {
        *self.last_timeout.lock() = Some(seconds);
        Ok(())
    }

    fn begin(&self) -> TxResult<Arc<dyn ManagedTransaction>> {
        let mut associations = self.associations.lock();
        let worker = thread::current().id();
        if associations.contains_key(&worker) {
            return Err(TxError::new(
                "Nested transactions are not supported",
                ErrorKind::ResourceError,
            ));
        }

        let transaction = ScriptedTransaction::new(&self.associations, *self.next_outcome.lock());
        associations.insert(worker, transaction.clone());
        self.started.lock().push(transaction.clone());
        let handle: Arc<dyn ManagedTransaction> = transaction;
        Ok(handle)
    }

    fn current(&self) -> TxResult<Option<Arc<dyn ManagedTransaction>>> {
        Ok(self.associated().map(|transaction| {
            let handle: Arc<dyn ManagedTransaction> = transaction;
            handle
        }))
    }

    fn suspend(&self) -> TxResult<Option<Arc<dyn ManagedTransaction>>> {
        match self.associations.lock().remove(&thread::current().id()) {
            Some(transaction) => {
                self.suspends.fetch_add(1, Ordering::SeqCst);
                let handle: Arc<dyn ManagedTransaction> = transaction;
                Ok(Some(handle))
            }
            None => Ok(None),
        }
    }

    fn resume(&self, transaction: Arc<dyn ManagedTransaction>) -> TxResult<()> {
        let target = Arc::as_ptr(&transaction) as *const ();
        let known = self
            .started
            .lock()
            .iter()
            .find(|candidate| Arc::as_ptr(*candidate) as *const () == target)
            .cloned()
            .ok_or_else(|| TxError::new("Unknown transaction", ErrorKind::ResourceError))?;

        let mut associations = self.associations.lock();
        let worker = thread::current().id();
        if associations.contains_key(&worker) {
            return Err(TxError::new(
                "Thread is already associated with a transaction",
                ErrorKind::ResourceError,
            ));
        }
        associations.insert(worker, known);
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An XA handle that records its timeout and how often it was closed.
pub struct TrackedXaResource {
    name: String,
    reusable: bool,
    timeout: Mutex<Option<u32>>,
    closes: AtomicUsize,
}

impl TrackedXaResource {
    pub fn new(name: &str) -> Arc<Self> {
        Self::create(name, false)
    }

    pub fn reusable(name: &str) -> Arc<Self> {
        Self::create(name, true)
    }

    fn create(name: &str, reusable: bool) -> Arc<Self> {
        Arc::new(TrackedXaResource {
            name: name.to_string(),
            reusable,
            timeout: Mutex::new(None),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn timeout(&self) -> Option<u32> {
        *self.timeout.lock()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl XaResource for TrackedXaResource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_transaction_timeout(&self, seconds: u32) -> TxResult<bool> {
        *self.timeout.lock() = Some(seconds);
        Ok(true)
    }

    fn is_reusable(&self) -> bool {
        self.reusable
    }

    fn close(&self) -> TxResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A connection-pool style wrapper around a resource factory.
pub struct FactoryHolder(ResourceKey);

impl FactoryHolder {
    pub fn wrap(factory: ResourceKey) -> Arc<Self> {
        Arc::new(FactoryHolder(factory))
    }
}

impl ResourceFactoryHolder for FactoryHolder {
    fn held_factory(&self) -> ResourceKey {
        self.0.clone()
    }
}

/// Counts the transactions a factory creates.
pub struct CountingFactory {
    factory: Arc<dyn TransactionFactory>,
    created: AtomicUsize,
}

impl CountingFactory {
    pub fn wrap(factory: Arc<dyn TransactionFactory>) -> Arc<Self> {
        Arc::new(CountingFactory {
            factory,
            created: AtomicUsize::new(0),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransactionFactory for CountingFactory {
    fn begin_transaction(&self, runtime: &TxRuntime, timeout_ms: u64) -> TxResult<Transaction> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.factory.begin_transaction(runtime, timeout_ms)
    }

    fn join_external_transaction(&self, runtime: &TxRuntime) -> TxResult<Option<Transaction>> {
        self.factory.join_external_transaction(runtime)
    }
}

/// Collects the lifecycle notifications of one runtime.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<TransactionEventInfo>>>,
}

impl EventRecorder {
    pub fn attach(runtime: &TxRuntime) -> TxResult<Self> {
        let recorder = EventRecorder::default();
        let sink = recorder.events.clone();
        runtime.subscribe(TransactionEventListener::new(move |event: TransactionEventInfo| {
            sink.lock().push(event);
            Ok(())
        }))?;
        Ok(recorder)
    }

    pub fn events(&self) -> Vec<TransactionEventInfo> {
        self.events.lock().clone()
    }

    pub fn count(&self, event_type: TransactionEvents) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type() == event_type)
            .count()
    }

    pub fn count_for(&self, transaction_id: &str, event_type: TransactionEvents) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.transaction_id() == transaction_id && event.event_type() == event_type)
            .count()
    }

    /// Blocks until `expected` notifications of `event_type` arrived.
    pub fn wait_for(&self, event_type: TransactionEvents, expected: usize) {
        awaitility::at_most(Duration::from_millis(1000)).until(|| self.count(event_type) >= expected);
    }
}
