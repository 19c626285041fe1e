use flowtx::errors::TxResult;
use flowtx::transaction::{
    DistributedTransactionFactory, Resource, ResourceKey, TransactionAction, TransactionConfig, TransactionTemplate,
};
use flowtx_int_test::test_util::{cleanup, create_test_context, TrackedXaResource};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const WORKERS: usize = 16;
const STEPS_PER_WORKER: usize = 5_000;

fn main() -> TxResult<()> {
    println!("Starting stress test...");
    let ctx = create_test_context()?;
    let runtime = ctx.runtime();

    let config = TransactionConfig::new(TransactionAction::BeginOrJoin)
        .with_factory(Arc::new(DistributedTransactionFactory::new()));
    let template = Arc::new(TransactionTemplate::new(Some(config), runtime.clone())?);

    let start = Instant::now();
    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let template = template.clone();
            let runtime = runtime.clone();
            thread::spawn(move || -> TxResult<usize> {
                let mut committed = 0;
                for step in 0..STEPS_PER_WORKER {
                    let done = template.execute(|| {
                        if let Some(tx) = runtime.registry().current() {
                            let session = TrackedXaResource::new(&format!("session-{}-{}", worker, step));
                            tx.enlist(ResourceKey::named("broker"), Resource::xa(session))?;
                        }
                        Ok(true)
                    })?;
                    if done {
                        committed += 1;
                    }
                }
                Ok(committed)
            })
        })
        .collect();

    let mut total = 0;
    for handle in handles {
        match handle.join() {
            Ok(result) => total += result?,
            Err(_) => eprintln!("Worker panicked"),
        }
    }

    let elapsed = start.elapsed();
    println!(
        "Completed {} transactions in {:?} ({:.0} tx/s), {} begun by the manager",
        total,
        elapsed,
        total as f64 / elapsed.as_secs_f64(),
        ctx.manager().begins()
    );

    cleanup(ctx)
}
