use flowtx::errors::ErrorKind;
use flowtx::transaction::{
    DistributedTransactionFactory, Resource, ResourceConstraints, ResourceKey, Transaction, TransactionAction,
    TransactionConfig, TransactionTemplate,
};
use flowtx_int_test::test_util::{cleanup, create_test_context, run_test, LocalResourceHooks, TrackedXaResource};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_workers_bind_independently() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let main_tx = Transaction::single_resource(&runtime, LocalResourceHooks::new(), ResourceConstraints::any());
            main_tx.begin()?;

            let barrier = Arc::new(Barrier::new(5));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let runtime = runtime.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        let visible_before = runtime.registry().current().is_some();
                        let tx = Transaction::single_resource(&runtime, LocalResourceHooks::new(), ResourceConstraints::any());
                        let began = tx.begin().is_ok();
                        let own = runtime.registry().current() == Some(tx.clone());
                        barrier.wait();
                        barrier.wait();
                        let committed = tx.commit().is_ok();
                        (visible_before, began, own, committed)
                    })
                })
                .collect();

            barrier.wait();
            assert_eq!(runtime.registry().transaction_count(), 5);
            assert_eq!(runtime.registry().current(), Some(main_tx.clone()));
            barrier.wait();

            for handle in handles {
                let (visible_before, began, own, committed) = handle.join().unwrap();
                assert!(!visible_before);
                assert!(began && own && committed);
            }
            assert_eq!(runtime.registry().transaction_count(), 1);

            main_tx.commit()?;
            assert_eq!(runtime.registry().transaction_count(), 0);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_concurrent_resolution_has_one_winner() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            for _ in 0..10 {
                let hooks = LocalResourceHooks::with_delay(Duration::from_millis(20));
                let tx = Transaction::single_resource(&runtime, hooks.clone(), ResourceConstraints::any());
                tx.begin()?;
                tx.bind_resource(ResourceKey::named("orders"), Resource::plain(Arc::new(1u8)))?;

                let barrier = Arc::new(Barrier::new(2));
                let committer = {
                    let tx = tx.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        tx.commit()
                    })
                };
                let rollbacker = {
                    let tx = tx.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        tx.rollback()
                    })
                };

                let commit = committer.join().unwrap();
                let rollback = rollbacker.join().unwrap();
                assert_eq!(hooks.commits() + hooks.rollbacks(), 1);

                // the loser sees IllegalState
                match (&commit, &rollback) {
                    (Ok(()), Err(e)) => assert_eq!(e.kind(), &ErrorKind::IllegalState),
                    (Err(e), Ok(())) => assert_eq!(e.kind(), &ErrorKind::IllegalState),
                    other => panic!("expected exactly one winner, got {:?}", other),
                }
                assert_ne!(tx.is_committed(), tx.is_rolled_back());

                // unbind only touches the calling worker, so the slot here is still taken
                runtime.registry().clear();
            }
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_parallel_templates_each_get_their_own_transaction() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let manager = ctx.manager();
            let config = TransactionConfig::new(TransactionAction::AlwaysBegin)
                .with_factory(Arc::new(DistributedTransactionFactory::new()));
            let template = Arc::new(TransactionTemplate::new(Some(config), runtime.clone())?);

            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let template = template.clone();
                    let runtime = runtime.clone();
                    thread::spawn(move || {
                        template.execute(|| {
                            let tx = runtime.registry().current().ok_or_else(|| {
                                flowtx::errors::TxError::new("not bound", ErrorKind::IllegalState)
                            })?;
                            let session = TrackedXaResource::new(&format!("session-{}", i));
                            tx.enlist(ResourceKey::named("broker"), Resource::xa(session.clone()))?;
                            Ok((tx.id().to_string(), session))
                        })
                    })
                })
                .collect();

            let mut ids = Vec::new();
            for handle in handles {
                let (id, session) = handle.join().unwrap()?;
                assert_eq!(session.closes(), 1);
                ids.push(id);
            }
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), 8);
            assert_eq!(manager.begins(), 8);
            assert_eq!(runtime.registry().transaction_count(), 0);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
