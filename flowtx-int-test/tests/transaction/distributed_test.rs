use flowtx::errors::ErrorKind;
use flowtx::transaction::{Resource, ResourceKey, Transaction, TransactionStatus};
use flowtx_int_test::test_util::{
    cleanup, create_local_test_context, create_test_context, run_test, CommitOutcome, FactoryHolder,
    TrackedXaResource,
};
use std::sync::Arc;

struct ConnectionFactory;

#[test]
fn test_commit_closes_only_non_reusable_handles() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let manager = ctx.manager();
            let tx = Transaction::distributed(&runtime);
            tx.set_timeout(2_500);
            tx.begin()?;
            assert_eq!(manager.last_timeout(), Some(2));

            let session = TrackedXaResource::new("orders-session");
            let pooled = TrackedXaResource::reusable("pooled-connection");
            tx.enlist(ResourceKey::object(Arc::new(ConnectionFactory)), Resource::xa(session.clone()))?;
            tx.enlist(ResourceKey::named("pool"), Resource::xa(pooled.clone()))?;
            assert_eq!(session.timeout(), Some(2));

            let managed = manager.last_transaction().unwrap();
            assert_eq!(managed.enlisted(), 2);

            tx.commit()?;
            assert!(managed.committed());
            assert_eq!(tx.status()?, TransactionStatus::Committed);
            assert_eq!(session.closes(), 1);
            assert_eq!(pooled.closes(), 0);
            assert!(manager.associated().is_none());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_holders_of_one_factory_share_a_slot() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let tx = Transaction::distributed(&runtime);
            tx.begin()?;

            let factory = ResourceKey::object(Arc::new(ConnectionFactory));
            let first = ResourceKey::holder(FactoryHolder::wrap(factory.clone()));
            let second = ResourceKey::holder(FactoryHolder::wrap(factory.clone()));
            let session = TrackedXaResource::new("session");

            tx.enlist(first, Resource::xa(session.clone()))?;
            let err = tx
                .enlist(second.clone(), Resource::xa(TrackedXaResource::new("other")))
                .unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::AlreadyBoundResource);
            assert!(tx.has_resource(&factory));
            assert!(tx.has_resource(&second));

            tx.rollback()?;
            assert_eq!(session.closes(), 1);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_plain_resources_cannot_enlist() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let tx = Transaction::distributed(&runtime);
            tx.begin()?;

            let err = tx
                .enlist(ResourceKey::named("cache"), Resource::plain(Arc::new(0u8)))
                .unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::UnsupportedResource);
            assert!(!tx.has_resource(&ResourceKey::named("cache")));

            tx.rollback()?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_heuristic_rollback_closes_handles_once() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let manager = ctx.manager();
            manager.set_next_outcome(CommitOutcome::HeuristicRollback);

            let tx = Transaction::distributed(&runtime);
            tx.begin()?;
            let session = TrackedXaResource::new("session");
            tx.enlist(ResourceKey::named("orders"), Resource::xa(session.clone()))?;

            let err = tx.commit().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::HeuristicRollback);
            assert!(err.is_heuristic_rollback());
            assert!(tx.is_rolled_back());
            assert_eq!(tx.status()?, TransactionStatus::RolledBack);
            assert_eq!(session.closes(), 1);
            assert!(runtime.registry().current().is_none());

            tx.rollback()?;
            assert_eq!(session.closes(), 1);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_commit_failure_can_be_rolled_back() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let manager = ctx.manager();
            manager.set_next_outcome(CommitOutcome::Fail);

            let tx = Transaction::distributed(&runtime);
            tx.begin()?;
            let session = TrackedXaResource::new("session");
            tx.enlist(ResourceKey::named("broker"), Resource::xa(session.clone()))?;
            let managed = manager.last_transaction().unwrap();

            let err = tx.commit().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::CommitFailed);
            assert_eq!(tx.status()?, TransactionStatus::Active);
            assert_eq!(session.closes(), 0);
            assert!(!managed.rolled_back());

            tx.rollback()?;
            assert!(tx.is_rolled_back());
            assert!(managed.rolled_back());
            assert!(!managed.committed());
            assert_eq!(session.closes(), 1);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_participant_rollback_only_blocks_commit() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let manager = ctx.manager();
            let tx = Transaction::distributed(&runtime);
            tx.begin()?;

            let managed = manager.last_transaction().unwrap();
            managed.mark_rollback_only();
            assert!(tx.is_rollback_only());
            assert_eq!(tx.status()?, TransactionStatus::MarkedRollback);

            assert_eq!(tx.commit().unwrap_err().kind(), &ErrorKind::IllegalState);
            tx.rollback()?;
            assert!(managed.rolled_back());
            assert!(!managed.committed());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_external_transaction_is_left_to_its_owner() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let manager = ctx.manager();
            let external = manager.start_external();

            let tx = Transaction::external(&runtime);
            tx.begin()?;
            assert_eq!(manager.begins(), 0);
            tx.rollback()?;

            assert!(external.is_marked_rollback());
            assert!(!external.rolled_back());
            assert!(manager.associated().is_some());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_distributed_without_manager() {
    run_test(
        || create_local_test_context(),
        |ctx| {
            let tx = Transaction::distributed(&ctx.runtime());
            let err = tx.begin().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::NoTransactionManager);
            assert!(!tx.is_begun());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
