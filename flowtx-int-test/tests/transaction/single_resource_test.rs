use flowtx::errors::ErrorKind;
use flowtx::transaction::{
    KeyKind, Resource, ResourceConstraints, ResourceKey, ResourceKind, SingleResourceTransactionFactory,
    Transaction, TransactionFactory, TransactionStatus,
};
use flowtx_int_test::test_util::{cleanup, create_local_test_context, run_test, LocalResourceHooks};
use std::sync::Arc;

struct DataSource;

struct Connection {
    url: String,
}

#[test]
fn test_factory_begins_with_timeout() {
    run_test(
        || create_local_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let hooks = LocalResourceHooks::new();
            let factory = SingleResourceTransactionFactory::new(hooks.clone());

            let tx = factory.begin_transaction(&runtime, 1_500)?;
            assert!(tx.is_begun());
            assert_eq!(tx.timeout(), 1_500);
            assert_eq!(tx.status()?, TransactionStatus::Active);
            assert_eq!(hooks.begins(), 1);
            assert_eq!(runtime.registry().current(), Some(tx.clone()));

            tx.commit()?;
            assert_eq!(tx.status()?, TransactionStatus::Committed);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_bound_connection_is_reachable_by_key() {
    run_test(
        || create_local_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let hooks = LocalResourceHooks::new();
            let constraints = ResourceConstraints::new(KeyKind::Object, ResourceKind::Plain);
            let tx = Transaction::single_resource(&runtime, hooks.clone(), constraints);
            tx.begin()?;

            let data_source = ResourceKey::object(Arc::new(DataSource));
            let connection = Arc::new(Connection {
                url: "jdbc:h2:mem:orders".to_string(),
            });
            assert!(tx.supports(&data_source, &Resource::plain(connection.clone())));
            assert!(!tx.supports(&ResourceKey::named("orders"), &Resource::plain(connection.clone())));

            tx.bind_resource(data_source.clone(), Resource::plain(connection.clone()))?;
            assert_eq!(hooks.bound(), 1);

            let bound = tx.resource(&data_source).and_then(|r| r.downcast::<Connection>());
            assert_eq!(bound.map(|c| c.url.clone()), Some(connection.url.clone()));

            let err = tx
                .bind_resource(ResourceKey::object(Arc::new(DataSource)), Resource::plain(Arc::new(2u8)))
                .unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::AlreadyBoundResource);

            tx.commit()?;
            assert_eq!(hooks.commits(), 1);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_missing_key_or_resource_is_rejected() {
    run_test(
        || create_local_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let tx = Transaction::single_resource(&runtime, LocalResourceHooks::new(), ResourceConstraints::any());
            tx.begin()?;

            let err = tx.bind_resource(None, Resource::plain(Arc::new(1u8))).unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::NullKey);
            let err = tx.bind_resource(ResourceKey::named("orders"), None).unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::NullResource);

            tx.rollback()?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_double_begin_and_late_operations_are_illegal() {
    run_test(
        || create_local_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let hooks = LocalResourceHooks::new();
            let tx = Transaction::single_resource(&runtime, hooks.clone(), ResourceConstraints::any());

            let err = tx.commit().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::IllegalState);

            tx.begin()?;
            assert_eq!(tx.begin().unwrap_err().kind(), &ErrorKind::IllegalState);

            tx.commit()?;
            assert_eq!(tx.commit().unwrap_err().kind(), &ErrorKind::IllegalState);
            assert_eq!(tx.rollback().unwrap_err().kind(), &ErrorKind::IllegalState);
            assert_eq!(hooks.commits(), 0);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_failed_rollback_abandons_transaction() {
    run_test(
        || create_local_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let hooks = LocalResourceHooks::new();
            hooks.fail_rollback();
            let tx = Transaction::single_resource(&runtime, hooks.clone(), ResourceConstraints::any());
            tx.begin()?;
            tx.bind_resource(ResourceKey::named("orders"), Resource::plain(Arc::new(1u8)))?;

            let err = tx.rollback().unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::RollbackFailed);
            assert!(runtime.registry().current().is_none());
            assert!(!tx.is_rolled_back());

            assert_eq!(tx.commit().unwrap_err().kind(), &ErrorKind::IllegalState);
            assert_eq!(tx.rollback().unwrap_err().kind(), &ErrorKind::IllegalState);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_second_rollback_is_a_no_op() {
    run_test(
        || create_local_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let hooks = LocalResourceHooks::new();
            let tx = Transaction::single_resource(&runtime, hooks.clone(), ResourceConstraints::any());
            tx.begin()?;
            tx.bind_resource(ResourceKey::named("orders"), Resource::plain(Arc::new(1u8)))?;

            tx.rollback()?;
            tx.rollback()?;
            assert_eq!(hooks.rollbacks(), 1);
            assert_eq!(tx.status()?, TransactionStatus::RolledBack);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
