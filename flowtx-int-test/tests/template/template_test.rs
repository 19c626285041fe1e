use flowtx::errors::{ErrorKind, TxError};
use flowtx::runtime::TxRuntime;
use flowtx::transaction::{
    DistributedTransactionFactory, Resource, ResourceConstraints, ResourceKey, SingleResourceTransactionFactory,
    Transaction, TransactionAction, TransactionConfig, TransactionTemplate,
};
use flowtx_int_test::test_util::{
    cleanup, create_test_context, run_test, CountingFactory, LocalResourceHooks, TrackedXaResource,
};
use std::sync::Arc;

fn local_factory(hooks: &Arc<LocalResourceHooks>) -> Arc<CountingFactory> {
    CountingFactory::wrap(Arc::new(SingleResourceTransactionFactory::new(hooks.clone())))
}

fn distributed_factory() -> Arc<CountingFactory> {
    CountingFactory::wrap(Arc::new(DistributedTransactionFactory::new()))
}

fn template(runtime: &TxRuntime, action: TransactionAction, factory: &Arc<CountingFactory>) -> TransactionTemplate {
    let config = TransactionConfig::new(action).with_factory(factory.clone());
    match TransactionTemplate::new(Some(config), runtime.clone()) {
        Ok(template) => template,
        Err(e) => panic!("invalid template: {}", e),
    }
}

#[test]
fn test_begin_or_join_commits_what_it_began() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let hooks = LocalResourceHooks::new();
            let factory = local_factory(&hooks);
            let template = template(&runtime, TransactionAction::BeginOrJoin, &factory);

            let registry = runtime.registry().clone();
            let id = template.execute(|| {
                let tx = registry.current().ok_or_else(|| TxError::new("not bound", ErrorKind::IllegalState))?;
                tx.bind_resource(ResourceKey::named("orders"), Resource::plain(Arc::new(1u8)))?;
                Ok(tx.id().to_string())
            })?;

            assert!(!id.is_empty());
            assert_eq!(factory.created(), 1);
            assert_eq!(hooks.commits(), 1);
            assert!(runtime.registry().current().is_none());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_begin_or_join_reuses_bound_transaction() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let hooks = LocalResourceHooks::new();
            let outer = Transaction::single_resource(&runtime, hooks.clone(), ResourceConstraints::any());
            outer.begin()?;

            let factory = local_factory(&hooks);
            let template = template(&runtime, TransactionAction::BeginOrJoin, &factory);
            let registry = runtime.registry().clone();
            let joined = template.execute(|| Ok(registry.current()))?;

            assert_eq!(joined, Some(outer.clone()));
            assert_eq!(factory.created(), 0);
            // the joined transaction stays open for its owner
            assert_eq!(runtime.registry().current(), Some(outer.clone()));

            outer.commit()?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_failed_callback_rolls_back() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let hooks = LocalResourceHooks::new();
            let factory = local_factory(&hooks);
            let template = template(&runtime, TransactionAction::AlwaysBegin, &factory);

            let registry = runtime.registry().clone();
            let result: Result<(), TxError> = template.execute(|| {
                if let Some(tx) = registry.current() {
                    tx.bind_resource(ResourceKey::named("orders"), Resource::plain(Arc::new(1u8)))?;
                }
                Err(TxError::new("step failed", ErrorKind::Extension("OrderRejected".to_string())))
            });

            let err = result.unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::Extension("OrderRejected".to_string()));
            assert_eq!(hooks.rollbacks(), 1);
            assert_eq!(hooks.commits(), 0);
            assert!(runtime.registry().current().is_none());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_failed_commit_rolls_back_began_transaction() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let hooks = LocalResourceHooks::new();
            hooks.fail_commit();
            let factory = local_factory(&hooks);
            let template = template(&runtime, TransactionAction::AlwaysBegin, &factory);

            let registry = runtime.registry().clone();
            let result = template.execute(|| {
                let tx = registry.current().ok_or_else(|| TxError::new("not bound", ErrorKind::IllegalState))?;
                tx.bind_resource(ResourceKey::named("orders"), Resource::plain(Arc::new(1u8)))?;
                Ok(tx)
            });

            let err = result.err().unwrap();
            assert_eq!(err.kind(), &ErrorKind::CommitFailed);
            assert_eq!(hooks.commits(), 0);
            assert_eq!(hooks.rollbacks(), 1);
            assert!(runtime.registry().current().is_none());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_never_rejects_bound_transaction() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let tx = Transaction::single_resource(&runtime, LocalResourceHooks::new(), ResourceConstraints::any());
            tx.begin()?;

            let config = TransactionConfig::new(TransactionAction::Never);
            let template = TransactionTemplate::new(Some(config), runtime.clone())?;
            let mut ran = false;
            let err = template
                .execute(|| {
                    ran = true;
                    Ok(())
                })
                .unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::ConfigurationError);
            assert!(!ran);

            tx.rollback()?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_always_join_requires_bound_transaction() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let factory = local_factory(&LocalResourceHooks::new());
            let template = template(&runtime, TransactionAction::AlwaysJoin, &factory);

            let err = template.execute(|| Ok(())).unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::IllegalState);
            assert_eq!(factory.created(), 0);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_missing_factory_is_a_configuration_error() {
    run_test(
        || create_test_context(),
        |ctx| {
            let config = TransactionConfig::new(TransactionAction::AlwaysBegin);
            let err = TransactionTemplate::new(Some(config), ctx.runtime()).err().unwrap();
            assert_eq!(err.kind(), &ErrorKind::ConfigurationError);

            let plain = TransactionTemplate::new(None, ctx.runtime())?;
            assert_eq!(plain.execute(|| Ok(41 + 1))?, 42);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_always_begin_suspends_distributed_transaction() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let manager = ctx.manager();
            let outer = Transaction::distributed(&runtime);
            outer.begin()?;
            let outer_managed = manager.last_transaction().unwrap();

            let factory = distributed_factory();
            let template = template(&runtime, TransactionAction::AlwaysBegin, &factory);
            let registry = runtime.registry().clone();
            let inner = template.execute(|| {
                let inner = registry.current().ok_or_else(|| TxError::new("not bound", ErrorKind::IllegalState))?;
                inner.enlist(ResourceKey::named("broker"), Resource::xa(TrackedXaResource::new("session")))?;
                Ok(inner)
            })?;

            assert_ne!(inner, outer);
            assert!(inner.is_committed());
            assert_eq!(manager.suspends(), 1);
            assert_eq!(manager.resumes(), 1);
            assert_eq!(runtime.registry().current(), Some(outer.clone()));
            assert!(!outer_managed.committed());

            outer.commit()?;
            assert!(outer_managed.committed());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_always_begin_resolves_local_transaction_first() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let hooks = LocalResourceHooks::new();
            let outer = Transaction::single_resource(&runtime, hooks.clone(), ResourceConstraints::any());
            outer.begin()?;
            outer.bind_resource(ResourceKey::named("orders"), Resource::plain(Arc::new(1u8)))?;

            let factory = local_factory(&hooks);
            let template = template(&runtime, TransactionAction::AlwaysBegin, &factory);
            template.execute(|| Ok(()))?;

            assert!(outer.is_committed());
            assert_eq!(factory.created(), 1);
            assert!(runtime.registry().current().is_none());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_not_supported_isolates_local_transaction() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let outer = Transaction::single_resource(&runtime, LocalResourceHooks::new(), ResourceConstraints::any());
            outer.begin()?;

            let template = TransactionTemplate::new(
                Some(TransactionConfig::new(TransactionAction::NotSupported)),
                runtime.clone(),
            )?;
            let registry = runtime.registry().clone();
            let seen = template.execute(|| Ok(registry.current()))?;

            assert!(seen.is_none());
            assert_eq!(runtime.registry().current(), Some(outer.clone()));
            assert_eq!(runtime.registry().isolated_count(), 0);

            outer.commit()?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_not_supported_suspends_distributed_transaction() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let manager = ctx.manager();
            let outer = Transaction::distributed(&runtime);
            outer.begin()?;

            let template = TransactionTemplate::new(
                Some(TransactionConfig::new(TransactionAction::NotSupported)),
                runtime.clone(),
            )?;
            let probe = manager.clone();
            let associated = template.execute(|| Ok(probe.associated().is_some()))?;

            assert!(!associated);
            assert_eq!(manager.suspends(), 1);
            assert_eq!(manager.resumes(), 1);
            assert_eq!(runtime.registry().current(), Some(outer.clone()));

            outer.commit()?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_joins_external_transaction_without_resolving_it() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let manager = ctx.manager();
            let external = manager.start_external();

            let factory = distributed_factory();
            let config = TransactionConfig::new(TransactionAction::JoinIfPossible)
                .with_factory(factory.clone())
                .with_interact_with_external(true);
            let template = TransactionTemplate::new(Some(config), runtime.clone())?;

            let registry = runtime.registry().clone();
            let joined = template.execute(|| Ok(registry.current()))?;

            let joined = joined.ok_or_else(|| TxError::new("nothing joined", ErrorKind::IllegalState))?;
            assert!(joined.is_xa());
            assert_eq!(factory.created(), 0);
            assert_eq!(manager.begins(), 0);
            assert!(runtime.registry().current().is_none());
            assert!(!external.committed());
            assert!(!external.rolled_back());
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_timeout_defaults_from_runtime() {
    run_test(
        || create_test_context(),
        |ctx| {
            let runtime = ctx.runtime();
            let factory = distributed_factory();
            let config = TransactionConfig::new(TransactionAction::AlwaysBegin).with_factory(factory.clone());
            assert_eq!(config.timeout(&runtime), runtime.default_transaction_timeout());

            let template = TransactionTemplate::new(Some(config.with_timeout(12_000)), runtime.clone())?;
            template.execute(|| Ok(()))?;
            assert_eq!(ctx.manager().last_timeout(), Some(12));
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
