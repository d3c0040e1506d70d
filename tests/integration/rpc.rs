use crate::*;

use intermaster_services::rpc::{Argument, Value};
use intermaster_services::Authentication;

fn as_user(name: &str) -> SecurityContext {
    SecurityContext::new(Authentication::new(name, vec!["ROLE_USER".into()]))
}

/// `a` connected to `b`, with `b` offering a ledger.
async fn ledger_pair() -> Result<(Master, Master, Arc<ConnectedMaster>)> {
    let (a, b, session) = connected_pair().await?;
    b.providers.provide::<dyn Ledger>(Arc::new(LocalLedger::default()));
    Ok((a, b, session))
}

#[tokio::test]
async fn typed_calls_cross_the_session() -> Result<()> {
    let (_a, _b, session) = ledger_pair().await?;
    let ledger = session
        .service::<dyn Ledger>()
        .await?
        .context("b should offer a ledger")?;

    let cx = as_user("alice");
    assert_eq!(ledger.deposit(&cx, "alice".into(), 40).await?, 40);
    assert_eq!(ledger.deposit(&cx, "alice".into(), 2).await?, 42);
    assert_eq!(ledger.deposit(&cx, "bob".into(), 7).await?, 7);

    let balances = ledger.balances(&cx).await?;
    assert_eq!(balances.get("alice"), Some(&42));
    assert_eq!(balances.len(), 2);
    Ok(())
}

#[tokio::test]
async fn caller_identity_is_forwarded() -> Result<()> {
    let (_a, _b, session) = ledger_pair().await?;
    let ledger = session.service::<dyn Ledger>().await?.context("no ledger")?;

    assert_eq!(ledger.caller(&as_user("alice")).await?, "alice");
    assert_eq!(ledger.caller(&as_user("bob")).await?, "bob");
    assert_eq!(
        ledger.caller(&SecurityContext::anonymous()).await?,
        intermaster_services::auth::ANONYMOUS
    );
    Ok(())
}

#[tokio::test]
async fn application_errors_arrive_verbatim() -> Result<()> {
    let (_a, _b, session) = ledger_pair().await?;
    let ledger = session.service::<dyn Ledger>().await?.context("no ledger")?;

    let err = ledger
        .withdraw(&as_user("carol"), "carol".into(), 5)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RpcError::application("InsufficientFunds", "carol holds 0, asked for 5")
    );
    assert!(!err.is_no_such_method());

    // The session is still usable afterwards.
    assert_eq!(ledger.deposit(&as_user("carol"), "carol".into(), 5).await?, 5);
    Ok(())
}

#[tokio::test]
async fn unknown_contracts_resolve_to_none() -> Result<()> {
    let (_a, _b, session) = connected_pair().await?;
    assert!(session.service::<dyn Ledger>().await?.is_none());
    assert!(session.service_by_name("test.Nothing").await?.is_none());

    let err = session.service_by_name("not a contract").await.unwrap_err();
    assert!(matches!(err, RpcError::Unsupported { .. }));
    Ok(())
}

#[tokio::test]
async fn untyped_calls_use_overload_resolution() -> Result<()> {
    let (_a, _b, session) = ledger_pair().await?;
    let stub = session
        .service_by_name("test.Ledger")
        .await?
        .context("no ledger")?;
    let cx = as_user("dave");

    // Exact arity.
    let out = stub
        .invoke(
            "deposit",
            vec![Argument::of("account", "dave".to_string()), Argument::of("amount", 3i64)],
            &cx,
        )
        .await?;
    assert_eq!(out, Value::Int(3));

    // Missing trailing amount defaults to zero.
    let out = stub
        .invoke("deposit", vec![Argument::untyped(Value::Str("dave".into()))], &cx)
        .await?;
    assert_eq!(out, Value::Int(3));

    // Extra argument is dropped.
    let out = stub
        .invoke(
            "deposit",
            vec![
                Argument::of("account", "dave".to_string()),
                Argument::of("amount", 1i64),
                Argument::of("memo", "ignored".to_string()),
            ],
            &cx,
        )
        .await?;
    assert_eq!(out, Value::Int(4));

    let err = stub.invoke("transfer", vec![], &cx).await.unwrap_err();
    assert!(err.is_no_such_method());
    let err = stub
        .invoke("deposit", vec![Argument::of("account", 12i64)], &cx)
        .await
        .unwrap_err();
    assert!(err.is_no_such_method());
    Ok(())
}

#[tokio::test]
async fn both_ends_can_serve_and_call() -> Result<()> {
    let (a, b, a_to_b) = ledger_pair().await?;
    a.providers.provide::<dyn Ledger>(Arc::new(LocalLedger::default()));
    let b_to_a = b.session_with(&a).await?;

    let on_b = a_to_b.service::<dyn Ledger>().await?.context("b ledger")?;
    let on_a = b_to_a.service::<dyn Ledger>().await?.context("a ledger")?;

    on_b.deposit(&as_user("x"), "x".into(), 10).await?;
    on_a.deposit(&as_user("x"), "x".into(), 1).await?;

    assert_eq!(on_b.balances(&as_user("x")).await?.get("x"), Some(&10));
    assert_eq!(on_a.balances(&as_user("x")).await?.get("x"), Some(&1));
    Ok(())
}

#[tokio::test]
async fn pending_call_fails_when_the_session_closes() -> Result<()> {
    let (_a, _b, session) = ledger_pair().await?;
    let ledger = session.service::<dyn Ledger>().await?.context("no ledger")?;

    let stalled = tokio::spawn({
        let ledger = ledger.clone();
        async move { ledger.stall(&SecurityContext::system()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.channel.close().await;

    let outcome = tokio::time::timeout(WAIT, stalled).await??;
    assert_eq!(outcome.unwrap_err(), RpcError::ChannelClosed);

    // Later calls on the dead reference fail the same way.
    let err = ledger.deposit(&as_user("e"), "e".into(), 1).await.unwrap_err();
    assert_eq!(err, RpcError::ChannelClosed);
    Ok(())
}
