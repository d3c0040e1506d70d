use crate::*;

use intermaster_services::{connect_all, HandshakeState, PeerRegistry, RegisteredMaster, RejectedBy};

#[tokio::test]
async fn handshake_over_tcp_registers_both_sides() -> Result<()> {
    let (a, b, session) = connected_pair().await?;

    assert_eq!(session.identity, b.identity());
    assert_eq!(session.url, b.url());
    assert_eq!(session.initiator, a.identity());

    let mirror = b.session_with(&a).await?;
    assert_eq!(mirror.url, a.url());
    assert_eq!(mirror.session_id, session.session_id);
    assert_eq!(mirror.initiator, a.identity());

    // Each side learned the other through the handshake.
    assert!(a.registry.find(&b.url(), &b.identity()).is_some());
    assert!(b.registry.find(&a.url(), &a.identity()).is_some());
    Ok(())
}

#[tokio::test]
async fn unapproved_initiator_is_refused_and_recorded() -> Result<()> {
    let a = Master::start("a", true).await?;
    let b = Master::start("b", false).await?;

    let err = a.dial(&b).await.unwrap_err();
    assert!(err.is_rejection(), "unexpected failure: {err}");
    assert!(matches!(err, HandshakeError::Rejected { by: RejectedBy::Remote }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.hx.connections.is_empty());
    assert!(b.hx.connections.is_empty());

    let record = b
        .registry
        .find(&a.url(), &a.identity())
        .context("b should have recorded a")?;
    assert!(!record.approved);

    // Once the operator approves it, the same peer gets in.
    b.registry.approve(&a.identity());
    a.dial(&b).await?;
    b.session_with(&a).await?;
    Ok(())
}

#[tokio::test]
async fn unapproved_responder_is_refused_by_the_initiator() -> Result<()> {
    let a = Master::start("a", false).await?;
    let b = Master::start("b", true).await?;

    let err = a.dial(&b).await.unwrap_err();
    assert!(matches!(err, HandshakeError::Rejected { by: RejectedBy::Local }));
    assert_eq!(err.state(), HandshakeState::Rejected);
    assert!(b.hx.connections.is_empty());
    Ok(())
}

#[tokio::test]
async fn impostor_fails_identity_check() -> Result<()> {
    let a = Master::start("a", true).await?;
    let b = Master::start("b", true).await?;
    let c = Master::start("c", true).await?;

    // Dial b's address expecting c's identity.
    let err = connect(&b.addr.to_string(), &a.hx, Some(c.identity()))
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeError::UnexpectedIdentity { .. }));
    assert_eq!(err.state(), HandshakeState::IdentityVerified);
    assert!(a.hx.connections.is_empty());
    Ok(())
}

#[tokio::test]
async fn closing_a_session_removes_it_on_both_sides() -> Result<()> {
    let (a, b, session) = connected_pair().await?;
    b.session_with(&a).await?;

    session.channel.close().await;
    a.wait_disconnected(&b).await?;
    b.wait_disconnected(&a).await?;
    Ok(())
}

#[tokio::test]
async fn redial_after_close_starts_a_new_session() -> Result<()> {
    let (a, b, first) = connected_pair().await?;
    first.channel.close().await;
    b.wait_disconnected(&a).await?;

    let second = b.dial(&a).await?;
    assert_ne!(second.session_id, first.session_id);
    assert_eq!(second.initiator, b.identity());
    a.session_with(&b).await?;
    Ok(())
}

#[tokio::test]
async fn connect_all_dials_registered_peers_once() -> Result<()> {
    let a = Master::start("a", false).await?;
    let b = Master::start("b", true).await?;
    let c = Master::start("c", true).await?;

    for peer in [&b, &c] {
        a.registry
            .add(RegisteredMaster::new(peer.url(), peer.identity(), true).with_addr(peer.addr.to_string()))?;
    }
    // Known but not dialable.
    let stranger = IdentityKeypair::generate().identity();
    a.registry
        .add(RegisteredMaster::new("http://stranger.test/", stranger, true))?;

    assert_eq!(connect_all(&a.hx).await, 2);
    assert!(a.hx.connections.contains(&b.identity()));
    assert!(a.hx.connections.contains(&c.identity()));

    // Already connected: nothing to do.
    assert_eq!(connect_all(&a.hx).await, 0);
    Ok(())
}

#[tokio::test]
async fn connect_all_survives_unreachable_peers() -> Result<()> {
    let a = Master::start("a", false).await?;
    let b = Master::start("b", true).await?;

    // Bind and drop to get a port nothing listens on.
    let dead = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let ghost = IdentityKeypair::generate().identity();
    a.registry
        .add(RegisteredMaster::new("http://ghost.test/", ghost, true).with_addr(dead.to_string()))?;
    a.registry
        .add(RegisteredMaster::new(b.url(), b.identity(), true).with_addr(b.addr.to_string()))?;

    assert_eq!(connect_all(&a.hx).await, 1);
    assert!(a.hx.connections.contains(&b.identity()));
    assert!(!a.hx.connections.contains(&ghost));
    Ok(())
}

#[tokio::test]
async fn crossed_dials_settle_on_one_session() -> Result<()> {
    let a = Master::start("a", true).await?;
    let b = Master::start("b", true).await?;

    let (ab, ba) = tokio::join!(a.dial(&b), b.dial(&a));
    ab?;
    ba?;

    // Both sides converge on the same session once the loser is closed.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let left = a.session_with(&b).await?;
        let right = b.session_with(&a).await?;
        if left.session_id == right.session_id && left.channel.is_open() {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            bail!("sessions never converged");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(a.hx.connections.len(), 1);
    assert_eq!(b.hx.connections.len(), 1);
    Ok(())
}

#[tokio::test]
async fn dial_to_a_silent_listener_times_out_within_the_bound() -> Result<()> {
    let a = Master::start("a", true).await?;
    let hx = HandshakeContext::new(
        a.hx.keypair.clone(),
        a.url(),
        a.registry.clone(),
        a.providers.clone(),
    )
    .with_timeout(Duration::from_millis(300));

    // Accepts and then never speaks.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = silent.local_addr()?;
    let holder = tokio::spawn(async move {
        let held = silent.accept().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(held);
    });

    let started = std::time::Instant::now();
    let err = connect(&addr.to_string(), &hx, None).await.unwrap_err();
    assert!(matches!(err, HandshakeError::Timeout { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    holder.abort();
    Ok(())
}
