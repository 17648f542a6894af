use futures::StreamExt;
use ocrbridge::{
    EngineHandle, OcrError, SessionConfig, SessionCorrelator, SessionToken, StageKind,
    StageResult,
};
use ocrbridge_testing::{EMPTY_STAGE, NotificationMode, StubGuest};
use std::sync::Arc;
use std::time::Duration;

fn deferred_engine(session: SessionConfig) -> (EngineHandle, Arc<StubGuest>) {
    let correlator = Arc::new(SessionCorrelator::new(session.max_unclaimed_notifications));
    let guest = Arc::new(
        StubGuest::new(Arc::clone(&correlator))
            .with_embedded_weights(true)
            .with_mode(NotificationMode::Deferred),
    );
    let engine = EngineHandle::new(guest.clone(), correlator, &session);
    (engine, guest)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn test_notifications_after_submit_reach_waiting_consumer() {
    let (engine, guest) = deferred_engine(SessionConfig::default());
    engine.init(None).await.unwrap();

    let stages = engine.submit(b"scan").await.unwrap();
    let token = stages.get_ref().token().clone();
    let consumer = tokio::spawn(async move {
        stages
            .map(|stage| stage.map(|s| s.kind()))
            .collect::<Vec<_>>()
            .await
    });

    let correlator = Arc::clone(guest.correlator());
    for stage in StageKind::ORDER {
        wait_until(|| correlator.is_waiting(&token, stage)).await;
        assert_eq!(guest.emit_next(), Some((token.clone(), stage)));
    }

    let kinds: Vec<StageKind> = consumer
        .await
        .unwrap()
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(kinds, StageKind::ORDER.to_vec());

    let stats = correlator.stats();
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.parked, 0);
    assert_eq!(guest.live_regions(), 0);
}

#[tokio::test]
async fn test_dropped_sequence_leaves_nothing_behind() {
    let (engine, guest) = deferred_engine(SessionConfig::default());
    engine.init(None).await.unwrap();

    let mut stages = engine.submit(b"scan").await.unwrap();
    guest.emit_next();
    let detection = stages.next().await.unwrap().unwrap();
    assert!(matches!(detection, StageResult::Detection(_)));

    // register the classification waiter, then walk away
    let poll = tokio::time::timeout(Duration::from_millis(20), stages.next()).await;
    assert!(poll.is_err());
    assert_eq!(engine.pending_notifications(), 1);

    drop(stages);
    assert_eq!(engine.pending_notifications(), 0);
    assert_eq!(guest.live_regions(), 0);

    // the submission lock went with it
    let next = tokio::time::timeout(Duration::from_secs(5), engine.submit(b"again"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.get_ref().token().as_str(), "s2");
}

#[tokio::test]
async fn test_submissions_are_serialized() {
    let (engine, guest) = deferred_engine(SessionConfig::default());
    engine.init(None).await.unwrap();

    let mut first = engine.submit(b"first").await.unwrap();

    let second_engine = engine.clone();
    let second = tokio::spawn(async move {
        let stages = second_engine.submit(b"second").await?;
        Ok::<SessionToken, OcrError>(stages.get_ref().token().clone())
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(guest.submit_count(), 1);
    assert!(!second.is_finished());

    assert_eq!(guest.flush(), 3);
    while let Some(stage) = first.next().await {
        stage.unwrap();
    }

    let token = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(token.as_str(), "s2");
    assert_eq!(guest.submit_count(), 2);
}

#[tokio::test]
async fn test_missing_stage_times_out() {
    let session = SessionConfig {
        stage_timeout_ms: 50,
        ..SessionConfig::default()
    };
    let (engine, guest) = deferred_engine(session);
    engine.init(None).await.unwrap();

    let mut stages = engine.submit(b"scan").await.unwrap();
    guest.emit_next();
    stages.next().await.unwrap().unwrap();

    match stages.next().await {
        Some(Err(OcrError::StageTimeout { stage, timeout_ms })) => {
            assert_eq!(stage, StageKind::Classification);
            assert_eq!(timeout_ms, 50);
        }
        other => panic!("expected a stage timeout, got {:?}", other),
    }
    assert!(stages.next().await.is_none());
    assert_eq!(engine.pending_notifications(), 0);
    assert_eq!(guest.live_regions(), 0);
}

#[tokio::test]
async fn test_stage_payloads_are_decoded() {
    let session = SessionConfig::default();
    let correlator = Arc::new(SessionCorrelator::new(session.max_unclaimed_notifications));
    let guest = Arc::new(
        StubGuest::new(Arc::clone(&correlator))
            .with_embedded_weights(true)
            .with_script(&[
                (
                    StageKind::Detection,
                    r#"{"items":[{"box":{"topLeft":{"x":10,"y":5},"bottomRight":{"x":90,"y":25}},"score":0.9}]}"#,
                ),
                (StageKind::Classification, r#"{"items":[{"label":1,"score":0.8}]}"#),
                (
                    StageKind::Recognition,
                    r#"{"items":[{"text":"invoice","score":0.7}]}"#,
                ),
            ]),
    );
    let engine = EngineHandle::new(guest.clone(), correlator, &session);
    engine.init(None).await.unwrap();

    let outcome = engine.recognize(b"scan").await.unwrap();
    let bbox = outcome.detection.items[0].bbox;
    assert_eq!((bbox.width(), bbox.height()), (80, 20));
    assert_eq!(outcome.classification.items[0].label, 1);
    assert_eq!(outcome.texts().collect::<Vec<_>>(), vec!["invoice"]);
}

#[tokio::test]
async fn test_duplicate_notification_is_dropped() {
    let (engine, guest) = deferred_engine(SessionConfig::default());
    engine.init(None).await.unwrap();

    let mut stages = engine.submit(b"scan").await.unwrap();
    let token = stages.get_ref().token().clone();
    guest.emit_next();
    guest.emit(&token, StageKind::Detection, EMPTY_STAGE);

    assert!(stages.next().await.unwrap().is_ok());
    assert_eq!(guest.correlator().stats().duplicates, 1);

    guest.flush();
    while let Some(stage) = stages.next().await {
        stage.unwrap();
    }
    assert_eq!(engine.pending_notifications(), 0);
}
