mod support;

use alerts::{RunOutcome, SchedulerConfig};
use models::{AlertState, Cadence, Id, Notice};
use pretty_assertions::assert_eq;
use support::{create, doc, engine, fetch, owner, run_leased, ts, Response};

#[tokio::test]
async fn repeated_index_failures_back_off_and_escalate() {
    let engine = engine(SchedulerConfig::default()).await;
    create(&engine, 1, &owner(1), Cadence::RealTime, "2024-03-01T00:00:00Z").await;

    engine.index().push(Response::Unavailable);
    let outcome = run_leased(&engine, fetch(&engine, 1).await, ts("2024-03-01T01:00:00Z"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::IndexUnavailable {
            failures: 1,
            escalated: false
        }
    );
    let alert = fetch(&engine, 1).await;
    let retry_at = alert.retry_at.unwrap();
    assert!(retry_at > ts("2024-03-01T01:00:50Z") && retry_at < ts("2024-03-01T01:01:10Z"));

    engine.index().push(Response::Unavailable);
    let outcome = run_leased(&engine, fetch(&engine, 1).await, ts("2024-03-01T01:05:00Z"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::IndexUnavailable {
            failures: 2,
            escalated: false
        }
    );

    // While backing off, the alert isn't due and the index isn't queried.
    let outcome = run_leased(&engine, fetch(&engine, 1).await, ts("2024-03-01T01:06:00Z"))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::NotDue);
    assert_eq!(engine.index().calls().len(), 2);

    engine.index().push(Response::Unavailable);
    let failed_at = ts("2024-03-01T01:30:00Z");
    let outcome = run_leased(&engine, fetch(&engine, 1).await, failed_at).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::IndexUnavailable {
            failures: 3,
            escalated: true
        }
    );

    // Failures never change the alert's state or watermark.
    let alert = fetch(&engine, 1).await;
    assert_eq!(alert.state, AlertState::Active);
    assert_eq!(alert.index_failures, 3);
    assert_eq!(alert.watermark, ts("2024-03-01T00:00:00Z"));
    assert_eq!(alert.last_run_at, None);
    assert!(alert.retry_at.unwrap() > failed_at);

    // Nor is it leased while backing off.
    let soon = ts("2024-03-01T01:31:00Z");
    let leased =
        alerts_sql::lease_due_alerts("w", &engine.checkpoints(), soon, soon, 10, engine.pool())
            .await
            .unwrap();
    assert!(leased.is_empty());

    // A successful run resets the failures.
    engine.index().push(Response::Hits(vec![doc("D1", "2024-03-01T00:30:00Z")]));
    let outcome = run_leased(&engine, fetch(&engine, 1).await, ts("2024-03-01T02:00:00Z"))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Notified { documents: 1 });

    let alert = fetch(&engine, 1).await;
    assert_eq!(alert.index_failures, 0);
    assert_eq!(alert.retry_at, None);
    assert_eq!(alert.watermark, ts("2024-03-01T00:30:00Z"));
}

#[tokio::test]
async fn rejected_queries_stop_the_alert_until_edited() {
    let engine = engine(SchedulerConfig::default()).await;
    let alice = owner(1);
    create(&engine, 1, &alice, Cadence::RealTime, "2024-03-01T00:00:00Z").await;

    engine
        .index()
        .push(Response::Syntax("unbalanced parentheses at position 7"));
    let outcome = run_leased(&engine, fetch(&engine, 1).await, ts("2024-03-01T00:01:00Z"))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::QueryError);

    let notice = Notice::QueryError {
        message: "unbalanced parentheses at position 7".to_string(),
    };
    assert_eq!(engine.notifier().notices(), vec![(Id::new(1), notice)]);

    let alert = fetch(&engine, 1).await;
    assert_eq!(
        alert.query_error.as_deref(),
        Some("unbalanced parentheses at position 7")
    );
    assert!(alert.notices.is_empty());
    // A query error is not an index failure.
    assert_eq!(alert.index_failures, 0);

    // Later runs neither query the index nor notify the owner again.
    for minute in 2..5 {
        let now = ts(&format!("2024-03-01T00:0{minute}:00Z"));
        let outcome = run_leased(&engine, fetch(&engine, 1).await, now).await.unwrap();
        assert_eq!(outcome, RunOutcome::QueryError);
    }
    assert_eq!(engine.index().calls().len(), 1);
    assert_eq!(engine.notifier().notices().len(), 1);

    let now = ts("2024-03-01T00:05:00Z");
    let leased = alerts_sql::lease_due_alerts("w", &engine.checkpoints(), now, now, 10, engine.pool())
        .await
        .unwrap();
    assert!(leased.is_empty());

    // Editing the query resumes the alert.
    let update = alerts_sql::AlertUpdate {
        query: Some("(qualified immunity)".to_string()),
        ..Default::default()
    };
    alerts_sql::update_alert(Id::new(1), alice.id, &update, now, engine.pool())
        .await
        .unwrap();

    engine.index().push(Response::Hits(vec![doc("D1", "2024-03-01T00:04:00Z")]));
    let outcome = run_leased(&engine, fetch(&engine, 1).await, ts("2024-03-01T00:06:00Z"))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Notified { documents: 1 });
    assert_eq!(engine.index().calls()[1].0, "(qualified immunity)");
    assert_eq!(fetch(&engine, 1).await.query_error, None);
}

#[tokio::test]
async fn manual_runs_ignore_backoff() {
    let engine = engine(SchedulerConfig::default()).await;
    let alice = owner(1);
    create(&engine, 1, &alice, Cadence::RealTime, "2024-03-01T00:00:00Z").await;

    engine.index().push(Response::Unavailable);
    let now = ts("2024-03-01T00:01:00Z");
    run_leased(&engine, fetch(&engine, 1).await, now).await.unwrap();
    assert!(fetch(&engine, 1).await.retry_at.is_some());

    engine.index().push(Response::Hits(vec![doc("D1", "2024-03-01T00:00:30Z")]));
    let outcome = engine.run_alert_now(Id::new(1), alice.id, now).await.unwrap();
    assert_eq!(outcome, RunOutcome::Notified { documents: 1 });
    assert_eq!(fetch(&engine, 1).await.retry_at, None);

    engine.index().push(Response::Syntax("unexpected end of query"));
    assert!(matches!(
        engine.run_alert_now(Id::new(1), alice.id, now).await,
        Err(alerts::Error::QuerySyntax(message)) if message == "unexpected end of query"
    ));
}
