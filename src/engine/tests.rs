use super::*;
use crate::limits::*;
use ulid::Ulid;

const NOW: Ms = 1_741_633_200_000; // 2025-03-10 19:00 UTC
const TTL: Ms = 10 * MINUTE_MS;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("turnero_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

fn key(raw: &str) -> SlotKey {
    SlotKey::parse(raw).unwrap()
}

fn customer(name: &str) -> CustomerInfo {
    CustomerInfo {
        name: name.into(),
        phone: "1155550000".into(),
    }
}

fn intent_for(r: &Reservation, intent_id: &str, now: Ms) -> IntentRef {
    IntentRef {
        intent_id: intent_id.into(),
        slot: r.slot.clone(),
        complex_id: r.slot.complex_id().to_string(),
        reservation_id: r.id,
        customer: r.customer.clone(),
        deposit_cents: r.deposit_cents,
        created_at: now,
    }
}

fn outcome(payment_id: &str, intent_id: &str, verdict: Verdict) -> OutcomeUpdate {
    OutcomeUpdate {
        payment_id: payment_id.into(),
        intent_id: Some(intent_id.into()),
        reservation_id: None,
        verdict,
    }
}

/// Hold + attached intent, ready for outcomes.
async fn pending(engine: &Engine, slot: &SlotKey, intent_id: &str) -> Reservation {
    let hold = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();
    engine
        .attach_intent(intent_for(&hold, intent_id, NOW), NOW + 1000)
        .await
        .unwrap()
}

// ── Holds ────────────────────────────────────────────────

#[tokio::test]
async fn hold_on_free_slot() {
    let engine = new_engine("hold_free.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");

    let r = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();

    assert_eq!(r.status, ReservationStatus::Hold);
    assert_eq!(r.hold_deadline, Some(NOW + TTL));
    assert_eq!(engine.check_slot(&slot, NOW).await, SlotView::Taken(ReservationStatus::Hold));
    assert_eq!(engine.get_reservation(&slot, NOW).await.unwrap().id, r.id);
}

#[tokio::test]
async fn second_hold_is_rejected() {
    let engine = new_engine("hold_twice.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");

    engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();
    let err = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Beto"), 5000, NOW)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::SlotTaken {
            status: ReservationStatus::Hold,
            ..
        }
    ));
    assert!(err.is_contention());
}

#[tokio::test]
async fn hold_with_past_deadline_rejected() {
    let engine = new_engine("hold_past_deadline.wal");
    let err = engine
        .try_create_hold(key("c1-cancha1-2025-03-10-19:00"), NOW, customer("Ana"), 5000, NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holds_exactly_one_wins() {
    let engine = Arc::new(new_engine("hold_race.wal"));
    let slot = key("c1-cancha1-2025-03-10-19:00");

    let mut handles = Vec::new();
    for i in 0..32 {
        let eng = engine.clone();
        let slot = slot.clone();
        handles.push(tokio::spawn(async move {
            eng.try_create_hold(slot, NOW + TTL, customer(&format!("C{i}")), 5000, NOW)
                .await
        }));
    }

    let mut won = 0;
    let mut taken = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::SlotTaken { .. }) => taken += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(taken, 31);
    assert_eq!(engine.list_live(NOW, None).await.len(), 1);
}

#[tokio::test]
async fn expired_hold_reads_as_free_before_sweep() {
    let engine = new_engine("hold_expired_read.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();

    let later = NOW + TTL + 1;
    assert_eq!(engine.check_slot(&slot, later).await, SlotView::FreeStaleHold);
    assert!(engine.get_reservation(&slot, later).await.is_none());
    assert_eq!(engine.stored_count(), 1);

    assert!(engine.release_if_expired(&slot, later).await.unwrap());
    assert_eq!(engine.check_slot(&slot, later).await, SlotView::Free);
    assert_eq!(engine.stored_count(), 0);
}

#[tokio::test]
async fn expired_hold_is_replaced_by_new_hold() {
    let engine = new_engine("hold_replace_expired.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let first = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();

    let later = NOW + TTL + 1;
    let second = engine
        .try_create_hold(slot.clone(), later + TTL, customer("Beto"), 5000, later)
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(second.customer.name, "Beto");
}

#[tokio::test]
async fn release_if_expired_leaves_live_rows_alone() {
    let engine = new_engine("release_if_expired_live.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    pending(&engine, &slot, "pref-1").await;

    // deadline long gone, but the row is pending now
    assert!(!engine.release_if_expired(&slot, NOW + 10 * TTL).await.unwrap());
    assert_eq!(
        engine.check_slot(&slot, NOW + 10 * TTL).await,
        SlotView::Taken(ReservationStatus::Pending)
    );
}

#[tokio::test]
async fn collect_expired_holds_skips_live_rows() {
    let engine = new_engine("collect_expired.wal");
    let a = key("c1-cancha1-2025-03-10-19:00");
    let b = key("c1-cancha2-2025-03-10-19:00");
    engine
        .try_create_hold(a.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();
    engine
        .try_create_hold(b.clone(), NOW + 3 * TTL, customer("Beto"), 5000, NOW)
        .await
        .unwrap();

    assert!(engine.collect_expired_holds(NOW).is_empty());
    assert_eq!(engine.collect_expired_holds(NOW + TTL), vec![a]);
}

#[tokio::test]
async fn release_hold_only_matches_same_hold() {
    let engine = new_engine("release_hold_match.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let hold = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();

    assert!(
        !engine
            .release_hold(&slot, Ulid::new(), ReleaseReason::IntentFailed)
            .await
            .unwrap()
    );
    assert!(
        engine
            .release_hold(&slot, hold.id, ReleaseReason::IntentFailed)
            .await
            .unwrap()
    );
    assert!(engine.check_slot(&slot, NOW).await.is_free());
}

// ── Intents ──────────────────────────────────────────────

#[tokio::test]
async fn attach_intent_moves_hold_to_pending() {
    let engine = new_engine("attach_intent.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let r = pending(&engine, &slot, "pref-1").await;

    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.hold_deadline, None);
    assert_eq!(r.external_intent_id.as_deref(), Some("pref-1"));
    assert_eq!(engine.intent_ref("pref-1").unwrap().reservation_id, r.id);
}

#[tokio::test]
async fn attach_intent_to_expired_hold_is_stale() {
    let engine = new_engine("attach_expired.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let hold = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();

    let err = engine
        .attach_intent(intent_for(&hold, "pref-1", NOW), NOW + TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleHold(_)));
    assert!(engine.intent_ref("pref-1").is_none());
}

#[tokio::test]
async fn attach_intent_to_replaced_hold_is_stale() {
    let engine = new_engine("attach_replaced.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let old = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();
    let later = NOW + TTL + 1;
    engine
        .try_create_hold(slot.clone(), later + TTL, customer("Beto"), 5000, later)
        .await
        .unwrap();

    let err = engine
        .attach_intent(intent_for(&old, "pref-old", NOW), later)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleHold(_)));
}

// ── Outcomes ─────────────────────────────────────────────

#[tokio::test]
async fn approval_is_idempotent_and_fires_once() {
    let engine = new_engine("approve_idempotent.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    pending(&engine, &slot, "pref-1").await;
    let mut rx = engine.notify.subscribe("c1");

    let update = outcome("pay-1", "pref-1", Verdict::Approved);
    assert_eq!(engine.apply_outcome(&slot, &update).await.unwrap(), Applied::Approved);
    assert_eq!(
        engine.apply_outcome(&slot, &update).await.unwrap(),
        Applied::AlreadyApproved
    );
    assert_eq!(
        engine.apply_outcome(&slot, &update).await.unwrap(),
        Applied::AlreadyApproved
    );

    let mut approvals = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, Event::PaymentApproved { .. }) {
            approvals += 1;
        }
    }
    assert_eq!(approvals, 1);

    let r = engine.get_reservation(&slot, NOW).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);
    assert_eq!(r.external_payment_id.as_deref(), Some("pay-1"));
}

#[tokio::test]
async fn late_in_process_does_not_downgrade_approval() {
    let engine = new_engine("approve_then_pending.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    pending(&engine, &slot, "pref-1").await;

    engine
        .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::Approved))
        .await
        .unwrap();
    let applied = engine
        .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::InProcess))
        .await
        .unwrap();

    assert_eq!(applied, Applied::StaleIgnored);
    assert_eq!(
        engine.check_slot(&slot, NOW).await,
        SlotView::Taken(ReservationStatus::Approved)
    );
}

#[tokio::test]
async fn in_process_then_approved() {
    let engine = new_engine("pending_then_approve.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    pending(&engine, &slot, "pref-1").await;

    let first = engine
        .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::InProcess))
        .await
        .unwrap();
    let repeat = engine
        .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::InProcess))
        .await
        .unwrap();
    let last = engine
        .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::Approved))
        .await
        .unwrap();

    assert_eq!(first, Applied::MarkedPending);
    assert_eq!(repeat, Applied::AlreadyPending);
    assert_eq!(last, Applied::Approved);
}

#[tokio::test]
async fn rejection_frees_the_slot() {
    let engine = new_engine("reject_frees.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    pending(&engine, &slot, "pref-1").await;

    let applied = engine
        .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::Rejected))
        .await
        .unwrap();

    assert_eq!(applied, Applied::Released);
    assert!(engine.check_slot(&slot, NOW).await.is_free());
    engine
        .try_create_hold(slot, NOW + TTL, customer("Beto"), 5000, NOW)
        .await
        .unwrap();
}

#[tokio::test]
async fn late_rejection_of_other_attempt_keeps_approval() {
    let engine = new_engine("reject_other_attempt.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    pending(&engine, &slot, "pref-1").await;

    let approved = engine
        .apply_outcome(&slot, &outcome("pay-B", "pref-1", Verdict::Approved))
        .await
        .unwrap();
    let late_reject = engine
        .apply_outcome(&slot, &outcome("pay-A", "pref-1", Verdict::Rejected))
        .await
        .unwrap();

    assert_eq!(approved, Applied::Approved);
    assert_eq!(late_reject, Applied::StaleIgnored);
    let r = engine.get_reservation(&slot, NOW).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);
    assert_eq!(r.external_payment_id.as_deref(), Some("pay-B"));
}

#[tokio::test]
async fn refund_of_approving_payment_releases() {
    let engine = new_engine("refund_approved.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    pending(&engine, &slot, "pref-1").await;
    engine
        .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::Approved))
        .await
        .unwrap();

    let applied = engine
        .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::Rejected))
        .await
        .unwrap();

    assert_eq!(applied, Applied::Released);
    assert!(engine.check_slot(&slot, NOW).await.is_free());
}

#[tokio::test]
async fn stale_outcome_does_not_touch_newer_hold() {
    let engine = new_engine("stale_outcome.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    pending(&engine, &slot, "pref-1").await;
    engine
        .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::Rejected))
        .await
        .unwrap();
    let newer = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Beto"), 5000, NOW)
        .await
        .unwrap();

    let applied = engine
        .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::Approved))
        .await
        .unwrap();

    assert_eq!(applied, Applied::NoMatch);
    let current = engine.get_reservation(&slot, NOW).await.unwrap();
    assert_eq!(current.id, newer.id);
    assert_eq!(current.status, ReservationStatus::Hold);
}

#[tokio::test]
async fn outcome_matches_by_reservation_id_before_intent_attached() {
    let engine = new_engine("outcome_by_reservation.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let hold = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();

    let update = OutcomeUpdate {
        payment_id: "pay-1".into(),
        intent_id: Some("pref-1".into()),
        reservation_id: Some(hold.id),
        verdict: Verdict::Approved,
    };
    assert_eq!(engine.apply_outcome(&slot, &update).await.unwrap(), Applied::Approved);
    assert_eq!(
        engine.check_slot(&slot, NOW + 10 * TTL).await,
        SlotView::Taken(ReservationStatus::Approved)
    );
}

#[tokio::test]
async fn outcome_for_empty_slot_is_no_match() {
    let engine = new_engine("outcome_empty.wal");
    let applied = engine
        .apply_outcome(
            &key("c1-cancha1-2025-03-10-19:00"),
            &outcome("pay-1", "pref-1", Verdict::Approved),
        )
        .await
        .unwrap();
    assert_eq!(applied, Applied::NoMatch);
}

// ── Materialize & owner rows ─────────────────────────────

#[tokio::test]
async fn materialize_approved_into_free_slot() {
    let engine = new_engine("materialize_free.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let hold = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();
    let intent = intent_for(&hold, "pref-1", NOW);
    engine
        .release_hold(&slot, hold.id, ReleaseReason::Expired)
        .await
        .unwrap();

    let r = engine
        .materialize_approved(&intent, "pay-1", NOW + 2 * TTL)
        .await
        .unwrap();

    assert_eq!(r.status, ReservationStatus::Approved);
    assert_eq!(r.id, hold.id);
    assert_eq!(r.customer.name, "Ana");
    assert_eq!(r.external_payment_id.as_deref(), Some("pay-1"));
}

#[tokio::test]
async fn materialize_approved_respects_uniqueness() {
    let engine = new_engine("materialize_taken.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let hold = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();
    let intent = intent_for(&hold, "pref-1", NOW);
    engine
        .release_hold(&slot, hold.id, ReleaseReason::Expired)
        .await
        .unwrap();
    engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Beto"), 5000, NOW)
        .await
        .unwrap();

    let err = engine
        .materialize_approved(&intent, "pay-1", NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotTaken { .. }));
}

#[tokio::test]
async fn owner_rows_obey_uniqueness() {
    let engine = new_engine("owner_rows.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");

    let blocked = engine
        .reserve_direct(slot.clone(), ReservationStatus::Blocked, CustomerInfo::default(), NOW)
        .await
        .unwrap();
    assert_eq!(blocked.status, ReservationStatus::Blocked);

    let err = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::SlotTaken {
            status: ReservationStatus::Blocked,
            ..
        }
    ));

    let err = engine
        .reserve_direct(slot.clone(), ReservationStatus::Manual, customer("Ana"), NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotTaken { .. }));
}

#[tokio::test]
async fn reserve_direct_rejects_customer_statuses() {
    let engine = new_engine("owner_bad_status.wal");
    let err = engine
        .reserve_direct(
            key("c1-cancha1-2025-03-10-19:00"),
            ReservationStatus::Approved,
            customer("Ana"),
            NOW,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidStatus(ReservationStatus::Approved)));
}

#[tokio::test]
async fn cancel_reservation_frees_pending_row() {
    let engine = new_engine("cancel_pending.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let r = pending(&engine, &slot, "pref-1").await;

    let removed = engine.cancel_reservation(&slot).await.unwrap();
    assert_eq!(removed.id, r.id);
    assert!(engine.check_slot(&slot, NOW).await.is_free());

    let err = engine.cancel_reservation(&slot).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn list_live_filters_by_complex_and_sorts() {
    let engine = new_engine("list_live.wal");
    for raw in [
        "c1-cancha2-2025-03-10-19:00",
        "c2-cancha1-2025-03-10-19:00",
        "c1-cancha1-2025-03-10-20:00",
        "c1-cancha1-2025-03-10-19:00",
    ] {
        engine
            .try_create_hold(key(raw), NOW + TTL, customer("Ana"), 5000, NOW)
            .await
            .unwrap();
    }

    let keys: Vec<String> = engine
        .list_live(NOW, Some("c1"))
        .await
        .into_iter()
        .map(|r| r.slot.to_string())
        .collect();
    assert_eq!(
        keys,
        vec![
            "c1-cancha1-2025-03-10-19:00",
            "c1-cancha1-2025-03-10-20:00",
            "c1-cancha2-2025-03-10-19:00",
        ]
    );
    assert_eq!(engine.list_live(NOW, None).await.len(), 4);
    assert!(engine.list_live(NOW + TTL, None).await.is_empty());
}

// ── WAL ──────────────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_rows_and_intents() {
    let path = test_wal_path("replay.wal");
    let notify = Arc::new(NotifyHub::new());
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let other = key("c1-cancha2-2025-03-10-19:00");

    {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        pending(&engine, &slot, "pref-1").await;
        engine
            .apply_outcome(&slot, &outcome("pay-1", "pref-1", Verdict::Approved))
            .await
            .unwrap();
        pending(&engine, &other, "pref-2").await;
        engine
            .apply_outcome(&other, &outcome("pay-2", "pref-2", Verdict::Rejected))
            .await
            .unwrap();
    }

    let engine = Engine::new(path, notify).unwrap();
    let r = engine.get_reservation(&slot, NOW).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);
    assert!(engine.check_slot(&other, NOW).await.is_free());
    assert!(engine.intent_ref("pref-1").is_some());
    assert!(engine.intent_ref("pref-2").is_some());
}

#[tokio::test]
async fn compaction_preserves_state_and_drops_old_intents() {
    let path = test_wal_path("compact.wal");
    let notify = Arc::new(NotifyHub::new());
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let gone = key("c1-cancha2-2025-03-10-19:00");

    {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        pending(&engine, &slot, "pref-1").await;
        pending(&engine, &gone, "pref-2").await;
        engine.cancel_reservation(&gone).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 5);

        // pref-1 and pref-2 were both created at NOW; keep only one by age
        engine.intents.alter("pref-2", |_, mut i| {
            i.created_at = NOW - 30 * HOUR_MS;
            i
        });
        engine.compact_wal(NOW, 24 * HOUR_MS).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(engine.intent_ref("pref-2").is_none());
    }

    let engine = Engine::new(path, notify).unwrap();
    let r = engine.get_reservation(&slot, NOW).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.external_intent_id.as_deref(), Some("pref-1"));
    assert!(engine.intent_ref("pref-1").is_some());
    assert!(engine.intent_ref("pref-2").is_none());
    assert!(engine.check_slot(&gone, NOW).await.is_free());
}

#[tokio::test]
async fn commit_during_compaction_survives_restart() {
    let path = test_wal_path("compact_concurrent.wal");
    let notify = Arc::new(NotifyHub::new());
    let busy = key("c1-cancha1-2025-03-10-19:00");
    let late = key("c1-cancha2-2025-03-10-19:00");

    {
        let engine = Arc::new(Engine::new(path.clone(), notify.clone()).unwrap());
        engine
            .try_create_hold(busy.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
            .await
            .unwrap();

        // Stall the snapshot on the busy slot.
        let busy_state = engine.get_slot(&busy).unwrap();
        let blocker = busy_state.write().await;
        let compaction = tokio::spawn({
            let engine = engine.clone();
            async move { engine.compact_wal(NOW, HOUR_MS).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let hold = tokio::spawn({
            let engine = engine.clone();
            let late = late.clone();
            async move {
                engine
                    .try_create_hold(late, NOW + TTL, customer("Beto"), 5000, NOW)
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!hold.is_finished(), "hold committed while compaction was mid-snapshot");

        drop(blocker);
        compaction.await.unwrap().unwrap();
        hold.await.unwrap().unwrap();
    }

    let engine = Engine::new(path, notify).unwrap();
    assert!(engine.get_reservation(&busy, NOW).await.is_some());
    let r = engine.get_reservation(&late, NOW).await.unwrap();
    assert_eq!(r.customer.name, "Beto");
}

#[tokio::test]
async fn writes_after_torn_tail_survive_next_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_tail.wal");
    let notify = Arc::new(NotifyHub::new());
    let first = key("c1-cancha1-2025-03-10-19:00");
    let second = key("c1-cancha2-2025-03-10-19:00");

    {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        engine
            .try_create_hold(first.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
            .await
            .unwrap();
    }
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[9, 0, 0, 0, 1, 2, 3]).unwrap();
    }
    {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        assert!(engine.get_reservation(&first, NOW).await.is_some());
        engine
            .try_create_hold(second.clone(), NOW + TTL, customer("Beto"), 5000, NOW)
            .await
            .unwrap();
    }

    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(engine.get_reservation(&first, NOW).await.unwrap().customer.name, "Ana");
    assert_eq!(engine.get_reservation(&second, NOW).await.unwrap().customer.name, "Beto");
}

#[tokio::test]
async fn group_commit_batches_concurrent_holds() {
    let path = test_wal_path("group_commit.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(path.clone(), notify.clone()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let slot = key(&format!("c1-cancha{i}-2025-03-10-19:00"));
            eng.try_create_hold(slot, NOW + TTL, customer("Ana"), 5000, NOW)
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_live(NOW, None).await.len(), n);

    let engine2 = Engine::new(path, notify).unwrap();
    assert_eq!(engine2.list_live(NOW, None).await.len(), n);
}

#[tokio::test]
async fn prune_drops_released_slots() {
    let engine = new_engine("prune.wal");
    let slot = key("c1-cancha1-2025-03-10-19:00");
    let hold = engine
        .try_create_hold(slot.clone(), NOW + TTL, customer("Ana"), 5000, NOW)
        .await
        .unwrap();
    engine
        .release_hold(&slot, hold.id, ReleaseReason::Owner)
        .await
        .unwrap();

    assert_eq!(engine.prune_empty_slots(), 1);
    assert_eq!(engine.prune_empty_slots(), 0);
}
