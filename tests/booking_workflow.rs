//! Human-in-the-loop booking requests: creation, staff decisions and the
//! review queue.
//!
//! Run with: cargo test --test booking_workflow

mod common;

use chrono::{Duration, NaiveDate, NaiveTime};
use uuid::Uuid;

use clinic_automation::booking;
use clinic_automation::error::BookingError;
use clinic_automation::models::booking::{BookingApproval, BookingStatus, NewBookingRequest};
use clinic_automation::models::payloads::JobKind;
use clinic_automation::sweeper;

use common::Harness;

fn new_request(h: &Harness, customer_id: Uuid, conversation_id: Option<Uuid>) -> NewBookingRequest {
    NewBookingRequest {
        tenant_id: h.tenant_id,
        customer_id,
        conversation_id,
        requested_date: NaiveDate::from_ymd_opt(2025, 3, 20),
        requested_time: NaiveTime::from_hms_opt(14, 0, 0),
        treatment_type: Some("LASIK consultation".to_string()),
        ..Default::default()
    }
}

fn approval_on(date: NaiveDate, text: Option<&str>) -> BookingApproval {
    BookingApproval {
        confirmed_date: Some(date),
        confirmed_time: NaiveTime::from_hms_opt(15, 0, 0),
        response_text: text.map(str::to_string),
        responder_id: Some(Uuid::new_v4()),
        ..Default::default()
    }
}

#[tokio::test]
async fn new_request_is_pending_and_pages_staff() {
    let h = Harness::new();
    let customer = h.customer(Some("Kim"), "KO", "KR");
    let conversation = h.conversation(&customer);

    let created = booking::create_request(&h.state, new_request(&h, customer.id, Some(conversation.id)))
        .await
        .unwrap();

    assert_eq!(created.status, BookingStatus::Pending);
    assert_eq!(created.notification_count, 1);
    assert_eq!(h.store.booking_requests()[0].notification_count, 1);

    let jobs = h.queue.jobs();
    assert_eq!(jobs.len(), 1);
    match &jobs[0].kind {
        JobKind::BookingReview(review) => {
            assert_eq!(review.booking_request_id, created.id);
            assert!(!review.reminder);
            assert_eq!(review.summary, "LASIK consultation on 2025-03-20 14:00");
        }
        other => panic!("unexpected job: {other:?}"),
    }
}

#[tokio::test]
async fn request_survives_a_queue_outage() {
    let h = Harness::new();
    let customer = h.customer(None, "KO", "KR");
    h.queue.set_unavailable(true);

    let created = booking::create_request(&h.state, new_request(&h, customer.id, None))
        .await
        .unwrap();

    assert_eq!(created.status, BookingStatus::Pending);
    assert_eq!(created.notification_count, 0);
    assert_eq!(h.store.booking_requests().len(), 1);
}

#[tokio::test]
async fn approval_records_the_decision_and_replies() {
    let h = Harness::new();
    let customer = h.customer(Some("Kim"), "KO", "KR");
    let conversation = h.conversation(&customer);
    let created = booking::create_request(&h.state, new_request(&h, customer.id, Some(conversation.id)))
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(12));
    let date = NaiveDate::from_ymd_opt(2025, 3, 21).unwrap();
    let approved = booking::approve(
        &h.state,
        created.id,
        approval_on(date, Some("3월 21일 15시로 예약되었습니다.")),
    )
    .await
    .unwrap();

    assert_eq!(approved.status, BookingStatus::Approved);
    assert_eq!(approved.confirmed_date, Some(date));
    assert_eq!(approved.human_responded_at, Some(h.state.clock.now()));
    assert!(approved.responded_by.is_some());

    let replies: Vec<_> = h
        .queue
        .jobs()
        .into_iter()
        .filter_map(|job| match job.kind {
            JobKind::SendMessage(msg) => Some(msg),
            _ => None,
        })
        .collect();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].conversation_id, conversation.id);
    assert_eq!(replies[0].content, "3월 21일 15시로 예약되었습니다.");
}

#[tokio::test]
async fn approval_needs_a_date() {
    let h = Harness::new();
    let customer = h.customer(None, "KO", "KR");
    let created = booking::create_request(&h.state, new_request(&h, customer.id, None))
        .await
        .unwrap();

    let err = booking::approve(&h.state, created.id, BookingApproval::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));

    let alternatives = BookingApproval {
        alternative_dates: vec!["2025-03-22 10:00".to_string()],
        ..Default::default()
    };
    let approved = booking::approve(&h.state, created.id, alternatives).await.unwrap();
    assert_eq!(approved.alternative_dates, vec!["2025-03-22 10:00".to_string()]);
}

#[tokio::test]
async fn rejection_needs_a_reason() {
    let h = Harness::new();
    let customer = h.customer(None, "KO", "KR");
    let created = booking::create_request(&h.state, new_request(&h, customer.id, None))
        .await
        .unwrap();

    let err = booking::reject(&h.state, created.id, "   ", None).await.unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));

    let rejected = booking::reject(&h.state, created.id, "fully booked that week", None)
        .await
        .unwrap();
    assert_eq!(rejected.status, BookingStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("fully booked that week"));

    let err = booking::approve(
        &h.state,
        created.id,
        approval_on(NaiveDate::from_ymd_opt(2025, 3, 21).unwrap(), None),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        BookingError::InvalidTransition {
            from: BookingStatus::Rejected,
            to: BookingStatus::Approved
        }
    ));
}

#[tokio::test]
async fn confirmation_happens_once() {
    let h = Harness::new();
    let customer = h.customer(None, "KO", "KR");
    let created = booking::create_request(&h.state, new_request(&h, customer.id, None))
        .await
        .unwrap();
    booking::approve(
        &h.state,
        created.id,
        approval_on(NaiveDate::from_ymd_opt(2025, 3, 20).unwrap(), None),
    )
    .await
    .unwrap();

    let confirmed = booking::confirm_to_crm(&h.state, created.id, "CRM-1001").await.unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert_eq!(confirmed.crm_booking_id.as_deref(), Some("CRM-1001"));
    assert!(confirmed.confirmed_at.is_some());

    let err = booking::confirm_to_crm(&h.state, created.id, "CRM-1002")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::InvalidTransition {
            from: BookingStatus::Confirmed,
            to: BookingStatus::Confirmed
        }
    ));
    assert_eq!(
        h.store.booking_requests()[0].crm_booking_id.as_deref(),
        Some("CRM-1001")
    );
}

#[tokio::test]
async fn unknown_request_is_not_found() {
    let h = Harness::new();
    let id = Uuid::new_v4();
    let err = booking::reject(&h.state, id, "no", None).await.unwrap_err();
    assert!(matches!(err, BookingError::NotFound(missing) if missing == id));
}

#[tokio::test]
async fn pending_queue_is_oldest_first_with_wait_times() {
    let h = Harness::new();
    let customer = h.customer(None, "KO", "KR");

    let first = booking::create_request(&h.state, new_request(&h, customer.id, None))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(20));
    let second = booking::create_request(&h.state, new_request(&h, customer.id, None))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(5));
    let decided = booking::create_request(&h.state, new_request(&h, customer.id, None))
        .await
        .unwrap();
    booking::reject(&h.state, decided.id, "duplicate", None).await.unwrap();

    let other_tenant = NewBookingRequest {
        tenant_id: Uuid::new_v4(),
        ..new_request(&h, customer.id, None)
    };
    booking::create_request(&h.state, other_tenant).await.unwrap();

    let pending = booking::list_pending(&h.state, Some(h.tenant_id)).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|p| p.request.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
    assert_eq!(pending[0].waiting_minutes, 25);
    assert_eq!(pending[1].waiting_minutes, 5);
    assert_eq!(pending[0].notification_count, 1);

    let everyone = booking::list_pending(&h.state, None).await.unwrap();
    assert_eq!(everyone.len(), 3);
}

#[tokio::test]
async fn sweeper_reminds_staff_about_stale_requests() {
    let h = Harness::new();
    let customer = h.customer(None, "KO", "KR");
    let created = booking::create_request(&h.state, new_request(&h, customer.id, None))
        .await
        .unwrap();

    let mut sweep = sweeper::Sweeper::starting_at(h.state.clock.now());
    h.clock.advance(Duration::minutes(10));
    let early = sweep.sweep(&h.state).await;
    assert_eq!(early.reminders_sent, 0);

    h.clock.advance(Duration::minutes(25));
    let due = sweep.sweep(&h.state).await;
    assert_eq!(due.reminders_sent, 1);

    let again = sweep.sweep(&h.state).await;
    assert_eq!(again.reminders_sent, 0);

    let reminders: Vec<_> = h
        .queue
        .jobs()
        .into_iter()
        .filter(|job| matches!(&job.kind, JobKind::BookingReview(r) if r.reminder))
        .collect();
    assert_eq!(reminders.len(), 1);
    assert_eq!(h.store.booking_requests()[0].id, created.id);
    assert_eq!(h.store.booking_requests()[0].notification_count, 2);
}
