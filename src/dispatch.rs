use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::AppState;
use crate::booking;
use crate::intent::{self, InboundMessage};
use crate::models::booking::BookingApproval;
use crate::models::execution::{ExecutionResult, TriggerContext};
use crate::models::payloads::IncomingEvent;
use crate::models::rule::TriggerType;
use crate::rule_engine;

/// Routes one event from the incoming stream. Returns the rule results the
/// event produced, if it raised a trigger.
pub async fn handle_event(state: Arc<AppState>, event: IncomingEvent) -> Result<Vec<ExecutionResult>> {
    match event {
        IncomingEvent::NewMessage {
            tenant_id,
            conversation_id,
            customer_id,
            message_id,
            content,
            language,
        } => {
            info!(
                tenant_id = %tenant_id,
                conversation_id = %conversation_id,
                content_preview = content.chars().take(50).collect::<String>(),
                "Received NEW_MESSAGE"
            );

            let trigger = TriggerContext {
                tenant_id: Some(tenant_id),
                conversation_id: Some(conversation_id),
                customer_id: Some(customer_id),
                message_id: Some(message_id),
                ..Default::default()
            };
            let inbound = InboundMessage {
                tenant_id,
                conversation_id,
                customer_id,
                message_id,
                content,
                language,
            };

            let (results, classified) = tokio::join!(
                rule_engine::process_trigger(&state, TriggerType::MessageReceived, trigger),
                intent::handle_inbound_message(&state, &inbound),
            );

            match classified {
                Ok(outcome) => {
                    if let Some(request) = &outcome.booking_request {
                        info!(
                            booking_request_id = %request.id,
                            conversation_id = %conversation_id,
                            "Booking request raised from message"
                        );
                    }
                }
                Err(e) => error!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Intent handling failed"
                ),
            }

            Ok(results)
        }
        IncomingEvent::Trigger { trigger, context } => {
            info!(
                trigger = trigger.as_str(),
                tenant_id = ?context.tenant_id,
                "Received TRIGGER"
            );
            Ok(rule_engine::process_trigger(&state, trigger, context).await)
        }
        IncomingEvent::ApproveBooking {
            booking_request_id,
            confirmed_date,
            confirmed_time,
            alternative_dates,
            response_text,
            responder_id,
        } => {
            let approval = BookingApproval {
                confirmed_date,
                confirmed_time,
                alternative_dates,
                response_text,
                responder_id,
            };
            booking::approve(&state, booking_request_id, approval)
                .await
                .with_context(|| format!("Failed to approve booking request {booking_request_id}"))?;
            Ok(Vec::new())
        }
        IncomingEvent::RejectBooking {
            booking_request_id,
            reason,
            responder_id,
        } => {
            booking::reject(&state, booking_request_id, &reason, responder_id)
                .await
                .with_context(|| format!("Failed to reject booking request {booking_request_id}"))?;
            Ok(Vec::new())
        }
        IncomingEvent::ConfirmBooking {
            booking_request_id,
            crm_booking_id,
        } => {
            let confirmed = booking::confirm_to_crm(&state, booking_request_id, &crm_booking_id)
                .await
                .with_context(|| format!("Failed to confirm booking request {booking_request_id}"))?;

            let trigger = TriggerContext {
                tenant_id: Some(confirmed.tenant_id),
                conversation_id: confirmed.conversation_id,
                customer_id: Some(confirmed.customer_id),
                ..Default::default()
            };
            Ok(rule_engine::process_trigger(&state, TriggerType::BookingConfirmed, trigger).await)
        }
    }
}
