//! The inbound dispatcher.
//!
//! Every message, whether polled by [`sync_threads`] or pushed by a live
//! listener, runs the same gauntlet: parse the body as an envelope,
//! resolve or create the thread, dedupe against transport message ids,
//! apply the payload, persist, and only then acknowledge. Errors raised
//! during apply are written into the thread (`errored` state) and the
//! message is deliberately left unacknowledged so the transport may
//! redeliver; nothing ever propagates out of the dispatcher.
//!
//! [`sync_threads`]: RemittanceManager::sync_threads

use anyhow::Context;
use common::envelope::{
    Envelope, EnvelopeKind, IdentityVerificationAcknowledgment,
    IdentityVerificationRequest, IdentityVerificationResponse, Invoice,
    Receipt, Settlement, Termination,
};
use common::ids::ThreadId;
use common::thread::{Direction, ProtocolLogEntry, ThreadRole, ThreadState};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::IdentityRequestPhase;
use crate::error::Error;
use crate::event::EngineEvent;
use crate::identity;
use crate::manager::{EngineState, RemittanceManager};
use crate::traits::{
    AcceptOutcome, AcceptSettlement, CertificateAssessment,
    IdentityResponseAction, PeerMessage, ProcessReceipt, ProcessTermination,
};

impl RemittanceManager {
    /// Fetches pending messages from our message box and applies each
    /// through the dispatcher, sequentially. Concurrent callers on the same
    /// engine should serialize themselves.
    #[instrument(skip_all, name = "(sync-threads)")]
    pub async fn sync_threads(
        &self,
        host_override: Option<&str>,
    ) -> Result<(), Error> {
        // Re-check the identity key cache; absence only matters for the
        // steps that actually need the key.
        let _ = self.refresh_identity_key().await;

        let message_box = &self.inner.config.message_box;
        let messages = self
            .inner
            .comms
            .list_messages(message_box, host_override)
            .await
            .map_err(|err| {
                Error::transport(
                    format!(
                        "Failed to list messages from box '{message_box}'",
                    ),
                    err,
                )
            })?;

        for message in &messages {
            self.apply_peer_message(message).await;
        }
        Ok(())
    }

    /// Subscribes to the comms layer's live pushes (if it has any) and runs
    /// each pushed message through the same dispatcher. Returns the task
    /// driving the subscription.
    pub async fn start_listening(
        &self,
        host_override: Option<&str>,
    ) -> Result<JoinHandle<()>, Error> {
        let mut live_rx = self
            .inner
            .comms
            .subscribe_live_messages(&self.inner.config.message_box, host_override)
            .await
            .map_err(|err| {
                Error::transport("Failed to subscribe to live messages", err)
            })?;

        let manager = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(message) = live_rx.recv().await {
                manager.apply_peer_message(&message).await;
            }
            debug!("Live message stream ended");
        }))
    }

    /// Applies one inbound message end to end. Never propagates errors.
    pub(crate) async fn apply_peer_message(&self, message: &PeerMessage) {
        let Some(envelope) = Envelope::parse(&message.body) else {
            // Left unacknowledged; the transport may redeliver.
            debug!(
                message_id = %message.message_id,
                "Skipping message with unparseable body",
            );
            return;
        };
        let thread_id = envelope.thread_id.clone();

        let mut events = Vec::new();
        let ack = {
            let mut state = self.lock_state().await;

            // Resolve the thread, inferring our role for unknown ones.
            if !state.store.contains(&thread_id) {
                let my_role = identity::infer_role(
                    &envelope.kind,
                    &self.config().identity_options,
                );
                let created = self.create_thread(
                    &mut state,
                    thread_id.clone(),
                    message.sender.clone(),
                    my_role,
                    &mut events,
                );
                if let Err(err) = created {
                    warn!(%thread_id, "Failed to create thread: {err:#}");
                    self.emit_events(events);
                    return;
                }
            }

            let thread =
                state.store.get(&thread_id).expect("Resolved or created");

            // Idempotent redelivery: already applied, just ack again.
            if thread.processed_message_ids.contains(&message.message_id) {
                drop(state);
                self.emit_events(events);
                self.acknowledge(&message.message_id).await;
                return;
            }

            // Terminal threads are frozen; leave the message unacked and
            // let the transport's retry policy bound redelivery.
            if thread.is_terminal() {
                warn!(
                    %thread_id,
                    state = %thread.state(),
                    kind = %envelope.kind,
                    "Dropping envelope for terminal thread",
                );
                drop(state);
                self.emit_events(events);
                return;
            }

            // Log the inbound envelope up front so even failed applies
            // leave an audit trail.
            let thread = state
                .store
                .get_mut(&thread_id)
                .expect("Resolved or created");
            thread.protocol_log.push(ProtocolLogEntry {
                direction: Direction::Inbound,
                envelope: envelope.clone(),
                transport_message_id: message.message_id.clone(),
            });

            let applied = self
                .apply_envelope(&mut state, message, &envelope, &mut events)
                .await;

            match applied {
                Ok(()) => {
                    let now = self.now();
                    let thread = state
                        .store
                        .get_mut(&thread_id)
                        .expect("Resolved or created");
                    thread
                        .processed_message_ids
                        .insert(message.message_id.clone());
                    thread.updated_at = now;
                    thread.debug_assert_invariants();
                    events.push(EngineEvent::EnvelopeReceived {
                        thread_id: thread_id.clone(),
                        kind: envelope.kind.clone(),
                        transport_message_id: message.message_id.clone(),
                    });

                    let persisted = self.persist(&state.store).await;
                    state.notify(&thread_id);
                    match persisted {
                        Ok(()) => true,
                        Err(err) => {
                            // Persistence failed; leave the message unacked
                            // so redelivery reconverges after a restart.
                            warn!(
                                %thread_id,
                                "Failed to persist after apply: {err:#}",
                            );
                            false
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        %thread_id,
                        kind = %envelope.kind,
                        "Failed to apply inbound envelope: {err:#}",
                    );
                    self.record_apply_failure(&mut state, &thread_id, &err, &mut events)
                        .await;
                    false
                }
            }
        };

        self.emit_events(events);
        if ack {
            self.acknowledge(&message.message_id).await;
        }
    }

    /// Routes an apply error into the thread: `last_error`, the error flag,
    /// the `errored` state. Best-effort persist; the message stays unacked.
    async fn record_apply_failure(
        &self,
        state: &mut EngineState,
        thread_id: &ThreadId,
        err: &anyhow::Error,
        events: &mut Vec<EngineEvent>,
    ) {
        let now = self.now();
        if let Some(thread) = state.store.get_mut(thread_id) {
            if !thread.is_terminal() {
                thread.last_error = Some(format!("{err:#}"));
                thread.flags.error = true;
                let from = thread.state();
                match thread.transition_to(
                    ThreadState::Errored,
                    "inbound apply failed",
                    now,
                ) {
                    Ok(true) => events.push(EngineEvent::StateChanged {
                        thread_id: thread_id.clone(),
                        from,
                        to: ThreadState::Errored,
                        reason: "inbound apply failed".to_owned(),
                    }),
                    Ok(false) => {}
                    Err(transition_err) => warn!(
                        %thread_id,
                        "Could not mark thread errored: {transition_err}",
                    ),
                }
                thread.updated_at = now;
            }
        }
        if let Err(persist_err) = self.persist(&state.store).await {
            warn!(%thread_id, "Failed to persist errored thread: {persist_err:#}");
        }
        state.notify(thread_id);
        events.push(EngineEvent::Error {
            thread_id: Some(thread_id.clone()),
            message: format!("{err:#}"),
        });
    }

    async fn acknowledge(&self, message_id: &str) {
        let message_ids = [message_id.to_owned()];
        if let Err(err) =
            self.inner.comms.acknowledge_messages(&message_ids).await
        {
            // Never fatal; the dedupe set absorbs the redelivery.
            warn!(%message_id, "Failed to acknowledge message: {err:#}");
        }
    }

    // --- Apply by kind --- //

    async fn apply_envelope(
        &self,
        state: &mut EngineState,
        message: &PeerMessage,
        envelope: &Envelope,
        events: &mut Vec<EngineEvent>,
    ) -> anyhow::Result<()> {
        match &envelope.kind {
            EnvelopeKind::IdentityVerificationRequest =>
                self.apply_identity_request(state, message, envelope, events)
                    .await,
            EnvelopeKind::IdentityVerificationResponse =>
                self.apply_identity_response(state, message, envelope, events)
                    .await,
            EnvelopeKind::IdentityVerificationAcknowledgment =>
                self.apply_identity_acknowledgment(state, envelope, events),
            EnvelopeKind::Invoice =>
                self.apply_invoice(state, envelope, events),
            EnvelopeKind::Settlement =>
                self.apply_settlement(state, message, envelope, events).await,
            EnvelopeKind::Receipt =>
                self.apply_receipt(state, message, envelope, events).await,
            EnvelopeKind::Termination =>
                self.apply_termination(state, message, envelope, events).await,
            EnvelopeKind::Unknown(other) =>
                anyhow::bail!("Unknown envelope kind '{other}'"),
        }
    }

    async fn apply_identity_request(
        &self,
        state: &mut EngineState,
        message: &PeerMessage,
        envelope: &Envelope,
        events: &mut Vec<EngineEvent>,
    ) -> anyhow::Result<()> {
        let thread_id = &envelope.thread_id;
        let Some(identity_layer) = self.inner.identity_layer.clone() else {
            self.send_termination(
                state,
                thread_id,
                Termination::new(
                    "noIdentityLayer",
                    "Identity verification requested but no identity layer \
                     is configured",
                ),
                events,
            )
            .await?;
            return Ok(());
        };
        let request: IdentityVerificationRequest = envelope.payload_as()?;

        {
            let thread = state.store.get_mut_or_err(thread_id)?;
            self.transition(
                thread,
                ThreadState::IdentityRequested,
                "identity verification requested",
                events,
            )?;
        }
        events.push(EngineEvent::IdentityRequested {
            thread_id: thread_id.clone(),
            direction: Direction::Inbound,
        });

        let counterparty = message.sender.clone();
        let action = identity_layer
            .respond_to_request(&counterparty, thread_id, &request)
            .await
            .context("Identity layer failed to respond to request")?;

        match action {
            IdentityResponseAction::Respond(response) => {
                let thread = state.store.get_mut_or_err(thread_id)?;
                thread.identity.sent_certificates =
                    response.certificates.clone();
                // The flag is set before the envelope leaves.
                thread.identity.response_sent = true;
                let envelope_out = Envelope::new(
                    self.next_id(),
                    EnvelopeKind::IdentityVerificationResponse,
                    thread_id.clone(),
                    self.now(),
                    &response,
                );
                self.send_envelope_to(
                    thread,
                    &counterparty,
                    &envelope_out,
                    events,
                )
                .await?;
                self.transition(
                    thread,
                    ThreadState::IdentityResponded,
                    "identity response sent",
                    events,
                )?;
                events.push(EngineEvent::IdentityResponded {
                    thread_id: thread_id.clone(),
                    direction: Direction::Outbound,
                });
            }
            IdentityResponseAction::Terminate(termination) => {
                self.send_termination(state, thread_id, termination, events)
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_identity_response(
        &self,
        state: &mut EngineState,
        message: &PeerMessage,
        envelope: &Envelope,
        events: &mut Vec<EngineEvent>,
    ) -> anyhow::Result<()> {
        let thread_id = &envelope.thread_id;
        let identity_layer =
            self.inner.identity_layer.clone().context(
                "Received identity response but no identity layer is \
                 configured",
            )?;
        let response: IdentityVerificationResponse = envelope.payload_as()?;

        {
            let thread = state.store.get_mut_or_err(thread_id)?;
            thread.identity.received_certificates =
                response.certificates.clone();
            self.transition(
                thread,
                ThreadState::IdentityResponded,
                "identity response received",
                events,
            )?;
        }
        events.push(EngineEvent::IdentityResponded {
            thread_id: thread_id.clone(),
            direction: Direction::Inbound,
        });

        let assessment = identity_layer
            .assess_received_certificate_sufficiency(
                &message.sender,
                &response,
                thread_id,
            )
            .await
            .context("Identity layer failed to assess certificates")?;

        match assessment {
            CertificateAssessment::Terminate(termination) => {
                self.send_termination(state, thread_id, termination, events)
                    .await?;
            }
            CertificateAssessment::Acknowledge => {
                let thread = state.store.get_mut_or_err(thread_id)?;
                thread.identity.acknowledgment_sent = true;
                thread.flags.has_identified = true;
                let ack = IdentityVerificationAcknowledgment::default();
                let envelope_out = Envelope::new(
                    self.next_id(),
                    EnvelopeKind::IdentityVerificationAcknowledgment,
                    thread_id.clone(),
                    self.now(),
                    &ack,
                );
                self.send_envelope_to(
                    thread,
                    &message.sender,
                    &envelope_out,
                    events,
                )
                .await?;
                self.transition(
                    thread,
                    ThreadState::IdentityAcknowledged,
                    "identity acknowledged",
                    events,
                )?;
                events.push(EngineEvent::IdentityAcknowledged {
                    thread_id: thread_id.clone(),
                    direction: Direction::Outbound,
                });
            }
        }
        Ok(())
    }

    fn apply_identity_acknowledgment(
        &self,
        state: &mut EngineState,
        envelope: &Envelope,
        events: &mut Vec<EngineEvent>,
    ) -> anyhow::Result<()> {
        let thread_id = &envelope.thread_id;
        let thread = state.store.get_mut_or_err(thread_id)?;
        thread.identity.acknowledgment_received = true;
        thread.flags.has_identified = true;
        self.transition(
            thread,
            ThreadState::IdentityAcknowledged,
            "identity acknowledgment received",
            events,
        )?;
        events.push(EngineEvent::IdentityAcknowledged {
            thread_id: thread_id.clone(),
            direction: Direction::Inbound,
        });
        Ok(())
    }

    fn apply_invoice(
        &self,
        state: &mut EngineState,
        envelope: &Envelope,
        events: &mut Vec<EngineEvent>,
    ) -> anyhow::Result<()> {
        let thread_id = &envelope.thread_id;
        let invoice: Invoice = envelope.payload_as()?;
        let thread = state.store.get_mut_or_err(thread_id)?;
        anyhow::ensure!(
            thread.invoice.is_none(),
            "Thread already has an invoice",
        );
        self.transition(
            thread,
            ThreadState::Invoiced,
            "invoice received",
            events,
        )?;
        thread.invoice = Some(invoice);
        thread.flags.has_invoiced = true;
        events.push(EngineEvent::InvoiceReceived {
            thread_id: thread_id.clone(),
        });
        Ok(())
    }

    async fn apply_settlement(
        &self,
        state: &mut EngineState,
        message: &PeerMessage,
        envelope: &Envelope,
        events: &mut Vec<EngineEvent>,
    ) -> anyhow::Result<()> {
        let thread_id = &envelope.thread_id;
        let settlement: Settlement = envelope.payload_as()?;

        let (my_role, has_identified, has_settlement, invoice) = {
            let thread = state.store.get_or_err(thread_id)?;
            (
                thread.my_role,
                thread.flags.has_identified,
                thread.settlement.is_some(),
                thread.invoice.clone(),
            )
        };

        // A maker configured to verify identity before settlement refuses
        // settlements from unidentified payers.
        let maker_phase =
            self.config().identity_options.maker_request_identity;
        if my_role == ThreadRole::Maker
            && maker_phase == IdentityRequestPhase::BeforeSettlement
            && !has_identified
        {
            self.send_termination(
                state,
                thread_id,
                Termination::new(
                    "identityRequired",
                    "Identity verification is required before settlement",
                ),
                events,
            )
            .await?;
            return Ok(());
        }

        anyhow::ensure!(!has_settlement, "Thread already has a settlement");

        {
            let thread = state.store.get_mut_or_err(thread_id)?;
            self.transition(
                thread,
                ThreadState::Settled,
                "settlement received",
                events,
            )?;
            thread.settlement = Some(settlement.clone());
            thread.flags.has_paid = true;
        }
        events.push(EngineEvent::SettlementReceived {
            thread_id: thread_id.clone(),
        });

        // Hand the artifact to the owning module.
        let Some(module) = self.module(&settlement.module_id) else {
            self.send_termination(
                state,
                thread_id,
                Termination::new(
                    "unknownModule",
                    format!(
                        "Unknown settlement module '{}'",
                        settlement.module_id,
                    ),
                ),
                events,
            )
            .await?;
            return Ok(());
        };
        if invoice.is_none() && !module.allow_unsolicited_settlements() {
            self.send_termination(
                state,
                thread_id,
                Termination::new(
                    "unsolicitedNotSupported",
                    "Unsolicited settlement not supported",
                ),
                events,
            )
            .await?;
            return Ok(());
        }

        let accept = AcceptSettlement {
            thread_id: thread_id.clone(),
            invoice: invoice.clone(),
            settlement: settlement.clone(),
            sender: message.sender.clone(),
        };
        let outcome = match module.accept_settlement(accept).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.send_termination(
                    state,
                    thread_id,
                    Termination::new(
                        "settlementRejected",
                        format!("Settlement processing failed: {err:#}"),
                    ),
                    events,
                )
                .await?;
                return Ok(());
            }
        };

        match outcome {
            AcceptOutcome::Terminate(termination) => {
                self.send_termination(state, thread_id, termination, events)
                    .await?;
            }
            AcceptOutcome::Accept { receipt_data } => {
                let config = self.config();
                if config.receipt_provided && config.auto_issue_receipt {
                    let payee = self.require_identity_key().await?;
                    let receipt = Receipt {
                        thread_id: thread_id.clone(),
                        module_id: settlement.module_id.clone(),
                        option_id: settlement.option_id.clone(),
                        payee,
                        payer: message.sender.clone(),
                        created_at: self.now(),
                        receipt_data: receipt_data
                            .unwrap_or(serde_json::Value::Null),
                    };
                    let thread = state.store.get_mut_or_err(thread_id)?;
                    thread.receipt = Some(receipt.clone());
                    thread.flags.has_receipted = true;
                    self.transition(
                        thread,
                        ThreadState::Receipted,
                        "receipt issued",
                        events,
                    )?;
                    let envelope_out = Envelope::new(
                        self.next_id(),
                        EnvelopeKind::Receipt,
                        thread_id.clone(),
                        receipt.created_at,
                        &receipt,
                    );
                    self.send_envelope_to(
                        thread,
                        &message.sender,
                        &envelope_out,
                        events,
                    )
                    .await?;
                    events.push(EngineEvent::ReceiptSent {
                        thread_id: thread_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn apply_receipt(
        &self,
        state: &mut EngineState,
        message: &PeerMessage,
        envelope: &Envelope,
        events: &mut Vec<EngineEvent>,
    ) -> anyhow::Result<()> {
        let thread_id = &envelope.thread_id;
        let receipt: Receipt = envelope.payload_as()?;

        let invoice = {
            let thread = state.store.get_mut_or_err(thread_id)?;
            anyhow::ensure!(
                thread.receipt.is_none(),
                "Thread already has a receipt",
            );
            // A receipt only makes sense once a settlement exists.
            anyhow::ensure!(
                thread.settlement.is_some(),
                "Receipt received before any settlement",
            );
            self.transition(
                thread,
                ThreadState::Receipted,
                "receipt received",
                events,
            )?;
            thread.receipt = Some(receipt.clone());
            thread.flags.has_receipted = true;
            thread.invoice.clone()
        };
        events.push(EngineEvent::ReceiptReceived {
            thread_id: thread_id.clone(),
        });

        // Payer-side hook.
        if let Some(module) = self.module(&receipt.module_id) {
            module
                .process_receipt(ProcessReceipt {
                    thread_id: thread_id.clone(),
                    invoice,
                    receipt_data: receipt.receipt_data.clone(),
                    sender: message.sender.clone(),
                })
                .await
                .context("Module failed to process receipt")?;
        } else {
            warn!(
                module_id = %receipt.module_id,
                "No module registered for received receipt",
            );
        }
        Ok(())
    }

    async fn apply_termination(
        &self,
        state: &mut EngineState,
        message: &PeerMessage,
        envelope: &Envelope,
        events: &mut Vec<EngineEvent>,
    ) -> anyhow::Result<()> {
        let thread_id = &envelope.thread_id;
        let termination: Termination = envelope.payload_as()?;

        let (settlement, invoice) = {
            let thread = state.store.get_mut_or_err(thread_id)?;
            anyhow::ensure!(
                thread.termination.is_none(),
                "Thread already has a termination",
            );
            thread.termination = Some(termination.clone());
            thread.flags.error = true;
            thread.last_error = Some(format!(
                "Received termination: {}",
                termination.message,
            ));
            self.transition(
                thread,
                ThreadState::Terminated,
                "termination received",
                events,
            )?;
            (thread.settlement.clone(), thread.invoice.clone())
        };
        events.push(EngineEvent::TerminationReceived {
            thread_id: thread_id.clone(),
        });

        // Give the module that built our settlement a chance to clean up.
        if let Some(settlement) = settlement {
            if let Some(module) = self.module(&settlement.module_id) {
                let process = ProcessTermination {
                    thread_id: thread_id.clone(),
                    invoice,
                    settlement: Some(settlement.clone()),
                    termination,
                    sender: message.sender.clone(),
                };
                if let Err(err) = module.process_termination(process).await {
                    // The thread is already terminated; log and move on.
                    warn!(
                        %thread_id,
                        "Module failed to process termination: {err:#}",
                    );
                }
            }
        }
        Ok(())
    }
}
