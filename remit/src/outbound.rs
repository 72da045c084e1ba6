//! Outbound orchestration: composing and sending invoices, settlements,
//! and terminations, plus the shared envelope send path.

use std::collections::BTreeMap;

use common::amount::Amount;
use common::envelope::{
    Envelope, EnvelopeKind, Invoice, LineItem, Receipt, Settlement,
    Termination,
};
use common::ids::{IdentityKey, ModuleId, OptionId, ThreadId};
use common::thread::{Direction, ProtocolLogEntry, Thread, ThreadRole, ThreadState};
use tracing::{info, instrument, warn};

use crate::config::IdentityRequestPhase;
use crate::error::Error;
use crate::event::EngineEvent;
use crate::handle::{InvoiceHandle, ThreadHandle};
use crate::manager::{EngineState, RemittanceManager};
use crate::traits::{BuildSettlement, SettlementOutcome};

/// Caller inputs for [`RemittanceManager::send_invoice`]. Everything else on
/// the invoice (payee, payer, timestamps, expiry, module options) is filled
/// in by the engine.
#[derive(Clone, Debug)]
pub struct InvoiceInput {
    pub total: Amount,
    pub line_items: Vec<LineItem>,
    /// Defaults to the thread id.
    pub invoice_number: Option<String>,
}

impl InvoiceInput {
    pub fn new(total: Amount) -> Self {
        Self {
            total,
            line_items: Vec::new(),
            invoice_number: None,
        }
    }
}

/// Caller inputs for [`RemittanceManager::send_unsolicited_settlement`].
#[derive(Clone, Debug)]
pub struct UnsolicitedSettlement {
    pub module_id: ModuleId,
    /// Module-defined option terms, agreed out of band.
    pub option: serde_json::Value,
    /// Defaults to the module id.
    pub option_id: Option<OptionId>,
    pub note: Option<String>,
}

/// What [`RemittanceManager::pay`] resolved to.
#[derive(Clone, Debug)]
pub enum PayOutcome {
    /// The settlement was sent and no receipt is expected
    /// (`receipt_provided` is off).
    Settled,
    /// The payee receipted our settlement.
    Receipt(Receipt),
    /// The exchange was terminated, by us (module refusal) or by the payee.
    Terminated(Termination),
}

impl RemittanceManager {
    // --- The shared envelope send path --- //

    /// Sends an envelope to `recipient`, preferring the live transport when
    /// the comms layer has one and falling back to store-and-forward.
    /// Appends to the thread's protocol log and queues the `EnvelopeSent`
    /// event; returns the transport message id.
    pub(crate) async fn send_envelope_to(
        &self,
        thread: &mut Thread,
        recipient: &IdentityKey,
        envelope: &Envelope,
        events: &mut Vec<EngineEvent>,
    ) -> Result<String, Error> {
        let body = envelope.serialize();
        let message_box = &self.inner.config.message_box;
        let comms = &self.inner.comms;

        let transport_message_id = if comms.supports_live_messages() {
            match comms
                .send_live_message(recipient, message_box, &body, None)
                .await
            {
                Ok(message_id) => message_id,
                Err(err) => {
                    warn!(
                        "Live send failed; falling back to store-and-forward: \
                         {err:#}",
                    );
                    comms
                        .send_message(recipient, message_box, &body, None)
                        .await
                        .map_err(|err| self.send_error(envelope, recipient, err))?
                }
            }
        } else {
            comms
                .send_message(recipient, message_box, &body, None)
                .await
                .map_err(|err| self.send_error(envelope, recipient, err))?
        };

        thread.protocol_log.push(ProtocolLogEntry {
            direction: Direction::Outbound,
            envelope: envelope.clone(),
            transport_message_id: transport_message_id.clone(),
        });
        events.push(EngineEvent::EnvelopeSent {
            thread_id: thread.thread_id.clone(),
            kind: envelope.kind.clone(),
            transport_message_id: transport_message_id.clone(),
        });
        Ok(transport_message_id)
    }

    fn send_error(
        &self,
        envelope: &Envelope,
        recipient: &IdentityKey,
        err: anyhow::Error,
    ) -> Error {
        Error::transport(
            format!(
                "Failed to send '{}' envelope for thread {} to {recipient} \
                 (message box '{}')",
                envelope.kind, envelope.thread_id, self.inner.config.message_box,
            ),
            err,
        )
    }

    /// Terminates a thread from our side: stores the termination, records
    /// `last_error`, flips the error flag, transitions to `terminated`, and
    /// sends the termination envelope (best effort; the local state is
    /// already settled either way). The caller persists and notifies.
    pub(crate) async fn send_termination(
        &self,
        state: &mut EngineState,
        thread_id: &ThreadId,
        termination: Termination,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(), Error> {
        let thread = state.store.get_mut_or_err(thread_id)?;
        if thread.is_terminal() {
            warn!(
                %thread_id,
                "Not sending termination: thread is already terminal",
            );
            return Ok(());
        }

        let counterparty = thread.counterparty.clone();
        thread.termination = Some(termination.clone());
        thread.flags.error = true;
        thread.last_error =
            Some(format!("Sent termination: {}", termination.message));
        self.transition(
            thread,
            ThreadState::Terminated,
            "termination sent",
            events,
        )
        .map_err(|err| Error::Protocol(err.to_string()))?;
        thread.updated_at = self.now();

        let envelope = Envelope::new(
            self.next_id(),
            EnvelopeKind::Termination,
            thread_id.clone(),
            self.now(),
            &termination,
        );
        if let Err(err) = self
            .send_envelope_to(thread, &counterparty, &envelope, events)
            .await
        {
            warn!(%thread_id, "Failed to send termination envelope: {err:#}");
        }
        events.push(EngineEvent::TerminationSent {
            thread_id: thread_id.clone(),
        });
        Ok(())
    }

    // --- sendInvoice --- //

    /// Issues an invoice to `counterparty` on a brand-new thread (we are
    /// maker), running the identity exchange first when configured. Returns
    /// a handle referencing the new thread.
    #[instrument(skip_all, name = "(send-invoice)")]
    pub async fn send_invoice(
        &self,
        counterparty: IdentityKey,
        input: InvoiceInput,
    ) -> Result<InvoiceHandle, Error> {
        let payee = self.require_identity_key().await?;
        let thread_id = ThreadId::from(self.next_id());
        info!(%thread_id, %counterparty, "Sending invoice on new thread");

        let mut events = Vec::new();
        {
            let mut state = self.lock_state().await;
            self.create_thread(
                &mut state,
                thread_id.clone(),
                counterparty,
                ThreadRole::Maker,
                &mut events,
            )?;
            self.persist(&state.store).await?;
        }
        self.emit_events(events);

        if self.should_request_identity(
            ThreadRole::Maker,
            IdentityRequestPhase::BeforeInvoicing,
        )? {
            self.ensure_identity_exchange(&thread_id).await?;
        }

        self.compose_and_send_invoice(&thread_id, input, payee).await
    }

    /// Issues an invoice on an existing thread. We must be maker, the
    /// thread must not have an invoice yet, and it must not be errored.
    #[instrument(skip_all, name = "(send-invoice-for-thread)")]
    pub async fn send_invoice_for_thread(
        &self,
        thread_id: &ThreadId,
        input: InvoiceInput,
    ) -> Result<InvoiceHandle, Error> {
        let payee = self.require_identity_key().await?;
        let awaiting_ack = {
            let state = self.lock_state().await;
            let thread = state.store.get_or_err(thread_id)?;
            self.check_invoiceable(thread)?;
            thread.identity.response_sent && !thread.flags.has_identified
        };

        if self.should_request_identity(
            ThreadRole::Maker,
            IdentityRequestPhase::BeforeInvoicing,
        )? {
            self.ensure_identity_exchange(thread_id).await?;
        } else if awaiting_ack {
            // We answered the counterparty's identity request; give their
            // acknowledgment a chance to land before invoicing.
            self.wait_for_identified(thread_id).await?;
        }

        self.compose_and_send_invoice(thread_id, input, payee).await
    }

    fn check_invoiceable(&self, thread: &Thread) -> Result<(), Error> {
        let thread_id = &thread.thread_id;
        if thread.my_role != ThreadRole::Maker {
            return Err(Error::precondition(format!(
                "Cannot invoice on thread {thread_id}: we are not the maker",
            )));
        }
        if thread.invoice.is_some() {
            return Err(Error::precondition(format!(
                "Thread {thread_id} already has an invoice",
            )));
        }
        if thread.is_terminal() {
            return Err(Error::precondition(format!(
                "Thread {thread_id} is in terminal state '{}'",
                thread.state(),
            )));
        }
        Ok(())
    }

    /// Composes the invoice (expiry, invoice number, module options), sends
    /// it, and commits the `invoiced` step.
    async fn compose_and_send_invoice(
        &self,
        thread_id: &ThreadId,
        input: InvoiceInput,
        payee: IdentityKey,
    ) -> Result<InvoiceHandle, Error> {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state().await;
            let thread = state.store.get_or_err(thread_id)?;
            self.check_invoiceable(thread)?;
            let counterparty = thread.counterparty.clone();

            let now = self.now();
            let expiry_seconds = self.config().invoice_expiry_seconds;
            let expires_at = (expiry_seconds >= 0)
                .then(|| now.saturating_add_secs(expiry_seconds));
            let mut invoice = Invoice {
                payee,
                payer: counterparty.clone(),
                line_items: input.line_items,
                total: input.total,
                invoice_number: input
                    .invoice_number
                    .unwrap_or_else(|| thread_id.to_string()),
                created_at: now,
                expires_at,
                options: BTreeMap::new(),
            };

            // Offer terms from every module that declares some.
            for (module_id, module) in &self.inner.modules {
                match module.create_option(thread_id, &invoice).await {
                    Ok(Some(terms)) => {
                        invoice.options.insert(module_id.clone(), terms);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(
                        %module_id,
                        "Module failed to create an invoice option: {err:#}",
                    ),
                }
            }

            let thread = state.store.get_mut_or_err(thread_id)?;
            // The flag is set before the envelope leaves.
            thread.invoice = Some(invoice.clone());
            thread.flags.has_invoiced = true;
            let envelope = Envelope::new(
                self.next_id(),
                EnvelopeKind::Invoice,
                thread_id.clone(),
                now,
                &invoice,
            );
            let send_result = self
                .send_envelope_to(thread, &counterparty, &envelope, &mut events)
                .await;
            if let Err(err) = send_result {
                thread.invoice = None;
                thread.flags.has_invoiced = false;
                return Err(err);
            }
            self.transition(
                thread,
                ThreadState::Invoiced,
                "invoice sent",
                &mut events,
            )
            .map_err(|err| Error::Protocol(err.to_string()))?;
            thread.updated_at = self.now();
            thread.debug_assert_invariants();
            events.push(EngineEvent::InvoiceSent {
                thread_id: thread_id.clone(),
            });

            self.persist(&state.store).await?;
            state.notify(thread_id);
        }
        self.emit_events(events);
        info!(%thread_id, "Invoice sent");
        Ok(InvoiceHandle::new(self.clone(), thread_id.clone()))
    }

    // --- pay --- //

    /// Settles the invoice on `thread_id` (we are taker).
    ///
    /// The settlement option is chosen as: the `option_id` argument, else
    /// the configured default payment option, else the invoice's first
    /// option. Unless `receipt_provided` is off, waits (bounded) for the
    /// payee's receipt or termination and returns whichever arrives first.
    #[instrument(skip_all, name = "(pay)")]
    pub async fn pay(
        &self,
        thread_id: &ThreadId,
        option_id: Option<OptionId>,
    ) -> Result<PayOutcome, Error> {
        let payer = self.require_identity_key().await?;
        let (invoice, awaiting_ack) = {
            let state = self.lock_state().await;
            let thread = state.store.get_or_err(thread_id)?;
            self.check_payable(thread)?;
            let invoice = thread.invoice.clone().ok_or_else(|| {
                Error::precondition(format!(
                    "Thread {thread_id} has no invoice to pay",
                ))
            })?;
            let awaiting_ack = thread.identity.response_sent
                && !thread.flags.has_identified;
            (invoice, awaiting_ack)
        };

        if self.should_request_identity(
            ThreadRole::Taker,
            IdentityRequestPhase::BeforeSettlement,
        )? {
            self.ensure_identity_exchange(thread_id).await?;
        } else if awaiting_ack {
            self.wait_for_identified(thread_id).await?;
        }

        if invoice.is_expired(self.now()) {
            return Err(Error::Expired(format!(
                "Invoice {} on thread {thread_id} expired at {}",
                invoice.invoice_number,
                invoice
                    .expires_at
                    .map(|t| t.as_i64().to_string())
                    .unwrap_or_default(),
            )));
        }

        // Choose the settlement option and resolve its module.
        let option_id = match option_id {
            Some(option_id) => option_id,
            None => {
                let default = self
                    .lock_state()
                    .await
                    .store
                    .default_payment_option_id()
                    .cloned();
                match default {
                    Some(option_id) => option_id,
                    None => invoice
                        .options
                        .keys()
                        .next()
                        .map(OptionId::from)
                        .ok_or_else(|| {
                            Error::config(format!(
                                "Invoice on thread {thread_id} offers no \
                                 settlement options",
                            ))
                        })?,
                }
            }
        };
        let module_id = ModuleId::from(&option_id);
        let option =
            invoice.options.get(&module_id).cloned().ok_or_else(|| {
                Error::config(format!(
                    "Invoice on thread {thread_id} has no option \
                     '{option_id}'",
                ))
            })?;
        let module = self.module(&module_id).ok_or_else(|| {
            Error::config(format!(
                "No module registered for option '{option_id}'",
            ))
        })?;

        let build = BuildSettlement {
            thread_id: thread_id.clone(),
            invoice: Some(invoice.clone()),
            option,
            note: None,
        };
        let outcome = match module.build_settlement(build).await {
            Ok(outcome) => outcome,
            // A module failure is handled like a module refusal: the
            // counterparty learns the exchange is off either way.
            Err(err) => SettlementOutcome::Terminate(Termination::new(
                "moduleError",
                format!("Settlement build failed: {err:#}"),
            )),
        };

        let artifact = match outcome {
            SettlementOutcome::Terminate(termination) => {
                let mut events = Vec::new();
                {
                    let mut state = self.lock_state().await;
                    self.send_termination(
                        &mut state,
                        thread_id,
                        termination.clone(),
                        &mut events,
                    )
                    .await?;
                    self.persist(&state.store).await?;
                    state.notify(thread_id);
                }
                self.emit_events(events);
                return Ok(PayOutcome::Terminated(termination));
            }
            SettlementOutcome::Settle { artifact } => artifact,
        };

        let settlement = Settlement {
            thread_id: thread_id.clone(),
            module_id: module.id(),
            option_id,
            sender: payer,
            created_at: self.now(),
            artifact,
            note: None,
        };
        self.commit_and_send_settlement(thread_id, &invoice.payee, settlement)
            .await?;

        if !self.config().receipt_provided {
            return Ok(PayOutcome::Settled);
        }

        // Wait for the payee's answer: receipt or termination, whichever
        // lands first.
        let timeout = self.config().receipt_timeout;
        let poll_interval = self.config().receipt_poll_interval;
        self.wait_for_thread(thread_id, timeout, poll_interval, |thread| {
            if let Some(receipt) = &thread.receipt {
                return Some(PayOutcome::Receipt(receipt.clone()));
            }
            thread
                .termination
                .as_ref()
                .map(|termination| PayOutcome::Terminated(termination.clone()))
        })
        .await
    }

    fn check_payable(&self, thread: &Thread) -> Result<(), Error> {
        let thread_id = &thread.thread_id;
        if thread.my_role != ThreadRole::Taker {
            return Err(Error::precondition(format!(
                "Cannot pay on thread {thread_id}: we are not the taker",
            )));
        }
        if thread.is_terminal() {
            return Err(Error::precondition(format!(
                "Thread {thread_id} is in terminal state '{}'",
                thread.state(),
            )));
        }
        if thread.settlement.is_some() {
            return Err(Error::precondition(format!(
                "Thread {thread_id} already has a settlement",
            )));
        }
        Ok(())
    }

    /// Stores the settlement, sends its envelope, and commits the `settled`
    /// step. Rolls the store back if the transport rejects the send.
    async fn commit_and_send_settlement(
        &self,
        thread_id: &ThreadId,
        recipient: &IdentityKey,
        settlement: Settlement,
    ) -> Result<(), Error> {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state().await;
            let thread = state.store.get_mut_or_err(thread_id)?;
            if thread.settlement.is_some() {
                return Err(Error::precondition(format!(
                    "Thread {thread_id} already has a settlement",
                )));
            }
            if thread.is_terminal() {
                return Err(Error::terminal(format!(
                    "Thread {thread_id} reached terminal state '{}' before \
                     the settlement could be sent",
                    thread.state(),
                )));
            }

            thread.settlement = Some(settlement.clone());
            thread.flags.has_paid = true;
            let envelope = Envelope::new(
                self.next_id(),
                EnvelopeKind::Settlement,
                thread_id.clone(),
                settlement.created_at,
                &settlement,
            );
            let send_result = self
                .send_envelope_to(thread, recipient, &envelope, &mut events)
                .await;
            if let Err(err) = send_result {
                thread.settlement = None;
                thread.flags.has_paid = false;
                return Err(err);
            }
            self.transition(
                thread,
                ThreadState::Settled,
                "settlement sent",
                &mut events,
            )
            .map_err(|err| Error::Protocol(err.to_string()))?;
            thread.updated_at = self.now();
            thread.debug_assert_invariants();
            events.push(EngineEvent::SettlementSent {
                thread_id: thread_id.clone(),
            });

            self.persist(&state.store).await?;
            state.notify(thread_id);
        }
        self.emit_events(events);
        info!(%thread_id, "Settlement sent");
        Ok(())
    }

    // --- sendUnsolicitedSettlement --- //

    /// Pays `counterparty` without an invoice, on a brand-new thread (we
    /// are taker). The module must allow unsolicited settlements.
    #[instrument(skip_all, name = "(send-unsolicited-settlement)")]
    pub async fn send_unsolicited_settlement(
        &self,
        counterparty: IdentityKey,
        input: UnsolicitedSettlement,
    ) -> Result<ThreadHandle, Error> {
        let payer = self.require_identity_key().await?;
        let module = self.module(&input.module_id).ok_or_else(|| {
            Error::config(format!(
                "No module registered with id '{}'",
                input.module_id,
            ))
        })?;
        if !module.allow_unsolicited_settlements() {
            return Err(Error::precondition(format!(
                "Module '{}' does not allow unsolicited settlements",
                input.module_id,
            )));
        }

        let thread_id = ThreadId::from(self.next_id());
        info!(%thread_id, %counterparty, "Sending unsolicited settlement");
        let mut events = Vec::new();
        {
            let mut state = self.lock_state().await;
            self.create_thread(
                &mut state,
                thread_id.clone(),
                counterparty.clone(),
                ThreadRole::Taker,
                &mut events,
            )?;
            self.persist(&state.store).await?;
        }
        self.emit_events(events);

        // There is no invoicing in this flow, so either configured phase
        // precedes the settlement.
        let taker_phase = self.config().identity_options.taker_request_identity;
        if !taker_phase.is_never() {
            if self.inner.identity_layer.is_none() {
                return Err(Error::config(
                    "Identity verification is configured but no identity \
                     layer is available",
                ));
            }
            self.ensure_identity_exchange(&thread_id).await?;
        }

        let build = BuildSettlement {
            thread_id: thread_id.clone(),
            invoice: None,
            option: input.option,
            note: input.note.clone(),
        };
        let outcome = match module.build_settlement(build).await {
            Ok(outcome) => outcome,
            Err(err) => SettlementOutcome::Terminate(Termination::new(
                "moduleError",
                format!("Settlement build failed: {err:#}"),
            )),
        };

        match outcome {
            SettlementOutcome::Terminate(termination) => {
                let mut events = Vec::new();
                {
                    let mut state = self.lock_state().await;
                    self.send_termination(
                        &mut state,
                        &thread_id,
                        termination,
                        &mut events,
                    )
                    .await?;
                    self.persist(&state.store).await?;
                    state.notify(&thread_id);
                }
                self.emit_events(events);
            }
            SettlementOutcome::Settle { artifact } => {
                let settlement = Settlement {
                    thread_id: thread_id.clone(),
                    module_id: module.id(),
                    option_id: input
                        .option_id
                        .unwrap_or_else(|| OptionId::from(&input.module_id)),
                    sender: payer,
                    created_at: self.now(),
                    artifact,
                    note: input.note,
                };
                self.commit_and_send_settlement(
                    &thread_id,
                    &counterparty,
                    settlement,
                )
                .await?;
            }
        }

        Ok(ThreadHandle::new(self.clone(), thread_id))
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;
    use std::sync::atomic::Ordering;

    use common::thread::ThreadState;

    use super::*;
    use crate::config::IdentityRequestPhase;
    use crate::test_support::{
        pump, BuildBehavior, InMemoryBus, PeerBuilder, TestIdentityLayer,
        TestModule,
    };

    fn invoice_input() -> InvoiceInput {
        let mut input =
            InvoiceInput::new(Amount::from_str("1000 bsv:sat").unwrap());
        input.invoice_number = Some("INV-1".to_owned());
        input
    }

    #[tokio::test]
    async fn s1_happy_path() {
        logger::init_for_testing();
        let bus = InMemoryBus::new();
        let maker_module = TestModule::new("M");
        let taker_module = TestModule::new("M");
        let maker = PeerBuilder::new("maker")
            .module(maker_module.clone())
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(taker_module.clone())
            .build(&bus)
            .await;

        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();

        taker.sync().await;

        // `pay` blocks on the receipt, so keep the maker draining its box
        // in the background.
        let _maker_pump = pump(&maker);
        let outcome = taker
            .manager
            .pay(&thread_id, Some(OptionId::from("M")))
            .await
            .unwrap();
        let receipt = match outcome {
            PayOutcome::Receipt(receipt) => receipt,
            other => panic!("Expected a receipt, got {other:?}"),
        };
        assert_eq!(receipt.payee, maker.key);
        assert_eq!(receipt.payer, taker.key);

        let maker_thread =
            maker.manager.get_thread(&thread_id).await.unwrap();
        let taker_thread =
            taker.manager.get_thread(&thread_id).await.unwrap();
        assert_eq!(maker_thread.state(), ThreadState::Receipted);
        assert_eq!(taker_thread.state(), ThreadState::Receipted);
        assert!(maker_thread.receipt.is_some());
        assert!(taker_thread.receipt.is_some());

        // The invoice carried the caller's inputs.
        let invoice = maker_thread.invoice.as_ref().unwrap();
        assert_eq!(invoice.invoice_number, "INV-1");
        assert_eq!(invoice.total.to_string(), "1000 bsv:sat");
        assert_eq!(invoice.payee, maker.key);
        assert_eq!(invoice.payer, taker.key);

        // The payer-side hook ran exactly once, on the payer's module.
        assert_eq!(taker_module.receipts_processed.load(Ordering::SeqCst), 1);
        assert_eq!(maker_module.receipts_processed.load(Ordering::SeqCst), 0);

        // State/flags consistency on both sides.
        assert_eq!(maker_thread.state(), maker_thread.derived_state());
        assert_eq!(taker_thread.state(), taker_thread.derived_state());
        assert!(taker_thread.flags.has_invoiced);
        assert!(taker_thread.flags.has_paid);
        assert!(taker_thread.flags.has_receipted);
        assert!(!taker_thread.flags.error);
    }

    #[tokio::test]
    async fn s2_unsolicited_settlement_allowed() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new_unsolicited("U"))
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new_unsolicited("U"))
            .build(&bus)
            .await;

        let handle = taker
            .manager
            .send_unsolicited_settlement(
                maker.key.clone(),
                UnsolicitedSettlement {
                    module_id: ModuleId::from("U"),
                    option: serde_json::json!({ "note": "hello" }),
                    option_id: None,
                    note: None,
                },
            )
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();

        maker.sync().await;
        taker.sync().await;

        let maker_thread =
            maker.manager.get_thread(&thread_id).await.unwrap();
        assert_eq!(maker_thread.my_role, ThreadRole::Maker);
        assert!(maker_thread.invoice.is_none());
        assert!(maker_thread.settlement.is_some());
        // Auto-receipt is on by default.
        assert_eq!(maker_thread.state(), ThreadState::Receipted);

        let taker_thread =
            taker.manager.get_thread(&thread_id).await.unwrap();
        assert_eq!(taker_thread.state(), ThreadState::Receipted);
        assert_eq!(
            taker_thread.settlement.as_ref().unwrap().option_id,
            OptionId::from("U"),
        );
    }

    #[tokio::test]
    async fn s2_unsolicited_settlement_without_auto_receipt() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new_unsolicited("U"))
            .config(|config| config.auto_issue_receipt = false)
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new_unsolicited("U"))
            .build(&bus)
            .await;

        let handle = taker
            .manager
            .send_unsolicited_settlement(
                maker.key.clone(),
                UnsolicitedSettlement {
                    module_id: ModuleId::from("U"),
                    option: serde_json::json!({ "note": "hello" }),
                    option_id: None,
                    note: Some("thanks".to_owned()),
                },
            )
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();

        maker.sync().await;

        let maker_thread =
            maker.manager.get_thread(&thread_id).await.unwrap();
        assert_eq!(maker_thread.state(), ThreadState::Settled);
        assert!(maker_thread.receipt.is_none());
        assert_eq!(
            maker_thread.settlement.as_ref().unwrap().note.as_deref(),
            Some("thanks"),
        );
    }

    #[tokio::test]
    async fn s4_identity_before_invoicing() {
        let bus = InMemoryBus::new();
        let maker_key = IdentityKey::from("k-maker");
        let taker_key = IdentityKey::from("k-taker");
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .identity_layer(TestIdentityLayer::new(&maker_key))
            .config(|config| {
                config.identity_options.maker_request_identity =
                    IdentityRequestPhase::BeforeInvoicing;
            })
            .build(&bus)
            .await;
        // Both peers run the same protocol options, so the taker can infer
        // that an inbound identity request makes it the responder.
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new("M"))
            .identity_layer(TestIdentityLayer::new(&taker_key))
            .config(|config| {
                config.identity_options.maker_request_identity =
                    IdentityRequestPhase::BeforeInvoicing;
            })
            .build(&bus)
            .await;

        // The taker must answer the identity request while the maker is
        // blocked inside `send_invoice`.
        let taker_pump = pump(&taker);
        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();
        // Let the taker drain the acknowledgment + invoice, then stop it.
        taker
            .manager
            .wait_for_state(
                &thread_id,
                ThreadState::Invoiced,
                std::time::Duration::from_secs(3),
            )
            .await
            .unwrap();
        drop(taker_pump);

        // The full exchange ran in order before the invoice went out.
        use common::envelope::EnvelopeKind::*;
        assert_eq!(
            bus.sent_kinds(),
            vec![
                IdentityVerificationRequest,
                IdentityVerificationResponse,
                IdentityVerificationAcknowledgment,
                Invoice,
            ],
        );

        let maker_thread =
            maker.manager.get_thread(&thread_id).await.unwrap();
        let taker_thread =
            taker.manager.get_thread(&thread_id).await.unwrap();
        assert_eq!(maker_thread.my_role, ThreadRole::Maker);
        assert_eq!(taker_thread.my_role, ThreadRole::Taker);
        assert_eq!(maker_thread.state(), ThreadState::Invoiced);
        assert!(maker_thread.flags.has_identified);
        assert!(taker_thread.flags.has_identified);
        // Requester side acked; responder side received the ack.
        assert!(maker_thread.identity.acknowledgment_sent);
        assert!(taker_thread.identity.acknowledgment_received);
        assert!(!taker_thread.identity.received_certificates.is_empty()
            || !taker_thread.identity.sent_certificates.is_empty());
    }

    #[tokio::test]
    async fn identity_before_settlement_runs_mid_pay() {
        let bus = InMemoryBus::new();
        let maker_key = IdentityKey::from("k-maker");
        let taker_key = IdentityKey::from("k-taker");
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .identity_layer(TestIdentityLayer::new(&maker_key))
            .config(|config| {
                config.identity_options.taker_request_identity =
                    IdentityRequestPhase::BeforeSettlement;
            })
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new("M"))
            .identity_layer(TestIdentityLayer::new(&taker_key))
            .config(|config| {
                config.identity_options.taker_request_identity =
                    IdentityRequestPhase::BeforeSettlement;
            })
            .build(&bus)
            .await;

        // No identity exchange before invoicing.
        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();
        taker.sync().await;

        // The exchange runs inside `pay`, on an already-invoiced thread.
        let _maker_pump = pump(&maker);
        let outcome = taker.manager.pay(&thread_id, None).await.unwrap();
        assert!(matches!(outcome, PayOutcome::Receipt(_)));

        use common::envelope::EnvelopeKind::*;
        assert_eq!(
            bus.sent_kinds(),
            vec![
                Invoice,
                IdentityVerificationRequest,
                IdentityVerificationResponse,
                IdentityVerificationAcknowledgment,
                Settlement,
                Receipt,
            ],
        );

        let taker_thread =
            taker.manager.get_thread(&thread_id).await.unwrap();
        assert!(taker_thread.flags.has_identified);
        assert!(taker_thread.identity.request_sent);
        assert!(taker_thread.identity.acknowledgment_sent);
        // The identity exchange never regressed the thread's state.
        assert_eq!(taker_thread.state(), ThreadState::Receipted);
        assert!(taker_thread
            .state_log
            .iter()
            .all(|entry| !entry.to.as_str().starts_with("identity")));
    }

    #[tokio::test]
    async fn s5_module_refuses_to_build() {
        let bus = InMemoryBus::new();
        let maker_module = TestModule::new("M");
        let taker_module = TestModule::new("M");
        taker_module.set_build(BuildBehavior::Terminate(Termination::new(
            "rejected", "No thanks",
        )));
        let maker = PeerBuilder::new("maker")
            .module(maker_module)
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(taker_module)
            .build(&bus)
            .await;

        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();
        taker.sync().await;

        let outcome = taker.manager.pay(&thread_id, None).await.unwrap();
        match outcome {
            PayOutcome::Terminated(termination) => {
                assert_eq!(termination.code, "rejected");
                assert_eq!(termination.message, "No thanks");
            }
            other => panic!("Expected termination, got {other:?}"),
        }

        let taker_thread =
            taker.manager.get_thread(&thread_id).await.unwrap();
        assert_eq!(taker_thread.state(), ThreadState::Terminated);
        assert!(taker_thread
            .last_error
            .as_ref()
            .unwrap()
            .starts_with("Sent termination: No thanks"));
        assert!(taker_thread.settlement.is_none());

        // The maker learns about it on its next sync.
        maker.sync().await;
        let maker_thread =
            maker.manager.get_thread(&thread_id).await.unwrap();
        assert_eq!(maker_thread.state(), ThreadState::Terminated);
        assert!(maker_thread
            .last_error
            .as_ref()
            .unwrap()
            .contains("No thanks"));
    }

    #[tokio::test]
    async fn pay_rejects_expired_invoice() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .config(|config| config.invoice_expiry_seconds = 60)
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;

        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();
        taker.sync().await;

        let invoice = taker
            .manager
            .get_thread(&thread_id)
            .await
            .unwrap()
            .invoice
            .unwrap();
        assert!(invoice.expires_at.is_some());

        // Two minutes pass; the 60s invoice is now stale.
        taker.clock.advance_ms(120_000);
        let err = taker.manager.pay(&thread_id, None).await.unwrap_err();
        assert!(matches!(err, Error::Expired(_)));

        // Nothing was sent or stored.
        let taker_thread =
            taker.manager.get_thread(&thread_id).await.unwrap();
        assert!(taker_thread.settlement.is_none());
        assert_eq!(taker_thread.state(), ThreadState::Invoiced);
    }

    #[tokio::test]
    async fn pay_without_receipt_support_returns_after_send() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .config(|config| config.receipt_provided = false)
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new("M"))
            .config(|config| config.receipt_provided = false)
            .build(&bus)
            .await;

        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();
        taker.sync().await;

        // No pump needed: pay must not wait for anything.
        let outcome = taker.manager.pay(&thread_id, None).await.unwrap();
        assert!(matches!(outcome, PayOutcome::Settled));

        maker.sync().await;
        let maker_thread =
            maker.manager.get_thread(&thread_id).await.unwrap();
        assert_eq!(maker_thread.state(), ThreadState::Settled);
        assert!(maker_thread.receipt.is_none());
    }

    #[tokio::test]
    async fn pay_preconditions() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new("M"))
            .config(|config| config.receipt_provided = false)
            .build(&bus)
            .await;

        // Unknown thread.
        let err = taker
            .manager
            .pay(&ThreadId::from("nope"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();

        // The maker cannot pay its own invoice.
        let err = maker.manager.pay(&thread_id, None).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        taker.sync().await;

        // Unknown option id.
        let err = taker
            .manager
            .pay(&thread_id, Some(OptionId::from("X")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // Paying twice is rejected.
        taker.manager.pay(&thread_id, None).await.unwrap();
        let err = taker.manager.pay(&thread_id, None).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn invoice_without_options_cannot_be_paid() {
        let bus = InMemoryBus::new();
        // The maker's module declares no option terms.
        let silent_module = TestModule::new("M");
        let maker = {
            let mut module = silent_module;
            std::sync::Arc::get_mut(&mut module).unwrap().option_terms = None;
            PeerBuilder::new("maker").module(module).build(&bus).await
        };
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;

        let handle = maker
            .manager
            .send_invoice(taker.key.clone(), invoice_input())
            .await
            .unwrap();
        let thread_id = handle.thread_id().clone();
        taker.sync().await;

        let invoice = taker
            .manager
            .get_thread(&thread_id)
            .await
            .unwrap()
            .invoice
            .unwrap();
        assert!(invoice.options.is_empty());

        let err = taker.manager.pay(&thread_id, None).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn send_invoice_requires_wallet_key() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .without_wallet_key()
            .build(&bus)
            .await;

        let err = maker
            .manager
            .send_invoice(IdentityKey::from("k-taker"), invoice_input())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn failed_send_rolls_the_invoice_back() {
        let bus = InMemoryBus::new();
        let maker = PeerBuilder::new("maker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;

        maker.comms.fail_sends.store(true, Ordering::SeqCst);
        let err = maker
            .manager
            .send_invoice(IdentityKey::from("k-taker"), invoice_input())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));

        // The thread exists (creation persisted first) but carries no
        // half-sent invoice.
        let threads = maker.manager.receivable_invoices().await;
        assert!(threads.is_empty());
    }

    #[tokio::test]
    async fn unsolicited_settlement_requires_module_support() {
        let bus = InMemoryBus::new();
        let taker = PeerBuilder::new("taker")
            .module(TestModule::new("M"))
            .build(&bus)
            .await;

        let err = taker
            .manager
            .send_unsolicited_settlement(
                IdentityKey::from("k-maker"),
                UnsolicitedSettlement {
                    module_id: ModuleId::from("M"),
                    option: serde_json::json!({}),
                    option_id: None,
                    note: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
