//! Identity exchange orchestration and role inference.

use common::envelope::{Envelope, EnvelopeKind};
use common::ids::ThreadId;
use common::thread::{Direction, ThreadRole, ThreadState};
use tracing::{debug, instrument};

use crate::config::{IdentityOptions, IdentityRequestPhase};
use crate::error::Error;
use crate::event::EngineEvent;
use crate::manager::RemittanceManager;

/// Which role initiates identity verification under the given options.
///
/// If exactly one side has a non-`never` phase, that side requests. If both
/// do and the phases differ, the `beforeInvoicing` side requests (it acts
/// first). Indistinguishable sides default the requester to taker.
pub(crate) fn requester_role(options: &IdentityOptions) -> ThreadRole {
    let maker = options.maker_request_identity;
    let taker = options.taker_request_identity;
    match (maker.is_never(), taker.is_never()) {
        (false, true) => ThreadRole::Maker,
        (true, false) => ThreadRole::Taker,
        _ => {
            if maker == IdentityRequestPhase::BeforeInvoicing
                && taker == IdentityRequestPhase::BeforeSettlement
            {
                ThreadRole::Maker
            } else {
                ThreadRole::Taker
            }
        }
    }
}

/// Infers our role for a thread first discovered via an inbound envelope.
pub(crate) fn infer_role(
    kind: &EnvelopeKind,
    options: &IdentityOptions,
) -> ThreadRole {
    match kind {
        // Someone billed us.
        EnvelopeKind::Invoice => ThreadRole::Taker,
        // Someone paid us.
        EnvelopeKind::Settlement => ThreadRole::Maker,
        // Receipts flow payee -> payer.
        EnvelopeKind::Receipt => ThreadRole::Taker,
        // Conservative default.
        EnvelopeKind::Termination | EnvelopeKind::Unknown(_) =>
            ThreadRole::Taker,
        // A response arrives at the requester; a request or acknowledgment
        // arrives at the responder.
        EnvelopeKind::IdentityVerificationResponse => requester_role(options),
        EnvelopeKind::IdentityVerificationRequest
        | EnvelopeKind::IdentityVerificationAcknowledgment =>
            requester_role(options).opposite(),
    }
}

impl RemittanceManager {
    /// Whether our runtime options call for requesting identity at `phase`
    /// in threads where we play `role`. Requesting without an identity
    /// layer configured is an immediate configuration error.
    pub(crate) fn should_request_identity(
        &self,
        role: ThreadRole,
        phase: IdentityRequestPhase,
    ) -> Result<bool, Error> {
        let configured = self.config().identity_options.phase_for(role);
        if configured != phase || phase.is_never() {
            return Ok(false);
        }
        if self.inner.identity_layer.is_none() {
            return Err(Error::config(
                "Identity verification is configured but no identity layer \
                 is available",
            ));
        }
        Ok(true)
    }

    /// Runs (or resumes) the identity exchange for a thread we initiated,
    /// then waits for the exchange to complete.
    ///
    /// Sends the `identityVerificationRequest` at most once; afterwards the
    /// wait resolves either through an inbound acknowledgment (live
    /// transports wake the waiter) or through the bounded `sync_threads`
    /// poll. Terminal states reject the wait.
    #[instrument(skip_all, name = "(ensure-identity)")]
    pub(crate) async fn ensure_identity_exchange(
        &self,
        thread_id: &ThreadId,
    ) -> Result<(), Error> {
        let identity_layer =
            self.inner.identity_layer.clone().ok_or_else(|| {
                Error::config(
                    "Identity exchange required but no identity layer is \
                     configured",
                )
            })?;

        // Fast path + request bookkeeping under one lock acquisition.
        let (counterparty, request_needed) = {
            let state = self.lock_state().await;
            let thread = state.store.get_or_err(thread_id)?;
            if thread.flags.has_identified {
                return Ok(());
            }
            if thread.is_terminal() {
                return Err(Error::terminal(format!(
                    "Thread {thread_id} is already in terminal state '{}'",
                    thread.state(),
                )));
            }
            (thread.counterparty.clone(), !thread.identity.request_sent)
        };

        if request_needed {
            let request = identity_layer
                .determine_certificates_to_request(&counterparty, thread_id)
                .await
                .map_err(|err| {
                    Error::transport(
                        "Identity layer failed to determine certificates to \
                         request",
                        err,
                    )
                })?;

            let mut events = Vec::new();
            {
                let mut state = self.lock_state().await;
                let thread = state.store.get_mut_or_err(thread_id)?;
                // Someone else may have raced us to it.
                if !thread.identity.request_sent {
                    let envelope = Envelope::new(
                        self.next_id(),
                        EnvelopeKind::IdentityVerificationRequest,
                        thread_id.clone(),
                        self.now(),
                        &request,
                    );
                    // The flag is set before the envelope leaves.
                    thread.identity.request_sent = true;
                    let send_result = self
                        .send_envelope_to(
                            thread,
                            &counterparty,
                            &envelope,
                            &mut events,
                        )
                        .await;
                    if let Err(err) = send_result {
                        thread.identity.request_sent = false;
                        return Err(err);
                    }
                    self.transition(
                        thread,
                        ThreadState::IdentityRequested,
                        "identity verification requested",
                        &mut events,
                    )
                    .map_err(|err| Error::Protocol(err.to_string()))?;
                    thread.updated_at = self.now();
                    events.push(EngineEvent::IdentityRequested {
                        thread_id: thread_id.clone(),
                        direction: Direction::Outbound,
                    });
                    self.persist(&state.store).await?;
                    state.notify(thread_id);
                } else {
                    debug!("Identity request already sent; skipping");
                }
            }
            self.emit_events(events);
        }

        self.wait_for_identified(thread_id).await
    }

    /// Waits (bounded by the configured identity timeout) for the thread to
    /// become identified.
    pub(crate) async fn wait_for_identified(
        &self,
        thread_id: &ThreadId,
    ) -> Result<(), Error> {
        let timeout = self.config().identity_timeout;
        let poll_interval = self.config().identity_poll_interval;
        self.wait_for_thread(thread_id, timeout, poll_interval, |thread| {
            thread.flags.has_identified.then_some(())
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn options(
        maker: IdentityRequestPhase,
        taker: IdentityRequestPhase,
    ) -> IdentityOptions {
        IdentityOptions {
            maker_request_identity: maker,
            taker_request_identity: taker,
        }
    }

    #[test]
    fn requester_inference() {
        use IdentityRequestPhase::*;

        // Exactly one non-never side requests.
        assert_eq!(
            requester_role(&options(BeforeInvoicing, Never)),
            ThreadRole::Maker,
        );
        assert_eq!(
            requester_role(&options(BeforeSettlement, Never)),
            ThreadRole::Maker,
        );
        assert_eq!(
            requester_role(&options(Never, BeforeSettlement)),
            ThreadRole::Taker,
        );

        // Both non-never, distinguishable by phase: beforeInvoicing wins.
        assert_eq!(
            requester_role(&options(BeforeInvoicing, BeforeSettlement)),
            ThreadRole::Maker,
        );
        assert_eq!(
            requester_role(&options(BeforeSettlement, BeforeInvoicing)),
            ThreadRole::Taker,
        );

        // Indistinguishable: default to taker.
        assert_eq!(requester_role(&options(Never, Never)), ThreadRole::Taker);
        assert_eq!(
            requester_role(&options(BeforeInvoicing, BeforeInvoicing)),
            ThreadRole::Taker,
        );
        assert_eq!(
            requester_role(&options(BeforeSettlement, BeforeSettlement)),
            ThreadRole::Taker,
        );
    }

    #[test]
    fn role_inference_by_kind() {
        let opts = options(
            IdentityRequestPhase::BeforeInvoicing,
            IdentityRequestPhase::Never,
        );

        assert_eq!(
            infer_role(&EnvelopeKind::Invoice, &opts),
            ThreadRole::Taker,
        );
        assert_eq!(
            infer_role(&EnvelopeKind::Settlement, &opts),
            ThreadRole::Maker,
        );
        assert_eq!(
            infer_role(&EnvelopeKind::Receipt, &opts),
            ThreadRole::Taker,
        );
        assert_eq!(
            infer_role(&EnvelopeKind::Termination, &opts),
            ThreadRole::Taker,
        );

        // Maker is the requester here, so a response lands on the maker and
        // a request (or ack) lands on the taker.
        assert_eq!(
            infer_role(&EnvelopeKind::IdentityVerificationResponse, &opts),
            ThreadRole::Maker,
        );
        assert_eq!(
            infer_role(&EnvelopeKind::IdentityVerificationRequest, &opts),
            ThreadRole::Taker,
        );
        assert_eq!(
            infer_role(
                &EnvelopeKind::IdentityVerificationAcknowledgment,
                &opts
            ),
            ThreadRole::Taker,
        );
    }
}
