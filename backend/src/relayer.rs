//! Background job: carries open decryption requests to the decryption service and
//! commits whatever comes back.
//!
//! The ledger is never locked while the service works, so a slow or dead service only
//! delays its own requests.

use crate::capability::DecryptionService;
use crate::decryption::CommitOutcome;
use crate::errors::{ApiError, MarketError};
use crate::models::{Principal, TxContext};
use crate::state::AppState;
use tracing::{info, warn};

pub const RELAYER_PRINCIPAL: &str = "relayer";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub committed: usize,
    pub already_proven: usize,
    pub rejected: usize,
    pub unavailable: usize,
}

/// Poll forever at the configured interval.
pub async fn run<S: DecryptionService>(state: AppState, service: S) {
    let mut interval = tokio::time::interval(state.config.relayer_poll);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match relay_pending(&state, &service).await {
            Ok(report) if report != RelayReport::default() => info!(?report, "relayer pass"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "relayer pass failed"),
        }
    }
}

/// One pass over the open requests, oldest first.
pub async fn relay_pending<S: DecryptionService>(state: &AppState, service: &S) -> Result<RelayReport, ApiError> {
    let max_attempts = state.config.relayer_max_attempts;
    let ids: Vec<_> = state
        .read(|ledger| {
            ledger
                .pending_decryptions()
                .into_iter()
                .filter(|pending| pending.attempts < max_attempts)
                .map(|pending| pending.request_id)
                .collect()
        })
        .await;

    let relayer = Principal::new(RELAYER_PRINCIPAL);
    let mut report = RelayReport::default();

    for request_id in ids {
        let request = state.read(|ledger| ledger.decryption_request(&request_id)).await?;

        let result = match service.decrypt(&request).await {
            Ok(result) => result,
            Err(e) => {
                let reason = e.to_string();
                state
                    .execute(|ledger| ledger.record_service_failure(&request_id, &reason))
                    .await?;
                report.unavailable += 1;
                continue;
            }
        };

        let ctx = TxContext::now(relayer.clone());
        match state
            .execute(|ledger| ledger.commit_decryption(&ctx, &request_id, &result))
            .await
        {
            Ok(CommitOutcome::Committed(_)) => report.committed += 1,
            Ok(CommitOutcome::AlreadyProven(_)) => report.already_proven += 1,
            Err(ApiError::Market(MarketError::ProofInvalid(reason))) => {
                warn!(%request_id, %reason, "service answer rejected");
                report.rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}
