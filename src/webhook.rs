use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::{
    provider::Prediction,
    reconcile::{Convergence, ReconcileOutcome, Reconciler},
    scheduler::PollScheduler,
};

#[derive(Debug)]
pub enum WebhookDisposition {
    UnknownJob,
    Processed(ReconcileOutcome),
}

/// Applies provider push notifications through the same funnel as the poller.
pub struct WebhookReconciler {
    reconciler: Arc<Reconciler>,
    scheduler: Arc<PollScheduler>,
}

impl WebhookReconciler {
    pub fn new(reconciler: Arc<Reconciler>, scheduler: Arc<PollScheduler>) -> Self {
        Self {
            reconciler,
            scheduler,
        }
    }

    pub async fn process(&self, prediction: Prediction) -> Result<WebhookDisposition> {
        let external_id = prediction.id.clone();
        let Some(record) = self.reconciler.store().find_by_external_id(&external_id)? else {
            warn!(external_id = %external_id, "Webhook for unknown job ignored");
            return Ok(WebhookDisposition::UnknownJob);
        };

        let report = prediction.into_report()?;
        let terminal = report.status.is_terminal();
        info!(
            external_id = %external_id,
            job_id = %record.id,
            status = report.status.as_str(),
            "Webhook received"
        );

        let outcome = self
            .reconciler
            .apply(&record.job_ref(), report, Convergence::Webhook)
            .await?;

        if terminal {
            self.scheduler.stop_polling(&external_id).await;
        }
        Ok(WebhookDisposition::Processed(outcome))
    }
}
