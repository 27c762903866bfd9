use std::sync::Arc;

use tracing::{info, Instrument};

use crate::error::AdmissionError;
use crate::events::{InProcEventBus, WorkflowEvent, WorkflowEventPayload};
use crate::job::{RunId, TriggerEvent, WorkflowRun};
use crate::steplog::StepLog;
use crate::telemetry;

/// Outcome of admitting a trigger.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Admission {
    /// False when the revision had already been admitted.
    pub admitted: bool,
    pub run_id: RunId,
}

/// Idempotency gate in front of the pipeline: one run per revision id.
#[derive(Clone)]
pub struct EventIngestor {
    log: Arc<dyn StepLog>,
    events: Arc<InProcEventBus>,
}

impl EventIngestor {
    pub fn new(log: Arc<dyn StepLog>, events: Arc<InProcEventBus>) -> Self {
        Self { log, events }
    }

    pub async fn admit(
        &self,
        trigger: &TriggerEvent,
    ) -> Result<Admission, AdmissionError> {
        let revision_id = trigger.revision_id.trim();
        if revision_id.is_empty() {
            return Err(AdmissionError::EmptyRevision);
        }

        let trigger = TriggerEvent::new(trigger.resource_id.clone(), revision_id);
        let run_id = RunId::for_revision(revision_id);

        async {
            let outcome = self
                .log
                .admit(WorkflowRun::new(run_id, &trigger))
                .await
                .map_err(|source| AdmissionError::Storage {
                    revision_id: trigger.revision_id.clone(),
                    source,
                })?;

            let run_id = outcome.run.run_id;
            if outcome.created {
                telemetry::record_run_admitted(run_id, &trigger.revision_id);
                self.events.publish_event(WorkflowEvent::new(
                    run_id,
                    WorkflowEventPayload::RunAdmitted {
                        revision_id: trigger.revision_id.clone(),
                    },
                ));
            } else {
                info!(
                    run_id = %run_id,
                    status = %outcome.run.status,
                    "revision already admitted"
                );
                self.events.publish_event(WorkflowEvent::new(
                    run_id,
                    WorkflowEventPayload::RunDuplicate {
                        revision_id: trigger.revision_id.clone(),
                    },
                ));
            }

            Ok::<_, AdmissionError>(Admission {
                admitted: outcome.created,
                run_id,
            })
        }
        .instrument(telemetry::admit_span(revision_id))
        .await
    }
}
