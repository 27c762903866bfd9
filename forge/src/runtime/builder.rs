use std::fmt;
use std::sync::Arc;

use crate::budget::{Budget, InMemoryBudget};
use crate::client::{LogReportDelivery, RenderClient, ReportDelivery, RowReader};
use crate::config::AppConfig;
use crate::dead_letter::{DeadLetterSink, InMemoryDeadLetterSink};
use crate::events::InProcEventBus;
use crate::steplog::{InMemoryStepLog, StepLog};

use super::supervisor::{RuntimeParts, WorkflowRuntime};

/// Builder for a [`WorkflowRuntime`].
///
/// The row reader and the render client have no default and must be set.
/// Everything else falls back to the in-memory implementations sized from
/// the configuration.
///
/// # Example
///
/// ```ignore
/// use forge::*;
///
/// let runtime = WorkflowRuntimeBuilder::new(AppConfig::from_env()?)
///     .with_row_reader(reader)
///     .with_render_client(client)
///     .with_report_delivery(delivery)
///     .build()?;
/// ```
pub struct WorkflowRuntimeBuilder {
    config: AppConfig,
    step_log: Option<Arc<dyn StepLog>>,
    budget: Option<Arc<dyn Budget>>,
    row_reader: Option<Arc<dyn RowReader>>,
    render_client: Option<Arc<dyn RenderClient>>,
    report_delivery: Option<Arc<dyn ReportDelivery>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    events: Option<Arc<InProcEventBus>>,
}

impl fmt::Debug for WorkflowRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRuntimeBuilder")
            .field("config", &self.config)
            .field("step_log_set", &self.step_log.is_some())
            .field("budget_set", &self.budget.is_some())
            .field("row_reader_set", &self.row_reader.is_some())
            .field("render_client_set", &self.render_client.is_some())
            .field("report_delivery_set", &self.report_delivery.is_some())
            .field("dead_letters_set", &self.dead_letters.is_some())
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl WorkflowRuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            step_log: None,
            budget: None,
            row_reader: None,
            render_client: None,
            report_delivery: None,
            dead_letters: None,
            events: None,
        }
    }

    /// Set the durable step log. Defaults to [`InMemoryStepLog`].
    pub fn with_step_log(mut self, step_log: Arc<dyn StepLog>) -> Self {
        self.step_log = Some(step_log);
        self
    }

    /// Set the concurrency limiter. Defaults to an [`InMemoryBudget`] sized
    /// from `config.concurrency`.
    pub fn with_budget(mut self, budget: Arc<dyn Budget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_row_reader(mut self, reader: Arc<dyn RowReader>) -> Self {
        self.row_reader = Some(reader);
        self
    }

    pub fn with_render_client(mut self, client: Arc<dyn RenderClient>) -> Self {
        self.render_client = Some(client);
        self
    }

    /// Set the report collaborator. Defaults to [`LogReportDelivery`].
    pub fn with_report_delivery(
        mut self,
        delivery: Arc<dyn ReportDelivery>,
    ) -> Self {
        self.report_delivery = Some(delivery);
        self
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Share an existing event bus, e.g. to subscribe before the runtime
    /// exists.
    pub fn with_event_bus(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a required
    /// dependency is missing.
    pub fn build(self) -> anyhow::Result<WorkflowRuntime> {
        self.config.validate()?;

        #[cfg(feature = "metrics")]
        crate::metrics::init_metrics()?;

        let reader = self
            .row_reader
            .ok_or_else(|| anyhow::anyhow!("row_reader dependency missing"))?;
        let client = self
            .render_client
            .ok_or_else(|| anyhow::anyhow!("render_client dependency missing"))?;

        let log = self
            .step_log
            .unwrap_or_else(|| Arc::new(InMemoryStepLog::new()));
        let budget = self
            .budget
            .unwrap_or_else(|| Arc::new(InMemoryBudget::new(self.config.concurrency)));
        let delivery = self
            .report_delivery
            .unwrap_or_else(|| Arc::new(LogReportDelivery));
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterSink::new()));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::new(self.config.events.capacity)));

        Ok(WorkflowRuntime::new(
            self.config,
            RuntimeParts {
                log,
                budget,
                reader,
                client,
                delivery,
                dead_letters,
                events,
            },
        ))
    }
}
