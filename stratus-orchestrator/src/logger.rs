use std::time::Instant;
use uuid::Uuid;

/// Action logger: one start event, one completion event with the duration.
///
/// Events go through `tracing` under the `stratus::action` target so an
/// operator can filter them (`RUST_LOG=stratus::action=info`).
pub struct ActionLog {
    id: Uuid,
    action_type: &'static str,
    subject: String,
    started: Instant,
}

impl ActionLog {
    pub fn start(action_type: &'static str, subject: impl Into<String>) -> Self {
        let log = Self {
            id: Uuid::new_v4(),
            action_type,
            subject: subject.into(),
            started: Instant::now(),
        };
        tracing::info!(
            target: "stratus::action",
            log_id = %log.id,
            action = log.action_type,
            subject = %log.subject,
            started_at = %chrono::Utc::now().to_rfc3339(),
            status = "in_progress",
            "action started"
        );
        log
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn duration_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    pub fn success(self) {
        tracing::info!(
            target: "stratus::action",
            log_id = %self.id,
            action = self.action_type,
            subject = %self.subject,
            duration_ms = self.duration_ms() as u64,
            status = "success",
            "action completed"
        );
    }

    pub fn failure(self, err: &anyhow::Error) {
        tracing::error!(
            target: "stratus::action",
            log_id = %self.id,
            action = self.action_type,
            subject = %self.subject,
            duration_ms = self.duration_ms() as u64,
            status = "failed",
            error = %format!("{:#}", err),
            "action failed"
        );
    }

    /// Closes the log from an action's result and hands the result back.
    pub fn finish<T>(self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        match &result {
            Ok(_) => self.success(),
            Err(e) => self.failure(e),
        }
        result
    }
}
