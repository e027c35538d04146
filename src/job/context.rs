use super::JobId;

/// Identity of the job a processor is currently running.
///
/// Set as a task-local around every processor future, so helpers deep inside a
/// handler (the outbound channel's `x-job-id` header, for one) can read it without
/// threading the job through.
#[derive(Clone, Debug)]
pub struct JobContext {
  pub queue: String,
  pub job_id: JobId,
  pub job_type: String,
  /// 1-based.
  pub attempt: u32,
}

tokio::task_local! {
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// The running job's context, or `None` outside a queue worker.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Clones the running job's context.
///
/// # Panics
/// Outside a processor run by a queue worker.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}
