//! Prompts sent to job conversations when a phase starts.

use crate::job::{JobDocument, JobPhase};

/// Opening prompt for a conversation taking over `phase` of `job`.
pub fn phase_prompt(job: &JobDocument, phase: JobPhase) -> Option<String> {
    let path = job.path.display();
    let title = &job.title;
    let text = match phase {
        JobPhase::Planning => format!(
            "You are planning the job \"{title}\" described in {path}.\n\
             Read the file, investigate the codebase, and rewrite the job body into a \
             concrete checklist of `- [ ]` tasks. Add a `## Review` section with review \
             tasks if the work should be reviewed. Do not start implementing."
        ),
        JobPhase::Executing => format!(
            "You are executing the job \"{title}\" described in {path}.\n\
             Work through the checklist in order. After finishing each task, tick it \
             in the file (`- [x]`). Leave tasks under `## Review` for the review phase."
        ),
        JobPhase::Review => format!(
            "You are reviewing the job \"{title}\" described in {path}.\n\
             Inspect the changes made during execution, work through the tasks under \
             `## Review`, and tick each one in the file as you verify it. Fix any \
             problems you find."
        ),
        JobPhase::Backlog | JobPhase::Complete => return None,
    };
    Some(text)
}

/// Nudge sent once when a review run ends without the job being finalized.
pub fn finalize_prompt(job: &JobDocument) -> String {
    format!(
        "Finalize the review of \"{}\" ({}). Make sure every review task is ticked, \
         summarize what was verified and anything left open, then stop.",
        job.title,
        job.path.display()
    )
}
