use anyhow::Result;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::segment::Segment;
use crate::TaskId;

/// One inference call: a segment, the analysis prompt, and the user question
/// when this task claimed one.
#[derive(Clone, Copy, Debug)]
pub struct AnalyzeRequest<'a> {
    pub task_id: TaskId,
    pub segment: &'a Segment,
    pub prompt: &'a str,
    pub question: Option<&'a str>,
    pub timeout: Duration,
}

impl AnalyzeRequest<'_> {
    /// Prompt text sent to the model, with the user question appended.
    pub fn full_prompt(&self) -> String {
        match self.question {
            Some(question) => format!(
                "{}\n\nThe user asks about this video: {}\nAnswer the question first, then describe anything else notable.",
                self.prompt, question
            ),
            None => self.prompt.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VlmResponse {
    pub text: String,
    pub duration: Duration,
}

/// Vision-language model backend.
///
/// Implementations are called from several worker threads at once. A call
/// must return within `request.timeout` (plus transport slack) and should
/// return early with an error once `cancel` is tripped.
pub trait VlmBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Analyze a segment.
    fn analyze(&self, request: &AnalyzeRequest<'_>, cancel: &CancelToken) -> Result<VlmResponse>;

    /// Optional warm-up hook, called once from `start()`.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
