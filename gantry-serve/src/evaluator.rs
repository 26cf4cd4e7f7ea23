use prost_reflect::MethodDescriptor;

pub type EvalError = Box<dyn std::error::Error + Send + Sync>;

/// The external scripting collaborator. Receives the request envelope as
/// JSON text and returns the response envelope as JSON text; any error is
/// surfaced verbatim as the call's terminal failure.
#[async_trait::async_trait]
pub trait Evaluator: Send + Sync + 'static {
    async fn evaluate(&self, method: &MethodDescriptor, input: String)
        -> Result<String, EvalError>;
}

/// Adapts a plain closure into an [`Evaluator`]; handy for tests and
/// embedders with trivial logic.
pub struct EvaluatorFn<F>(pub F);

#[async_trait::async_trait]
impl<F> Evaluator for EvaluatorFn<F>
where
    F: Fn(&MethodDescriptor, String) -> Result<String, EvalError> + Send + Sync + 'static,
{
    async fn evaluate(
        &self,
        method: &MethodDescriptor,
        input: String,
    ) -> Result<String, EvalError> {
        (self.0)(method, input)
    }
}
