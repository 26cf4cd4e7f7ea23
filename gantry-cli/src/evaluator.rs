use gantry_serve::{EvalError, Evaluator, StackedFs};
use prost_reflect::MethodDescriptor;

/// Answers each call from a `<method full name>.json` file in the stacked
/// directories; the file's contents are the response envelope. The request
/// envelope is ignored, which is all a static reply can do.
pub struct StaticJsonEvaluator {
    vfs: StackedFs,
}

impl StaticJsonEvaluator {
    pub fn new(vfs: StackedFs) -> Self {
        Self { vfs }
    }
}

#[async_trait::async_trait]
impl Evaluator for StaticJsonEvaluator {
    async fn evaluate(
        &self,
        method: &MethodDescriptor,
        _input: String,
    ) -> Result<String, EvalError> {
        let name = format!("{}.json", method.full_name());
        let bytes = self.vfs.read(&name)?;
        Ok(String::from_utf8(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_registry::Registry;

    #[tokio::test]
    async fn reads_reply_file_for_method() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("greet.Greeter.Hello.json"),
            r#"{"response": {"greeting": "hi"}}"#,
        )
        .unwrap();

        let mut reg = Registry::new();
        reg.add_descriptor_set_bytes(gantry_proto::greet::FILE_DESCRIPTOR_SET)
            .unwrap();
        let method = reg.method_by_full_name("greet.Greeter.Hello").unwrap();

        let eval = StaticJsonEvaluator::new(StackedFs::new([dir.path()]));
        let out = eval.evaluate(&method, String::new()).await.unwrap();
        assert!(out.contains("greeting"));

        let missing = reg
            .method_by_full_name("greet.Greeter.HelloGet")
            .unwrap();
        assert!(eval.evaluate(&missing, String::new()).await.is_err());
    }
}
