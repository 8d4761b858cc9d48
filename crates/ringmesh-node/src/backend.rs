//! The inference backend interface consumed by the orchestrator (§6).
//!
//! The core only depends on this trait; weight loading, tokenization and
//! tensor math are out of scope for this specification and live in
//! whatever implementation is plugged in at startup.

use async_trait::async_trait;
use ringmesh_proto::{InferenceState, ProtoError, RequestId, Shard, Tensor, TensorData};

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn encode(&self, shard: &Shard, prompt: &str) -> Result<Vec<i32>, ProtoError>;
    async fn decode(&self, shard: &Shard, tokens: &[i32]) -> Result<String, ProtoError>;
    async fn sample(&self, logits: &Tensor, temperature: f32) -> Result<Vec<i32>, ProtoError>;

    async fn infer_prompt(
        &self,
        request_id: &RequestId,
        shard: &Shard,
        prompt: &str,
        state: Option<InferenceState>,
    ) -> Result<(Tensor, Option<InferenceState>), ProtoError>;

    async fn infer_tensor(
        &self,
        request_id: &RequestId,
        shard: &Shard,
        tensor: &Tensor,
        state: Option<InferenceState>,
    ) -> Result<(Tensor, Option<InferenceState>), ProtoError>;

    async fn load_checkpoint(&self, shard: &Shard, path: &str) -> Result<(), ProtoError>;
    async fn clear_session(&self) -> Result<(), ProtoError>;
    fn supported_models(&self) -> Vec<String>;
}

/// A dummy backend that echoes its input back as the output tensor. Used
/// in tests and as a development stand-in; it is a peer implementation of
/// [`InferenceBackend`], not a privileged default (§9 "a dummy variant
/// that echoes inputs is required for tests").
pub struct EchoBackend {
    model_id: String,
}

impl EchoBackend {
    pub fn new(model_id: impl Into<String>) -> Self {
        EchoBackend {
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl InferenceBackend for EchoBackend {
    async fn encode(&self, _shard: &Shard, prompt: &str) -> Result<Vec<i32>, ProtoError> {
        Ok(prompt.bytes().map(|b| b as i32).collect())
    }

    async fn decode(&self, _shard: &Shard, tokens: &[i32]) -> Result<String, ProtoError> {
        let bytes: Vec<u8> = tokens.iter().map(|&t| t as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn sample(&self, logits: &Tensor, _temperature: f32) -> Result<Vec<i32>, ProtoError> {
        match &logits.data {
            TensorData::F32(v) => Ok(v.iter().map(|&x| x.round() as i32).collect()),
            TensorData::I32(v) => Ok(v.clone()),
        }
    }

    async fn infer_prompt(
        &self,
        _request_id: &RequestId,
        _shard: &Shard,
        prompt: &str,
        state: Option<InferenceState>,
    ) -> Result<(Tensor, Option<InferenceState>), ProtoError> {
        let values: Vec<f32> = prompt.bytes().map(|b| b as f32).collect();
        let len = values.len() as i32;
        Ok((Tensor::new(vec![len.max(1)], TensorData::F32(values)), state))
    }

    async fn infer_tensor(
        &self,
        _request_id: &RequestId,
        _shard: &Shard,
        tensor: &Tensor,
        state: Option<InferenceState>,
    ) -> Result<(Tensor, Option<InferenceState>), ProtoError> {
        Ok((tensor.clone(), state))
    }

    async fn load_checkpoint(&self, _shard: &Shard, _path: &str) -> Result<(), ProtoError> {
        Ok(())
    }

    async fn clear_session(&self) -> Result<(), ProtoError> {
        Ok(())
    }

    fn supported_models(&self) -> Vec<String> {
        vec![self.model_id.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> Shard {
        Shard::new("m", 0, 5, 12).unwrap()
    }

    #[tokio::test]
    async fn echo_backend_infer_tensor_passes_through() {
        let backend = EchoBackend::new("echo-1");
        let t = Tensor::new(vec![2], TensorData::F32(vec![1.0, 2.0]));
        let (out, _) = backend
            .infer_tensor(&RequestId::from("r1"), &shard(), &t, None)
            .await
            .unwrap();
        assert_eq!(out, t);
    }

    #[tokio::test]
    async fn echo_backend_infer_prompt_is_nonempty() {
        let backend = EchoBackend::new("echo-1");
        let (out, _) = backend
            .infer_prompt(&RequestId::from("r1"), &shard(), "hi", None)
            .await
            .unwrap();
        assert_eq!(out.shape_product(), 2);
    }

    #[test]
    fn supported_models_reports_configured_id() {
        let backend = EchoBackend::new("echo-1");
        assert_eq!(backend.supported_models(), vec!["echo-1".to_string()]);
    }
}
