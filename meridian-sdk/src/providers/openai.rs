use crate::error::ProviderError;
use crate::models::{
    AudioRequest, AudioResponse, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse,
    ImageRequest, ImageResponse, SpeechRequest, SpeechResponse, StreamChunk,
};
use crate::providers::{HealthStatus, Provider, ProviderConfig, ProviderHealth, StreamResult};
use async_stream::stream;

use super::http_client::{map_error_response, AuthStrategy, HttpProviderClient};

use std::collections::HashMap;
use std::time::Instant;

pub struct OpenAIProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
}

impl OpenAIProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://api.openai.com/v1",
            &config.headers,
            AuthStrategy::Bearer {
                token: config.api_key.clone(),
            },
        )?;

        Ok(Self { http, config })
    }

    fn map_model(&self, model: &str) -> String {
        self.config
            .model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

#[async_trait::async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_function_calling(&self) -> bool {
        true
    }

    fn supported_models(&self) -> Vec<String> {
        vec![
            "gpt-4o".to_string(),
            "gpt-4o-mini".to_string(),
            "gpt-4-turbo".to_string(),
            "gpt-4".to_string(),
            "gpt-3.5-turbo".to_string(),
            "text-embedding-3-large".to_string(),
            "text-embedding-3-small".to_string(),
            "dall-e-3".to_string(),
            "whisper-1".to_string(),
            "tts-1".to_string(),
        ]
    }

    async fn chat_completion(
        &self,
        mut request: ChatRequest,
    ) -> Result<ChatResponse, ProviderError> {
        request.model = self.map_model(&request.model);

        let chat_response: ChatResponse =
            self.http.post_json("/chat/completions", &request).await?;
        Ok(chat_response)
    }

    async fn stream_chat_completion(
        &self,
        mut request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        request.model = self.map_model(&request.model);
        request.stream = Some(true);

        let response = self
            .http
            .post_json_raw("/chat/completions", &request)
            .await?;

        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
                match chunk_result {
                    Ok(chunk) => {
                        let chunk_str = String::from_utf8_lossy(&chunk);
                        buffer.push_str(&chunk_str);

                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();

                            if let Some(json_str) = line.strip_prefix("data: ") {
                                if json_str == "[DONE]" {
                                    return;
                                }

                                match serde_json::from_str::<StreamChunk>(json_str) {
                                    Ok(stream_chunk) => yield Ok(stream_chunk),
                                    Err(e) => yield Err(ProviderError::Serialization(e)),
                                }
                            }
                        }
                    }
                    Err(e) => yield Err(ProviderError::Http(e)),
                }
            }
        });

        Ok(stream)
    }

    async fn embedding(
        &self,
        mut request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, ProviderError> {
        request.model = self.map_model(&request.model);
        let embedding_response: EmbeddingResponse =
            self.http.post_json("/embeddings", &request).await?;
        Ok(embedding_response)
    }

    async fn image_generation(
        &self,
        mut request: ImageRequest,
    ) -> Result<ImageResponse, ProviderError> {
        if let Some(ref model) = request.model {
            request.model = Some(self.map_model(model));
        }
        let image_response: ImageResponse =
            self.http.post_json("/images/generations", &request).await?;
        Ok(image_response)
    }

    async fn audio_transcription(
        &self,
        mut request: AudioRequest,
    ) -> Result<AudioResponse, ProviderError> {
        request.model = self.map_model(&request.model);

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(request.file)
                    .file_name("audio.mp3")
                    .mime_str("audio/mpeg")?,
            )
            .text("model", request.model);

        let form = if let Some(language) = request.language {
            form.text("language", language)
        } else {
            form
        };

        let form = if let Some(prompt) = request.prompt {
            form.text("prompt", prompt)
        } else {
            form
        };

        let response = self.http.post_multipart("/audio/transcriptions", form).await?;

        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let audio_response: AudioResponse = response.json().await?;
        Ok(audio_response)
    }

    async fn text_to_speech(
        &self,
        mut request: SpeechRequest,
    ) -> Result<SpeechResponse, ProviderError> {
        request.model = self.map_model(&request.model);

        let response = self.http.post_json_raw("/audio/speech", &request).await?;

        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|ct| ct.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();

        let audio_bytes = response.bytes().await?;

        Ok(SpeechResponse {
            audio: audio_bytes.to_vec(),
            content_type,
        })
    }

    async fn health_check(&self) -> Result<ProviderHealth, ProviderError> {
        let start = Instant::now();

        let response = self.http.get_json::<serde_json::Value>("/models").await;

        let latency_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(_) => Ok(ProviderHealth {
                status: HealthStatus::Healthy,
                latency_ms: Some(latency_ms),
                error_rate: 0.0,
                last_check: chrono::Utc::now(),
                details: HashMap::new(),
            }),
            Err(e) => {
                let mut details = HashMap::new();
                details.insert("error".to_string(), e.to_string());

                Ok(ProviderHealth {
                    status: HealthStatus::Degraded,
                    latency_ms: Some(latency_ms),
                    error_rate: 1.0,
                    last_check: chrono::Utc::now(),
                    details,
                })
            }
        }
    }
}
