use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meridian_sdk::providers::ProviderConfig;
use meridian_sdk::{ChatRequest, Message};

fn bench_provider_config_creation(c: &mut Criterion) {
    c.bench_function("provider_config_creation", |b| {
        b.iter(|| {
            let _config = ProviderConfig::new(black_box("openai"), black_box("test-key"))
                .with_base_url("https://api.openai.com/v1".to_string());
        });
    });
}

fn bench_request_creation(c: &mut Criterion) {
    c.bench_function("chat_request_creation", |b| {
        b.iter(|| {
            let _request = ChatRequest {
                model: "gpt-4".to_string(),
                messages: vec![
                    Message::system("You are a helpful assistant."),
                    Message::user("Hello, how are you?"),
                ],
                temperature: Some(0.7),
                max_tokens: Some(100),
                stream: Some(false),
                ..Default::default()
            };
        });
    });
}

fn bench_message_creation(c: &mut Criterion) {
    c.bench_function("message_creation", |b| {
        b.iter(|| {
            let _user_msg = Message::user("Hello, world!");
            let _assistant_msg = Message::assistant("Hi there!");
            let _system_msg = Message::system("You are a helpful assistant.");
        });
    });
}

fn bench_serialization(c: &mut Criterion) {
    let request = ChatRequest {
        model: "gpt-4".to_string(),
        messages: vec![
            Message::system("You are a helpful assistant."),
            Message::user("Hello, how are you?"),
        ],
        temperature: Some(0.7),
        max_tokens: Some(100),
        stream: Some(false),
        ..Default::default()
    };

    c.bench_function("request_serialization", |b| {
        b.iter(|| {
            let _json = serde_json::to_string(black_box(&request));
        });
    });

    c.bench_function("request_deserialization", |b| {
        let json = serde_json::to_string(&request).unwrap();
        b.iter(|| {
            let _request: ChatRequest = serde_json::from_str(black_box(&json)).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_provider_config_creation,
    bench_request_creation,
    bench_message_creation,
    bench_serialization
);
criterion_main!(benches);
