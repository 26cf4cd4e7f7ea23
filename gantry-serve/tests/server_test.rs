//! End-to-end tests over a real listener: a generated greeter client talks
//! to the dynamically dispatched server.

use std::sync::Arc;
use std::time::Duration;

use prost_reflect::MethodDescriptor;
use serde_json::json;
use tonic::transport::Channel;

use gantry_proto::greet::greeter_client::GreeterClient;
use gantry_proto::greet::HelloRequest;
use gantry_proto::reflection::server_reflection_client::ServerReflectionClient;
use gantry_proto::reflection::server_reflection_request::MessageRequest;
use gantry_proto::reflection::server_reflection_response::MessageResponse;
use gantry_proto::reflection::ServerReflectionRequest;
use gantry_serve::{EvalError, Evaluator, EvaluatorFn, Server, ServerConfig};

struct TestServer {
    addr: std::net::SocketAddr,
    _dir: tempfile::TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_server(evaluator: Arc<dyn Evaluator>) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("greet.pb"),
        gantry_proto::greet::FILE_DESCRIPTOR_SET,
    )
    .unwrap();

    let config = ServerConfig {
        dirs: vec![dir.path().to_path_buf()],
        ..ServerConfig::default()
    };
    let server = Server::new(config, evaluator).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = server.serve_on(listener).await;
    });
    TestServer { addr, _dir: dir, handle }
}

async fn connect(addr: std::net::SocketAddr) -> Channel {
    for _ in 0..50 {
        if let Ok(channel) = Channel::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
        {
            return channel;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server did not start");
}

/// A scripted greeter: greets by first name, rejects Bart, streams when the
/// shape calls for it.
fn greet_evaluator() -> Arc<dyn Evaluator> {
    Arc::new(EvaluatorFn(
        |method: &MethodDescriptor, input: String| -> Result<String, EvalError> {
            let input: serde_json::Value = serde_json::from_str(&input)?;
            let first = |v: &serde_json::Value| {
                v["firstName"].as_str().unwrap_or_default().to_owned()
            };
            let reply = match method.name() {
                "Hello" | "HelloGet" => {
                    let name = first(&input["request"]);
                    if name == "Bart" {
                        json!({"status": {"code": 3, "message": "eat my shorts"}})
                    } else if name == "Maude" {
                        json!({
                            "header": {"x-echo": "maude"},
                            "response": {"greeting": "Hello Maude"},
                        })
                    } else {
                        json!({"response": {"greeting": format!("Hello {name}")}})
                    }
                }
                "HelloClientStream" => {
                    let names: Vec<String> = input["stream"]
                        .as_array()
                        .map(|msgs| msgs.iter().map(first).collect())
                        .unwrap_or_default();
                    json!({"response": {"greeting": format!("Hello {}", names.join(" and "))}})
                }
                "HelloServerStream" => {
                    let name = first(&input["request"]);
                    if name.is_empty() {
                        json!({"stream": []})
                    } else {
                        json!({"stream": [
                            {"greeting": format!("Hello {name}")},
                            {"greeting": format!("Goodbye {name}")},
                        ]})
                    }
                }
                "HelloBidiStream" => {
                    let name = first(&input["request"]);
                    json!({"stream": [{"greeting": format!("Hello {name}")}]})
                }
                other => return Err(format!("unexpected method {other}").into()),
            };
            Ok(reply.to_string())
        },
    ))
}

fn hello(first_name: &str) -> HelloRequest {
    HelloRequest {
        first_name: first_name.to_owned(),
        last_name: String::new(),
    }
}

#[tokio::test]
async fn unary_call() {
    let server = start_server(greet_evaluator()).await;
    let mut client = GreeterClient::new(connect(server.addr).await);

    let resp = client.hello(hello("Stranger")).await.unwrap();
    assert_eq!(resp.into_inner().greeting, "Hello Stranger");
}

#[tokio::test]
async fn unary_call_surfaces_evaluator_status() {
    let server = start_server(greet_evaluator()).await;
    let mut client = GreeterClient::new(connect(server.addr).await);

    let err = client.hello(hello("Bart")).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
    assert_eq!(err.message(), "eat my shorts");
}

#[tokio::test]
async fn unary_call_carries_reply_header_metadata() {
    let server = start_server(greet_evaluator()).await;
    let mut client = GreeterClient::new(connect(server.addr).await);

    let resp = client.hello(hello("Maude")).await.unwrap();
    assert_eq!(
        resp.metadata().get("x-echo").and_then(|v| v.to_str().ok()),
        Some("maude")
    );
}

#[tokio::test]
async fn client_streaming_batches_all_messages() {
    let server = start_server(greet_evaluator()).await;
    let mut client = GreeterClient::new(connect(server.addr).await);

    let inbound = tokio_stream::iter(vec![hello("Patty"), hello("Selma")]);
    let resp = client.hello_client_stream(inbound).await.unwrap();
    assert_eq!(resp.into_inner().greeting, "Hello Patty and Selma");
}

#[tokio::test]
async fn server_streaming_replays_stream_in_order() {
    let server = start_server(greet_evaluator()).await;
    let mut client = GreeterClient::new(connect(server.addr).await);

    let mut stream = client
        .hello_server_stream(hello("Ned"))
        .await
        .unwrap()
        .into_inner();
    let mut greetings = Vec::new();
    while let Some(msg) = stream.message().await.unwrap() {
        greetings.push(msg.greeting);
    }
    assert_eq!(greetings, vec!["Hello Ned", "Goodbye Ned"]);
}

#[tokio::test]
async fn server_streaming_empty_stream_completes_ok() {
    let server = start_server(greet_evaluator()).await;
    let mut client = GreeterClient::new(connect(server.addr).await);

    let mut stream = client
        .hello_server_stream(hello(""))
        .await
        .unwrap()
        .into_inner();
    assert!(stream.message().await.unwrap().is_none());
}

#[tokio::test]
async fn bidi_streaming_replies_per_message_in_order() {
    let server = start_server(greet_evaluator()).await;
    let mut client = GreeterClient::new(connect(server.addr).await);

    let inbound = tokio_stream::iter(vec![hello("a"), hello("b"), hello("c")]);
    let mut stream = client
        .hello_bidi_stream(inbound)
        .await
        .unwrap()
        .into_inner();
    let mut greetings = Vec::new();
    while let Some(msg) = stream.message().await.unwrap() {
        greetings.push(msg.greeting);
    }
    assert_eq!(greetings, vec!["Hello a", "Hello b", "Hello c"]);
}

#[tokio::test]
async fn evaluator_errors_fail_the_call() {
    let evaluator = Arc::new(EvaluatorFn(
        |_: &MethodDescriptor, _: String| -> Result<String, EvalError> {
            Err("script exploded".into())
        },
    ));
    let server = start_server(evaluator).await;
    let mut client = GreeterClient::new(connect(server.addr).await);

    let err = client.hello(hello("x")).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::Unknown);
    assert!(err.message().contains("script exploded"));
}

#[tokio::test]
async fn reflection_lists_registered_services() {
    let server = start_server(greet_evaluator()).await;
    let mut client = ServerReflectionClient::new(connect(server.addr).await);

    let req = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(MessageRequest::ListServices(String::new())),
    };
    let mut stream = client
        .server_reflection_info(tokio_stream::iter(vec![req]))
        .await
        .unwrap()
        .into_inner();
    let resp = stream.message().await.unwrap().unwrap();
    match resp.message_response.unwrap() {
        MessageResponse::ListServicesResponse(list) => {
            let names: Vec<_> = list.service.iter().map(|s| s.name.as_str()).collect();
            assert!(names.contains(&"greet.Greeter"));
            assert!(names.contains(&"grpc.reflection.v1alpha.ServerReflection"));
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[tokio::test]
async fn reflection_resolves_symbol_to_file() {
    let server = start_server(greet_evaluator()).await;
    let mut client = ServerReflectionClient::new(connect(server.addr).await);

    let req = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(MessageRequest::FileContainingSymbol(
            "greet.Greeter".to_owned(),
        )),
    };
    let mut stream = client
        .server_reflection_info(tokio_stream::iter(vec![req]))
        .await
        .unwrap()
        .into_inner();
    let resp = stream.message().await.unwrap().unwrap();
    match resp.message_response.unwrap() {
        MessageResponse::FileDescriptorResponse(files) => {
            assert!(!files.file_descriptor_proto.is_empty());
        }
        other => panic!("unexpected response {other:?}"),
    }
}
