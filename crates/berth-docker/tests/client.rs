//! DockerClient against a scripted runtime on a local socket.

use berth_docker::{DockerClient, DockerConnector};
use berth_ecs::RuntimeConnector;
use berth_ecs::api::ApiErrorKind;
use berth_ecs::types::{AttachOptions, ContainerFilter, HostInstance};
use berth_scheduler::RunIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const TASK_ARN: &str = "arn:aws:ecs:us-east-1:000000000000:task/default/0000002a";

fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Read one request head (requests here carry no body).
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_eq!(n, 1, "client closed mid-request");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn respond_json(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await.unwrap();
}

/// Serve one connection with `script`; returns the request heads seen.
async fn serve<F, Fut>(script: F) -> (String, JoinHandle<Vec<String>>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Vec<String>> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(stream).await
    });
    (addr, handle)
}

fn query_param(head: &str, name: &str) -> Option<String> {
    let target = head.split_whitespace().nth(1)?;
    let (_, query) = target.split_once('?')?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

#[tokio::test]
async fn lists_then_attaches_on_one_connection() {
    let (addr, server) = serve(|mut stream| async move {
        let list = read_head(&mut stream).await;
        respond_json(
            &mut stream,
            "200 OK",
            &format!(r#"[{{"Id":"c0ffee","Labels":{{"com.amazonaws.ecs.task-arn":"{TASK_ARN}"}},"State":"running"}}]"#),
        )
        .await;

        let attach = read_head(&mut stream).await;
        stream
            .write_all(
                b"HTTP/1.1 101 UPGRADED\r\nContent-Type: application/vnd.docker.raw-stream\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n",
            )
            .await
            .unwrap();
        let mut output = frame(1, b"hello\n");
        output.extend(frame(2, b"warning\n"));
        stream.write_all(&output).await.unwrap();
        stream.shutdown().await.unwrap();
        vec![list, attach]
    })
    .await;

    let mut client = DockerClient::connect(&addr).await.unwrap();
    let containers = client
        .containers(&ContainerFilter {
            label: ("com.amazonaws.ecs.task-arn".into(), TASK_ARN.into()),
            all: true,
        })
        .await
        .unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].id, "c0ffee");
    assert_eq!(containers[0].labels["com.amazonaws.ecs.task-arn"], TASK_ARN);

    let (stdout, mut stdout_reader) = tokio::io::duplex(1024);
    let (stderr, mut stderr_reader) = tokio::io::duplex(1024);
    let options = AttachOptions {
        raw_terminal: false,
        ..AttachOptions::interactive()
    };
    client
        .attach_to("c0ffee", options, RunIo::new(tokio::io::empty(), stdout, stderr))
        .await
        .unwrap();

    let mut out = String::new();
    stdout_reader.read_to_string(&mut out).await.unwrap();
    let mut err = String::new();
    stderr_reader.read_to_string(&mut err).await.unwrap();
    assert_eq!(out, "hello\n");
    assert_eq!(err, "warning\n");

    let heads = server.await.unwrap();
    assert!(heads[0].starts_with("GET /containers/json?"));
    assert_eq!(query_param(&heads[0], "all").as_deref(), Some("1"));
    let filters: serde_json::Value =
        serde_json::from_str(&query_param(&heads[0], "filters").unwrap()).unwrap();
    assert_eq!(
        filters,
        serde_json::json!({ "label": [format!("com.amazonaws.ecs.task-arn={TASK_ARN}")] })
    );

    assert!(heads[1].starts_with("POST /containers/c0ffee/attach?"));
    for name in ["logs", "stream", "stdin", "stdout", "stderr"] {
        assert_eq!(query_param(&heads[1], name).as_deref(), Some("1"), "{name}");
    }
    let lower = heads[1].to_ascii_lowercase();
    assert!(lower.contains("upgrade: tcp"));
    assert!(lower.contains("connection: upgrade"));
}

#[tokio::test]
async fn raw_terminal_output_is_copied_verbatim() {
    let (addr, server) = serve(|mut stream| async move {
        let attach = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n$ ls\r\nbin\r\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        vec![attach]
    })
    .await;

    let client = DockerClient::connect(&addr).await.unwrap();
    let (stdout, mut reader) = tokio::io::duplex(1024);
    client
        .attach_to(
            "c0ffee",
            AttachOptions::interactive(),
            RunIo::new(tokio::io::empty(), stdout, tokio::io::sink()),
        )
        .await
        .unwrap();

    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "$ ls\r\nbin\r\n");
    server.await.unwrap();
}

#[tokio::test]
async fn missing_container_is_not_found() {
    let (addr, server) = serve(|mut stream| async move {
        let attach = read_head(&mut stream).await;
        respond_json(
            &mut stream,
            "404 Not Found",
            r#"{"message":"No such container: gone"}"#,
        )
        .await;
        vec![attach]
    })
    .await;

    let client = DockerClient::connect(&addr).await.unwrap();
    let err = client
        .attach_to(
            "gone",
            AttachOptions::interactive(),
            RunIo::new(tokio::io::empty(), tokio::io::sink(), tokio::io::sink()),
        )
        .await
        .unwrap_err();

    let err = berth_ecs::api::ApiError::from(err);
    assert_eq!(err.kind, ApiErrorKind::NotFound);
    assert!(err.message.contains("No such container: gone"));
    server.await.unwrap();
}

#[tokio::test]
async fn connector_requires_a_private_address() {
    let connector = DockerConnector::default();
    let host = HostInstance {
        instance_id: "i-0a1".into(),
        private_ip: None,
    };

    let err = match connector.connect(&host).await {
        Ok(_) => panic!("connected without an address"),
        Err(err) => err,
    };

    assert_eq!(err.kind, ApiErrorKind::Validation);
}

#[tokio::test]
async fn refused_connection_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let connector = DockerConnector::new(port);
    let host = HostInstance {
        instance_id: "i-0a1".into(),
        private_ip: Some("127.0.0.1".into()),
    };
    let err = match connector.connect(&host).await {
        Ok(_) => panic!("connected to a closed port"),
        Err(err) => err,
    };

    assert_eq!(err.kind, ApiErrorKind::Transport);
}
