//! DockerClient — one HTTP/1 connection to one host's runtime.

use std::collections::BTreeMap;

use async_trait::async_trait;
use berth_ecs::api::{ApiResult, RuntimeClient, RuntimeConnector};
use berth_ecs::types::{AttachOptions, ContainerFilter, ContainerSummary, HostInstance};
use berth_scheduler::RunIo;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::{Position, Url};

use crate::error::{DockerError, DockerResult};
use crate::stream::demux;

pub const DEFAULT_PORT: u16 = 2375;

const USER_AGENT: &str = concat!("berth-docker/", env!("CARGO_PKG_VERSION"));

/// Opens [`DockerClient`] sessions on a host's private address.
#[derive(Debug, Clone, Copy)]
pub struct DockerConnector {
    port: u16,
}

impl DockerConnector {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for DockerConnector {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

#[async_trait]
impl RuntimeConnector for DockerConnector {
    async fn connect(&self, host: &HostInstance) -> ApiResult<Box<dyn RuntimeClient>> {
        let ip = host
            .private_ip
            .as_deref()
            .ok_or_else(|| DockerError::NoAddress(host.instance_id.clone()))?;
        let client = DockerClient::connect(&format!("{ip}:{}", self.port)).await?;
        Ok(Box::new(client))
    }
}

/// Container as listed by the runtime.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerContainer {
    id: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    state: String,
}

impl From<DockerContainer> for ContainerSummary {
    fn from(c: DockerContainer) -> Self {
        Self {
            id: c.id,
            labels: c.labels.unwrap_or_default(),
            state: c.state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DockerMessage {
    message: String,
}

pub struct DockerClient {
    addr: String,
    base: Url,
    sender: SendRequest<Full<Bytes>>,
}

impl DockerClient {
    /// Connect to the runtime API at `addr` (`host:port`).
    pub async fn connect(addr: &str) -> DockerResult<Self> {
        let base = Url::parse(&format!("http://{addr}/"))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| DockerError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

        // Drive the connection in the background; upgrades hand the socket
        // over to the attach stream.
        let conn_addr = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(addr = %conn_addr, error = %e, "runtime connection closed");
            }
        });

        debug!(%addr, "connected to container runtime");
        Ok(Self {
            addr: addr.to_string(),
            base,
            sender,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Containers carrying the filter's label.
    pub async fn containers(&mut self, filter: &ContainerFilter) -> DockerResult<Vec<ContainerSummary>> {
        let (key, value) = &filter.label;
        let filters = serde_json::json!({ "label": [format!("{key}={value}")] }).to_string();
        let mut url = self.base.join("containers/json")?;
        url.query_pairs_mut()
            .append_pair("all", flag(filter.all))
            .append_pair("filters", &filters);

        let request = self.request(Method::GET, &url).body(Full::new(Bytes::new()))?;
        let response = self.send(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        let containers: Vec<DockerContainer> = serde_json::from_slice(&body)?;
        debug!(addr = %self.addr, count = containers.len(), "listed containers");
        Ok(containers.into_iter().map(Into::into).collect())
    }

    /// Attach `io` to the container and pump until the container's output
    /// ends. Consumes the client: the connection becomes the attach stream.
    pub async fn attach_to(
        mut self,
        container_id: &str,
        options: AttachOptions,
        io: RunIo,
    ) -> DockerResult<()> {
        let mut url = self.base.join(&format!("containers/{container_id}/attach"))?;
        url.query_pairs_mut()
            .append_pair("logs", flag(options.logs))
            .append_pair("stream", flag(options.stream))
            .append_pair("stdin", flag(options.stdin))
            .append_pair("stdout", flag(options.stdout))
            .append_pair("stderr", flag(options.stderr));

        let request = self
            .request(Method::POST, &url)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .body(Full::new(Bytes::new()))?;
        let response = self.send(request).await?;
        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(status_error(status, &body));
        }

        let upgraded = hyper::upgrade::on(response).await?;
        debug!(addr = %self.addr, container = %container_id, "attached");
        pump(TokioIo::new(upgraded), options.raw_terminal, io).await
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn request(&self, method: Method, url: &Url) -> http::request::Builder {
        Request::builder()
            .method(method)
            .uri(&url[Position::BeforePath..])
            .header(header::HOST, &self.addr)
            .header(header::USER_AGENT, USER_AGENT)
    }

    async fn send(&mut self, request: Request<Full<Bytes>>) -> DockerResult<Response<Incoming>> {
        self.sender.ready().await?;
        Ok(self.sender.send_request(request).await?)
    }
}

#[async_trait]
impl RuntimeClient for DockerClient {
    async fn list_containers(&mut self, filter: &ContainerFilter) -> ApiResult<Vec<ContainerSummary>> {
        Ok(self.containers(filter).await?)
    }

    async fn attach(
        self: Box<Self>,
        container_id: &str,
        options: AttachOptions,
        io: RunIo,
    ) -> ApiResult<()> {
        Ok((*self).attach_to(container_id, options, io).await?)
    }
}

/// Copy stdin to the stream and the stream to stdout/stderr. Ends when the
/// container's output ends; stdin reaching EOF half-closes the stream.
async fn pump<S>(stream: S, raw_terminal: bool, io: RunIo) -> DockerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let RunIo {
        mut stdin,
        mut stdout,
        mut stderr,
    } = io;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let input = async {
        if let Err(e) = tokio::io::copy(&mut stdin, &mut writer).await {
            debug!(error = %e, "stdin copy ended");
        }
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "failed to half-close attach stream");
        }
    };
    let output = async {
        if raw_terminal {
            tokio::io::copy(&mut reader, &mut stdout).await?;
            stdout.flush().await?;
        } else {
            demux(&mut reader, &mut stdout, &mut stderr).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    tokio::pin!(input, output);

    let result = tokio::select! {
        result = &mut output => result,
        () = &mut input => (&mut output).await,
    };
    Ok(result?)
}

fn flag(on: bool) -> &'static str {
    if on { "1" } else { "0" }
}

fn status_error(status: StatusCode, body: &[u8]) -> DockerError {
    let message = serde_json::from_slice::<DockerMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    DockerError::Status {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_message_is_extracted() {
        let err = status_error(
            StatusCode::NOT_FOUND,
            br#"{"message":"No such container: c1"}"#,
        );
        assert!(matches!(
            err,
            DockerError::Status { status: 404, ref message } if message == "No such container: c1"
        ));

        let err = status_error(StatusCode::BAD_GATEWAY, b"upstream down\n");
        assert!(matches!(
            err,
            DockerError::Status { status: 502, ref message } if message == "upstream down"
        ));
    }

    #[test]
    fn null_labels_become_empty() {
        let containers: Vec<DockerContainer> =
            serde_json::from_str(r#"[{"Id":"c1","Labels":null,"State":"running"}]"#).unwrap();
        let summary = ContainerSummary::from(containers.into_iter().next().unwrap());
        assert_eq!(summary.id, "c1");
        assert!(summary.labels.is_empty());
        assert_eq!(summary.state, "running");
    }
}
