use std::io::{BufRead, BufReader};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::config::settings::WeaveSettings;
use crate::engine::backend::Backend;
use crate::engine::protocol::{collect_outputs, CancelToken, ExecuteRequest, KernelMessage};
use crate::error::BackendError;
use crate::model::chunk::CodeChunk;
use crate::model::output::{render_inline, Output};

#[derive(Serialize)]
struct StartKernelRequest {
    name: String,
}

#[derive(Deserialize)]
struct StartKernelResponse {
    id: String,
}

/// A kernel reached through an HTTP gateway.
///
/// `POST /api/kernels` starts a kernel, `POST /api/kernels/{id}/execute`
/// answers with a newline-delimited JSON stream of kernel messages,
/// `POST /api/kernels/{id}/interrupt` interrupts it and
/// `DELETE /api/kernels/{id}` shuts it down.
pub struct HttpKernel {
    client: Client,
    base_url: String,
    kernel_name: String,
    introspect_template: String,
    figure_setup: Option<String>,
    kernel_id: Option<String>,
    next_msg: u64,
    cancel: CancelToken,
    /// Per-call deadline, also used for introspection and figure setup.
    timeout: Option<Duration>,
    /// Stream readers that may still be draining an abandoned response.
    readers: Vec<JoinHandle<()>>,
}

/// Extra time a stream reader gets past the call deadline before the HTTP
/// request itself is dropped.
const READER_GRACE: Duration = Duration::from_secs(5);

impl HttpKernel {
    pub fn new(settings: &WeaveSettings) -> Result<Self, BackendError> {
        // Per-call deadlines are enforced by the collection loop.
        let client = Client::builder().timeout(None::<Duration>).build()?;

        Ok(Self {
            client,
            base_url: settings.kernel_url.trim_end_matches('/').to_string(),
            kernel_name: settings.kernel_name.clone(),
            introspect_template: settings.introspect_template.clone(),
            figure_setup: settings.figure_setup.clone(),
            kernel_id: None,
            next_msg: 0,
            cancel: CancelToken::default(),
            timeout: settings.timeout(),
            readers: Vec::new(),
        })
    }

    /// Raise to abandon the request currently being collected.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn kernel_url(&self, action: &str) -> Result<String, BackendError> {
        let id = self.kernel_id.as_deref().ok_or(BackendError::NotOpen)?;
        Ok(kernel_endpoint(&self.base_url, id, action))
    }

    fn reap_readers(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) =
            self.readers.drain(..).partition(|handle| handle.is_finished());
        for handle in done {
            if handle.join().is_err() {
                log::warn!("Kernel stream reader panicked");
            }
        }
        self.readers = running;
    }

    fn next_msg_id(&mut self) -> String {
        self.next_msg += 1;
        format!("{}-{}", self.kernel_id.as_deref().unwrap_or("kernel"), self.next_msg)
    }
}

fn kernel_endpoint(base_url: &str, id: &str, action: &str) -> String {
    if action.is_empty() {
        format!("{}/api/kernels/{}", base_url, id)
    } else {
        format!("{}/api/kernels/{}/{}", base_url, id, action)
    }
}

fn figure_setup_code(template: &str, chunk: &CodeChunk) -> String {
    let (width, height) = chunk.options.f_size.unwrap_or((6, 4));
    template
        .replace("{width}", &width.to_string())
        .replace("{height}", &height.to_string())
        .replace("{dpi}", &chunk.options.dpi.unwrap_or(200).to_string())
}

impl Backend for HttpKernel {
    fn open(&mut self) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(format!("{}/api/kernels", self.base_url))
            .json(&StartKernelRequest { name: self.kernel_name.clone() })
            .send()?
            .error_for_status()?
            .json::<StartKernelResponse>()?;

        log::info!("Started {} kernel {}", self.kernel_name, resp.id);
        self.kernel_id = Some(resp.id);
        self.cancel.reset();
        Ok(())
    }

    fn evaluate(&mut self, code: &str, timeout: Option<Duration>) -> Result<Vec<Output>, BackendError> {
        let url = self.kernel_url("execute")?;
        let msg_id = self.next_msg_id();
        self.reap_readers();

        let mut request = self.client.post(url).json(&ExecuteRequest {
            msg_id: msg_id.clone(),
            code: code.trim_start().to_string(),
            silent: false,
        });
        // Bounds the whole exchange, body included, so an abandoned stream
        // is dropped and its reader ends.
        if let Some(timeout) = timeout {
            request = request.timeout(timeout + READER_GRACE);
        }
        let resp = request.send()?.error_for_status()?;

        let (tx, rx) = mpsc::channel::<KernelMessage>();
        let reader = thread::spawn(move || {
            for line in BufReader::new(resp).lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<KernelMessage>(&line) {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Discarding unreadable kernel message: {}", e),
                }
            }
        });

        let result = collect_outputs(&rx, &msg_id, timeout, &self.cancel);
        drop(rx);
        if result.is_ok() && reader.is_finished() {
            let _ = reader.join();
        } else {
            self.readers.push(reader);
        }
        result
    }

    fn introspect(&mut self, symbol: &str) -> Result<String, BackendError> {
        let code = self.introspect_template.replace("{symbol}", symbol);
        let outputs = self.evaluate(&code, self.timeout)?;

        if let Some(Output::Error { ename, evalue, .. }) =
            outputs.iter().find(|o| matches!(o, Output::Error { .. }))
        {
            return Err(BackendError::Protocol(format!(
                "cannot fetch source of `{}`: {}: {}",
                symbol, ename, evalue
            )));
        }

        Ok(render_inline(&outputs))
    }

    fn interrupt(&mut self) -> Result<(), BackendError> {
        let url = self.kernel_url("interrupt")?;
        log::warn!("Interrupting kernel");
        self.client.post(url).send()?.error_for_status()?;
        Ok(())
    }

    fn pre_run_hook(&mut self, chunk: &CodeChunk) -> Result<(), BackendError> {
        if let Some(template) = self.figure_setup.clone() {
            self.evaluate(&figure_setup_code(&template, chunk), self.timeout)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        let Some(id) = self.kernel_id.take() else {
            return Ok(());
        };
        self.client
            .delete(kernel_endpoint(&self.base_url, &id, ""))
            .send()?
            .error_for_status()?;
        log::info!("Shut down kernel {}", id);

        self.reap_readers();
        if !self.readers.is_empty() {
            log::debug!("{} kernel stream readers still draining", self.readers.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::options::ChunkOptions;

    #[test]
    fn builds_kernel_endpoints() {
        assert_eq!(
            kernel_endpoint("http://localhost:8888", "k1", "execute"),
            "http://localhost:8888/api/kernels/k1/execute"
        );
        assert_eq!(
            kernel_endpoint("http://localhost:8888", "k1", ""),
            "http://localhost:8888/api/kernels/k1"
        );
    }

    #[test]
    fn figure_setup_uses_chunk_size_and_dpi() {
        let chunk = CodeChunk::new(
            0,
            "plot()",
            ChunkOptions { f_size: Some((8, 5)), dpi: Some(120), ..ChunkOptions::default() },
        );
        let code = figure_setup_code("figsize=({width}, {height}); dpi={dpi}", &chunk);
        assert_eq!(code, "figsize=(8, 5); dpi=120");
    }

    #[test]
    fn evaluate_before_open_is_refused() {
        let mut kernel = HttpKernel::new(&WeaveSettings::default()).unwrap();
        assert!(matches!(kernel.evaluate("x", None), Err(BackendError::NotOpen)));
        assert!(kernel.close().is_ok());
    }

    #[test]
    fn configured_timeout_bounds_every_kernel_call() {
        let settings = WeaveSettings {
            timeout_secs: Some(7),
            ..WeaveSettings::default()
        };
        let kernel = HttpKernel::new(&settings).unwrap();
        assert_eq!(kernel.timeout, Some(Duration::from_secs(7)));

        let unbounded = HttpKernel::new(&WeaveSettings::default()).unwrap();
        assert_eq!(unbounded.timeout, None);
    }

    #[test]
    fn introspection_gives_up_at_the_call_deadline() {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        // A gateway that accepts the execute request and never finishes it.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\n\r\n",
                );
                thread::sleep(Duration::from_secs(10));
            }
        });

        let settings = WeaveSettings {
            kernel_url: format!("http://{}", addr),
            timeout_secs: Some(1),
            ..WeaveSettings::default()
        };
        let mut kernel = HttpKernel::new(&settings).unwrap();
        kernel.kernel_id = Some("k1".into());

        let err = kernel.introspect("setup").unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
        assert_eq!(kernel.readers.len(), 1);
    }

    #[test]
    fn cancel_token_is_shared() {
        let kernel = HttpKernel::new(&WeaveSettings::default()).unwrap();
        let token = kernel.cancel_token();
        token.cancel();
        assert!(kernel.cancel.is_cancelled());
    }
}
