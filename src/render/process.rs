use super::{PageStatus, RenderPage, Renderer, RendererHandle, SecurityOptions};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Renderer subprocess driven by one JSON command per line on stdin, with one
/// JSON reply per line on stdout.
pub struct ProcessRenderer {
    program: String,
    args: Vec<String>,
}

impl ProcessRenderer {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

fn security_flags(options: &SecurityOptions) -> Vec<String> {
    vec![
        format!("--web-security={}", options.web_security),
        format!("--local-file-access={}", options.local_file_access),
        format!("--ignore-ssl-errors={}", options.ignore_ssl_errors),
    ]
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
enum RendererCommand<'a> {
    CreatePage,
    Set {
        page: u32,
        key: &'a str,
        value: serde_json::Value,
    },
    Open {
        page: u32,
        path: &'a Path,
    },
    Render {
        page: u32,
        path: &'a Path,
        quality: u8,
    },
    Close {
        page: u32,
    },
    Exit,
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    command: &'a RendererCommand<'a>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    id: Option<u64>,
    ok: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

struct Channel {
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl Channel {
    async fn send(&mut self, command: &RendererCommand<'_>) -> Result<u64> {
        self.next_id += 1;
        let id = self.next_id;

        let mut line = serde_json::to_string(&Envelope { id, command })?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(id)
    }

    async fn call(&mut self, command: &RendererCommand<'_>) -> Result<Reply> {
        let id = self.send(command).await?;

        loop {
            let line = self
                .lines
                .next_line()
                .await?
                .ok_or_else(|| Error::RenderFailed("Renderer closed its output".to_string()))?;

            let reply: Reply = serde_json::from_str(&line).map_err(|e| {
                Error::RenderFailed(format!("Malformed renderer reply '{}': {}", line, e))
            })?;

            // Replies to commands abandoned by a timeout may still arrive,
            // and a reply without an id answers nothing.
            if reply.id != Some(id) {
                debug!("Skipping stale renderer reply {:?}", reply.id);
                continue;
            }

            if !reply.ok {
                return Err(Error::RenderFailed(
                    reply
                        .error
                        .unwrap_or_else(|| "Renderer reported an error".to_string()),
                ));
            }
            return Ok(reply);
        }
    }
}

#[async_trait]
impl Renderer for ProcessRenderer {
    async fn create(&self, options: &SecurityOptions) -> Result<Box<dyn RendererHandle>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(security_flags(options))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::RenderFailed(format!("Failed to start renderer '{}': {}", self.program, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("Renderer stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("Renderer stdout was not captured".to_string()))?;

        debug!("Started renderer '{}' (pid {:?})", self.program, child.id());

        Ok(Box::new(ProcessHandle {
            channel: Arc::new(Mutex::new(Channel {
                stdin,
                lines: BufReader::new(stdout).lines(),
                next_id: 0,
            })),
            child: Mutex::new(child),
        }))
    }
}

struct ProcessHandle {
    channel: Arc<Mutex<Channel>>,
    child: Mutex<Child>,
}

#[async_trait]
impl RendererHandle for ProcessHandle {
    async fn create_page(&self) -> Result<Box<dyn RenderPage>> {
        let reply = self
            .channel
            .lock()
            .await
            .call(&RendererCommand::CreatePage)
            .await?;
        let id = reply
            .page
            .ok_or_else(|| Error::RenderFailed("Renderer returned no page id".to_string()))?;

        Ok(Box::new(ProcessPage {
            id,
            channel: self.channel.clone(),
        }))
    }

    async fn exit(&self) -> Result<()> {
        if let Err(e) = self.channel.lock().await.send(&RendererCommand::Exit).await {
            debug!("Renderer exit command not delivered: {}", e);
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(status) => {
                debug!("Renderer exited with {}", status?);
                Ok(())
            }
            Err(_) => {
                warn!("Renderer ignored exit, killing it");
                child.kill().await?;
                Ok(())
            }
        }
    }
}

struct ProcessPage {
    id: u32,
    channel: Arc<Mutex<Channel>>,
}

#[async_trait]
impl RenderPage for ProcessPage {
    async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        let command = RendererCommand::Set {
            page: self.id,
            key: "viewportSize",
            value: serde_json::json!({ "width": width, "height": height }),
        };
        self.channel.lock().await.call(&command).await?;
        Ok(())
    }

    async fn open(&self, document: &Path) -> Result<PageStatus> {
        let command = RendererCommand::Open {
            page: self.id,
            path: document,
        };
        let reply = self.channel.lock().await.call(&command).await?;

        match reply.status.as_deref() {
            Some("success") => Ok(PageStatus::Success),
            Some(other) => Ok(PageStatus::Failed(other.to_string())),
            None => Ok(PageStatus::Failed("no status".to_string())),
        }
    }

    async fn render(&self, output: &Path, quality: u8) -> Result<()> {
        let command = RendererCommand::Render {
            page: self.id,
            path: output,
            quality,
        };
        self.channel.lock().await.call(&command).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .lock()
            .await
            .call(&RendererCommand::Close { page: self.id })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let command = RendererCommand::Set {
            page: 2,
            key: "viewportSize",
            value: serde_json::json!({ "width": 10, "height": 20 }),
        };
        let json = serde_json::to_value(Envelope {
            id: 7,
            command: &command,
        })
        .unwrap();

        assert_eq!(json["id"], 7);
        assert_eq!(json["cmd"], "set");
        assert_eq!(json["page"], 2);
        assert_eq!(json["value"]["height"], 20);

        let json = serde_json::to_value(Envelope {
            id: 1,
            command: &RendererCommand::CreatePage,
        })
        .unwrap();
        assert_eq!(json["cmd"], "createPage");
    }

    #[test]
    fn test_security_flags() {
        let flags = security_flags(&SecurityOptions::default());
        assert!(flags.contains(&"--web-security=true".to_string()));
        assert!(flags.contains(&"--ignore-ssl-errors=false".to_string()));
    }

    #[tokio::test]
    async fn test_missing_program_is_render_failure() {
        let renderer = ProcessRenderer::new("definitely-not-a-renderer-binary".to_string(), vec![]);
        let err = renderer
            .create(&SecurityOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::RenderFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_drives_line_protocol_over_stdio() {
        let script = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed 's/^{"id":\([0-9]*\).*$/\1/')
  case "$line" in
    *'"cmd":"exit"'*) exit 0 ;;
    *'"cmd":"open"'*) echo "{\"id\":$id,\"ok\":true,\"status\":\"success\"}" ;;
    *) echo "{\"id\":$id,\"ok\":true,\"page\":1}" ;;
  esac
done"#;
        let renderer =
            ProcessRenderer::new("sh".to_string(), vec!["-c".to_string(), script.to_string()]);

        let handle = renderer.create(&SecurityOptions::default()).await.unwrap();
        let page = handle.create_page().await.unwrap();
        page.set_viewport(800, 600).await.unwrap();
        assert_eq!(
            page.open(Path::new("/tmp/doc.html")).await.unwrap(),
            PageStatus::Success
        );
        page.close().await.unwrap();
        handle.exit().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_only_reply_with_matching_id_answers_command() {
        // For open, a reply with no id and one with a foreign id arrive first,
        // both claiming failure.
        let script = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed 's/^{"id":\([0-9]*\).*$/\1/')
  case "$line" in
    *'"cmd":"exit"'*) exit 0 ;;
    *'"cmd":"open"'*)
      echo '{"ok":true,"status":"fail"}'
      echo '{"id":999,"ok":false,"error":"stale"}'
      echo "{\"id\":$id,\"ok\":true,\"status\":\"success\"}" ;;
    *) echo "{\"id\":$id,\"ok\":true,\"page\":1}" ;;
  esac
done"#;
        let renderer =
            ProcessRenderer::new("sh".to_string(), vec!["-c".to_string(), script.to_string()]);

        let handle = renderer.create(&SecurityOptions::default()).await.unwrap();
        let page = handle.create_page().await.unwrap();
        assert_eq!(
            page.open(Path::new("/tmp/doc.html")).await.unwrap(),
            PageStatus::Success
        );
        page.close().await.unwrap();
        handle.exit().await.unwrap();
    }
}
