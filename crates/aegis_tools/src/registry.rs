//! Name → async-handler tool dispatch.
//!
//! Handlers share one function shape: `(args: JSON map) → future<String>`.
//! `call` is total — unknown tools, handler failures, and timeouts all come
//! back as in-band `"Error: …"` strings, never as `Err`. Feature gates
//! (web access, code execution) are evaluated once, at construction; a
//! registry never re-reads configuration or the environment afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aegis_proto::config::AssistantConfig;
use chrono::Local;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};

use crate::collab::{KnowledgeBase, PeerClient, WebClient};
use crate::eval::{format_number, safe_eval};
use crate::sandbox::CodeSandbox;

pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// Environment gate for `code_exec`; both this and
/// `assistant.allow_code_exec` must be set for the sandbox to exist.
pub const CODE_EXEC_ENV_GATE: &str = "AEGIS_ENABLE_CODE_EXEC";

const BLOCKED_NOTICE: &str = "Access disabled by configuration.";
const DOMAIN_BLOCKED_NOTICE: &str = "Error: domain not allowed by configuration.";
const CODE_EXEC_DISABLED_NOTICE: &str = "code_exec disabled by configuration. \
    Set assistant.allow_code_exec: true and AEGIS_ENABLE_CODE_EXEC=1 to enable.";

fn url_host(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = authority.rsplit('@').next().unwrap_or("");
    let host = host.split(':').next().unwrap_or("");
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Domain allow-list check for fetches. An empty list allows any domain;
/// otherwise the URL host must equal an entry or be a subdomain of one.
/// A URL with no parseable host is refused outright.
fn domain_allowed(url: &str, allow: &[String]) -> bool {
    if allow.is_empty() {
        return true;
    }
    let Some(host) = url_host(url) else {
        return false;
    };
    allow.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        host == entry || host.ends_with(&format!(".{entry}"))
    })
}

fn str_arg(args: &Value, key: &str) -> String {
    args.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn str_arg_or(args: &Value, key: &str, default: &str) -> String {
    match args.get(key).and_then(Value::as_str) {
        Some(s) => s.to_string(),
        None => default.to_string(),
    }
}

fn k_arg(args: &Value, default: usize) -> usize {
    args.get("k").and_then(Value::as_u64).map(|k| k as usize).unwrap_or(default)
}

pub struct ToolRegistry {
    tools: HashMap<String, ToolHandler>,
    timeout: Duration,
}

impl ToolRegistry {
    /// Build the registry for this node.
    ///
    /// `web` is the outbound-web collaborator; without one (or with
    /// `allow_web_search` off) the web tools become blocked stubs. When
    /// `allow_domains` is non-empty, fetches are refused here before the
    /// collaborator ever sees the URL.
    /// `peer` enables in-session delegation tools; the session executor
    /// always passes `None` here so remote tasks cannot fan out further.
    pub fn new(
        kb: Arc<dyn KnowledgeBase>,
        web: Option<Arc<dyn WebClient>>,
        cfg: &AssistantConfig,
        peer: Option<Arc<dyn PeerClient>>,
    ) -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
            timeout: Duration::from_secs(cfg.tool_timeout_sec),
        };

        registry.register("now", |_args| {
            async { Ok(Local::now().format("%Y-%m-%d %H:%M:%S").to_string()) }.boxed()
        });

        registry.register("calc", |args| {
            async move {
                let expr = str_arg(&args, "expr");
                Ok(match safe_eval(&expr) {
                    Ok(v) => format_number(v),
                    Err(e) => format!("Error: {e}"),
                })
            }
            .boxed()
        });

        registry.register("none", |_args| async { Ok(String::new()) }.boxed());

        let web = if cfg.allow_web_search { web } else { None };
        match web {
            Some(web) => {
                let w = web.clone();
                registry.register("search_web", move |args| {
                    let w = w.clone();
                    async move { w.search(&str_arg(&args, "query"), k_arg(&args, 5)).await }.boxed()
                });

                let w = web.clone();
                let fetch_domains = cfg.allow_domains.clone();
                registry.register("fetch_url", move |args| {
                    let w = w.clone();
                    let allow = fetch_domains.clone();
                    async move {
                        let url = str_arg(&args, "url");
                        if !domain_allowed(&url, &allow) {
                            return Ok(DOMAIN_BLOCKED_NOTICE.to_string());
                        }
                        w.fetch(&url).await
                    }
                    .boxed()
                });

                let w = web;
                let ingest_kb = kb.clone();
                let ingest_domains = cfg.allow_domains.clone();
                registry.register("ingest_url", move |args| {
                    let w = w.clone();
                    let kb = ingest_kb.clone();
                    let allow = ingest_domains.clone();
                    async move {
                        let url = str_arg(&args, "url");
                        if !domain_allowed(&url, &allow) {
                            return Ok(DOMAIN_BLOCKED_NOTICE.to_string());
                        }
                        let text = w.fetch(&url).await?;
                        let n = kb.add_document(&text, &url).await?;
                        Ok(format!("Ingested {n} chunks from {url}"))
                    }
                    .boxed()
                });
            }
            None => {
                for name in ["search_web", "fetch_url", "ingest_url"] {
                    registry.register(name, |_args| {
                        async { Ok(BLOCKED_NOTICE.to_string()) }.boxed()
                    });
                }
            }
        }

        let add_kb = kb.clone();
        registry.register("kb_add", move |args| {
            let kb = add_kb.clone();
            async move {
                let text = str_arg(&args, "text");
                let source = str_arg_or(&args, "source", "tool");
                let n = kb.add_document(&text, &source).await?;
                Ok(format!("Added {n} chunks."))
            }
            .boxed()
        });

        let query_kb = kb;
        registry.register("kb_query", move |args| {
            let kb = query_kb.clone();
            async move { kb.retrieve_context(&str_arg(&args, "query"), k_arg(&args, 3)).await }
                .boxed()
        });

        let code_exec_enabled = cfg.allow_code_exec
            && std::env::var(CODE_EXEC_ENV_GATE).as_deref() == Ok("1");
        if code_exec_enabled {
            let sandbox = Arc::new(CodeSandbox::new());
            registry.register("code_exec", move |args| {
                let sandbox = sandbox.clone();
                async move {
                    let code = str_arg(&args, "code");
                    if code.is_empty() {
                        return Ok("Error: 'code' argument required.".to_string());
                    }
                    let (stdout, stderr, returncode) = sandbox.execute(&code).await;
                    let mut parts = vec![format!("Return Code: {returncode}")];
                    if !stdout.is_empty() {
                        parts.push(format!("STDOUT:\n{stdout}"));
                    }
                    if !stderr.is_empty() {
                        parts.push(format!("STDERR:\n{stderr}"));
                    }
                    Ok(parts.join("\n").trim().to_string())
                }
                .boxed()
            });
        } else {
            registry.register("code_exec", |_args| {
                async { Ok(CODE_EXEC_DISABLED_NOTICE.to_string()) }.boxed()
            });
        }

        if let Some(peer) = peer {
            let delegate_peer = peer.clone();
            registry.register("delegate_in_session", move |args| {
                let peer = delegate_peer.clone();
                async move {
                    let sid = str_arg(&args, "session_id");
                    let tool = str_arg(&args, "tool");
                    if sid.is_empty() || tool.is_empty() {
                        return Ok("ArgError: session_id and tool required.".to_string());
                    }
                    let t_args = args.get("args").cloned().unwrap_or_else(|| json!({}));
                    peer.delegate(&sid, &tool, t_args).await
                }
                .boxed()
            });

            registry.register("kb_share_in_session", move |args| {
                let peer = peer.clone();
                async move {
                    let sid = str_arg(&args, "session_id");
                    let text = str_arg(&args, "text");
                    if sid.is_empty() || text.is_empty() {
                        return Ok("ArgError: session_id and text required.".to_string());
                    }
                    let source = str_arg_or(&args, "source", "session");
                    peer.share_text(&sid, &text, &source).await
                }
                .boxed()
            });
        }

        registry
    }

    /// Register (or replace) a handler. Embedders use this to extend the
    /// local tool set; the session executor's allow-list is unaffected.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(Value) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync + 'static,
    {
        self.tools.insert(name.to_string(), Arc::new(handler));
    }

    pub fn list_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke a tool. Total: every failure mode is an in-band string.
    pub async fn call(&self, name: &str, args: Value) -> String {
        let Some(handler) = self.tools.get(name) else {
            return format!("Error: unknown tool '{name}'");
        };
        let args = if args.is_object() { args } else { json!({}) };
        let fut = handler(args);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => format!("Error executing {name}: {e}"),
            Err(_) => format!("Error: tool '{name}' timed out"),
        }
    }
}
