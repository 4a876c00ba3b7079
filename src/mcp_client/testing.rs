//! Scripted launcher and handle for exercising the lifecycle without real
//! processes. `MockLauncher::live()` plays the role of the process table:
//! it counts handles that were started and neither terminated nor dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;

use super::errors::McpError;
use super::handle::{ServerHandle, ServerLauncher};
use super::types::{McpToolDefinition, ServerConfig, ToolCall};

/// What a mock handle does with `call_tool`.
#[derive(Debug, Clone)]
pub enum CallMode {
    /// Answer with this payload.
    Respond(serde_json::Value),
    /// Never answer; the call runs into its deadline.
    Hang,
    /// The pipe breaks and the process dies.
    BrokenPipe,
    /// Answer with a JSON-RPC error.
    Fail { code: i32, message: String },
}

/// Per-server script shared by every handle started under that name.
pub struct MockScript {
    /// Starts that fail before one succeeds. `u32::MAX` fails forever.
    pub fail_starts: AtomicU32,
    /// Startup never completes (the manager's timeout must cut it off).
    pub hang_start: AtomicBool,
    pub start_delay_ms: AtomicU64,
    pub start_calls: AtomicU32,
    pub in_flight: AtomicU32,
    pub max_in_flight: AtomicU32,
    pub ping_hangs: AtomicBool,
    pub call_mode: Mutex<CallMode>,
    pub tools: Mutex<Vec<McpToolDefinition>>,
    current: Mutex<Weak<MockHandle>>,
}

impl MockScript {
    fn new() -> Self {
        Self {
            fail_starts: AtomicU32::new(0),
            hang_start: AtomicBool::new(false),
            start_delay_ms: AtomicU64::new(0),
            start_calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            ping_hangs: AtomicBool::new(false),
            call_mode: Mutex::new(CallMode::Respond(serde_json::json!({"ok": true}))),
            tools: Mutex::new(Vec::new()),
            current: Mutex::new(Weak::new()),
        }
    }

    pub fn starts(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn set_call_mode(&self, mode: CallMode) {
        *self.call_mode.lock().unwrap() = mode;
    }

    /// Kill the most recently started handle's "process".
    pub fn crash(&self) {
        if let Some(handle) = self.current.lock().unwrap().upgrade() {
            handle.alive.store(false, Ordering::SeqCst);
        }
    }

    /// The most recently started handle, if it is still around.
    pub fn current(&self) -> Option<Arc<MockHandle>> {
        self.current.lock().unwrap().upgrade()
    }
}

/// Decrements the in-flight counter when a start finishes or is dropped.
struct InFlight<'a>(&'a MockScript);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockLauncher {
    scripts: Mutex<HashMap<String, Arc<MockScript>>>,
    live: Arc<AtomicUsize>,
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script for `name`, created on first use.
    pub fn script(&self, name: &str) -> Arc<MockScript> {
        let mut scripts = self.scripts.lock().unwrap();
        Arc::clone(
            scripts
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MockScript::new())),
        )
    }

    /// Handles started and not yet terminated or dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerLauncher for MockLauncher {
    async fn start(&self, config: Arc<ServerConfig>) -> Result<Arc<dyn ServerHandle>, McpError> {
        let script = self.script(&config.name);
        script.start_calls.fetch_add(1, Ordering::SeqCst);
        let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        script.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&script);

        let delay = script.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if script.hang_start.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let remaining = script.fail_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                script.fail_starts.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(McpError::StartupError {
                name: config.name.clone(),
                reason: "scripted startup failure".into(),
            });
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(MockHandle {
            name: config.name.clone(),
            script: Arc::clone(&script),
            tools: script.tools.lock().unwrap().clone(),
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            terminate_calls: AtomicU32::new(0),
            live: Arc::clone(&self.live),
        });
        *script.current.lock().unwrap() = Arc::downgrade(&handle);
        Ok(handle)
    }
}

pub struct MockHandle {
    name: String,
    script: Arc<MockScript>,
    tools: Vec<McpToolDefinition>,
    alive: AtomicBool,
    terminated: AtomicBool,
    pub terminate_calls: AtomicU32,
    live: Arc<AtomicUsize>,
}

impl MockHandle {
    /// A healthy handle not tied to any launcher.
    pub fn detached(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::new(MockScript::new()),
            tools: Vec::new(),
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            terminate_calls: AtomicU32::new(0),
            live: Arc::new(AtomicUsize::new(1)),
        }
    }

    /// A handle whose process has already exited.
    pub fn crashed(name: &str) -> Self {
        let handle = Self::detached(name);
        handle.alive.store(false, Ordering::SeqCst);
        handle
    }

    /// A live handle that never answers pings.
    pub fn unresponsive(name: &str) -> Self {
        let handle = Self::detached(name);
        handle.script.ping_hangs.store(true, Ordering::SeqCst);
        handle
    }

    fn broken_pipe(&self) -> McpError {
        McpError::Transport {
            server: self.name.clone(),
            reason: "broken pipe".into(),
        }
    }

    fn release(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ServerHandle for MockHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn tools(&self) -> &[McpToolDefinition] {
        &self.tools
    }

    async fn call_tool(&self, call: &ToolCall) -> Result<serde_json::Value, McpError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(self.broken_pipe());
        }
        let mode = self.script.call_mode.lock().unwrap().clone();
        match mode {
            CallMode::Respond(value) => Ok(value),
            CallMode::Hang => {
                tokio::time::sleep_until(call.deadline).await;
                Err(McpError::Timeout {
                    server: self.name.clone(),
                    tool: call.tool.clone(),
                    timeout_ms: 0,
                })
            }
            CallMode::BrokenPipe => {
                self.alive.store(false, Ordering::SeqCst);
                Err(self.broken_pipe())
            }
            CallMode::Fail { code, message } => Err(McpError::ToolFailed {
                server: self.name.clone(),
                code,
                message,
                data: None,
            }),
        }
    }

    async fn ping(&self, timeout: Duration) -> Result<(), McpError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(self.broken_pipe());
        }
        if self.script.ping_hangs.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
            return Err(McpError::Timeout {
                server: self.name.clone(),
                tool: "ping".into(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn terminate(&self) -> Result<(), McpError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        self.release();
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.release();
    }
}
