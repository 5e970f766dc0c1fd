//! Process supervisor: spawns agent children with a deterministic process
//! title, tracks pids, forwards signals, and reports exits on the event
//! bus.
//!
//! The title is set through argv[0] so an external `ps`-style listing
//! observes exactly `zmcp-<type2>-<project20>-<agent_id>`.

use nix::sys::signal::{kill, raise, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::domain::error::CoreError;
use crate::domain::models::AgentStatus;
use crate::domain::ports::{ProcessControl, ProcessSignal, SpawnSpec};
use crate::services::event_bus::{EventBus, EventPayload};

/// Fixed two-letter codes for the known agent types. Unknown types use
/// the lowercased first two characters.
fn type_abbreviation(agent_type: &str) -> String {
    match agent_type {
        "backend" => "be".to_string(),
        "frontend" => "fe".to_string(),
        "testing" => "ts".to_string(),
        "documentation" => "dc".to_string(),
        "architect" => "ar".to_string(),
        "devops" => "dv".to_string(),
        "analysis" => "an".to_string(),
        "researcher" => "rs".to_string(),
        "implementer" => "im".to_string(),
        "reviewer" => "rv".to_string(),
        other => other.chars().take(2).collect::<String>().to_lowercase(),
    }
}

/// Build the process title: `zmcp-<type2>-<project20>-<agent_id>`.
pub fn process_title(agent_type: Option<&str>, project: &str, agent_id: Uuid) -> String {
    let type2 = type_abbreviation(agent_type.unwrap_or("agent"));
    let project20: String = project.chars().take(20).collect();
    format!("zmcp-{type2}-{project20}-{agent_id}")
}

/// Identity attached to a spawned child so exits can be reported.
#[derive(Debug, Clone)]
pub struct ChildIdentity {
    pub agent_id: Uuid,
    pub repository_path: String,
    /// When set, a child killed by a signal re-raises that signal on the
    /// parent after `agent_terminated` is emitted. Only the foreground
    /// wrapper child uses this; supervised agents never do.
    pub foreground: bool,
}

pub struct ProcessSupervisor {
    bus: Arc<EventBus>,
    /// Exit codes of reaped children, by pid.
    exit_codes: Arc<Mutex<HashMap<i32, i32>>>,
    /// Live child pids, for signal forwarding.
    live: Arc<Mutex<Vec<i32>>>,
}

impl ProcessSupervisor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            exit_codes: Arc::new(Mutex::new(HashMap::new())),
            live: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn a child described by `spec` on behalf of `identity`, and
    /// monitor it until exit.
    pub async fn spawn_child(
        &self,
        spec: SpawnSpec,
        identity: ChildIdentity,
    ) -> Result<i32, CoreError> {
        let mut command = std::process::Command::new(&spec.program);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.arg0(&spec.title);
        }
        command.args(&spec.args);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command
            .env("ZMCP_AGENT_ID", identity.agent_id.to_string())
            .env("ZMCP_PROCESS_TITLE", &spec.title)
            .env("ZMCP_PROJECT_CONTEXT", &identity.repository_path);
        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }
        command.stdin(Stdio::null());

        let mut child = tokio::process::Command::from(command)
            .spawn()
            .map_err(|e| CoreError::ChildSpawn(format!("{}: {e}", spec.program)))?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or_else(|| CoreError::ChildSpawn("child pid unavailable".to_string()))?;

        self.live.lock().expect("supervisor lock poisoned").push(pid);
        tracing::info!(pid, title = %spec.title, "spawned agent child");

        let bus = Arc::clone(&self.bus);
        let exit_codes = Arc::clone(&self.exit_codes);
        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            let status = child.wait().await;
            live.lock().expect("supervisor lock poisoned").retain(|p| *p != pid);

            match status {
                Ok(status) => {
                    #[cfg(unix)]
                    let term_signal = {
                        use std::os::unix::process::ExitStatusExt;
                        status.signal()
                    };
                    #[cfg(not(unix))]
                    let term_signal: Option<i32> = None;

                    if let Some(signo) = term_signal {
                        bus.emit(EventPayload::AgentTerminated {
                            agent_id: identity.agent_id,
                            final_status: AgentStatus::Terminated,
                            reason: Some(format!("killed by signal {signo}")),
                            repository_path: identity.repository_path.clone(),
                        });
                        if identity.foreground {
                            if let Ok(signal) = Signal::try_from(signo) {
                                let _ = raise(signal);
                            }
                        }
                    } else {
                        let code = status.code().unwrap_or(-1);
                        exit_codes
                            .lock()
                            .expect("supervisor lock poisoned")
                            .insert(pid, code);
                        let final_status = if code == 0 {
                            AgentStatus::Completed
                        } else {
                            AgentStatus::Failed
                        };
                        bus.emit(EventPayload::AgentTerminated {
                            agent_id: identity.agent_id,
                            final_status,
                            reason: (code != 0).then(|| format!("exit code {code}")),
                            repository_path: identity.repository_path.clone(),
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to reap child");
                    bus.emit(EventPayload::AgentTerminated {
                        agent_id: identity.agent_id,
                        final_status: AgentStatus::Failed,
                        reason: Some(format!("wait failed: {e}")),
                        repository_path: identity.repository_path.clone(),
                    });
                }
            }
        });

        Ok(pid)
    }

    /// Exit code of a reaped child, when it exited normally.
    pub fn exit_code(&self, pid: i32) -> Option<i32> {
        self.exit_codes
            .lock()
            .expect("supervisor lock poisoned")
            .get(&pid)
            .copied()
    }

    /// Forward a signal received by the parent to every live child.
    pub fn forward_signal(&self, signal: ProcessSignal) {
        let pids: Vec<i32> = self
            .live
            .lock()
            .expect("supervisor lock poisoned")
            .clone();
        for pid in pids {
            self.signal(pid, signal);
        }
    }

    /// Run the signal forwarding loop: SIGINT/SIGTERM/SIGQUIT received by
    /// the parent are delivered to every live child.
    pub async fn forward_signals_task(self: Arc<Self>) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal as unix_signal, SignalKind};
            let Ok(mut sigint) = unix_signal(SignalKind::interrupt()) else {
                return;
            };
            let Ok(mut sigterm) = unix_signal(SignalKind::terminate()) else {
                return;
            };
            let Ok(mut sigquit) = unix_signal(SignalKind::quit()) else {
                return;
            };
            loop {
                let forwarded = tokio::select! {
                    _ = sigint.recv() => ProcessSignal::Interrupt,
                    _ = sigterm.recv() => ProcessSignal::Terminate,
                    _ = sigquit.recv() => ProcessSignal::Quit,
                };
                tracing::info!(?forwarded, "forwarding signal to children");
                self.forward_signal(forwarded);
            }
        }
    }
}

fn to_nix_signal(signal: ProcessSignal) -> Signal {
    match signal {
        ProcessSignal::Interrupt => Signal::SIGINT,
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Quit => Signal::SIGQUIT,
        ProcessSignal::Kill => Signal::SIGKILL,
    }
}

#[async_trait::async_trait]
impl ProcessControl for ProcessSupervisor {
    async fn spawn(&self, spec: SpawnSpec) -> Result<i32, CoreError> {
        // Identity travels in the env the caller prepared; fall back to a
        // nil agent when absent so ad-hoc spawns still work.
        let agent_id = spec
            .env
            .get("ZMCP_AGENT_ID")
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or_else(Uuid::nil);
        let repository_path = spec
            .env
            .get("ZMCP_PROJECT_CONTEXT")
            .cloned()
            .unwrap_or_default();
        self.spawn_child(
            spec,
            ChildIdentity {
                agent_id,
                repository_path,
                foreground: false,
            },
        )
        .await
    }

    fn is_alive(&self, pid: i32) -> bool {
        // Signal-0 probe; immediate, never blocks.
        kill(Pid::from_raw(pid), None).is_ok()
    }

    fn signal(&self, pid: i32, signal: ProcessSignal) {
        if let Err(e) = kill(Pid::from_raw(pid), to_nix_signal(signal)) {
            tracing::debug!(pid, ?signal, error = %e, "signal delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_type_abbreviations() {
        for (ty, abbr) in [
            ("backend", "be"),
            ("frontend", "fe"),
            ("testing", "ts"),
            ("documentation", "dc"),
            ("architect", "ar"),
            ("devops", "dv"),
            ("analysis", "an"),
            ("researcher", "rs"),
            ("implementer", "im"),
            ("reviewer", "rv"),
        ] {
            assert_eq!(type_abbreviation(ty), abbr);
        }
    }

    #[test]
    fn test_unknown_type_uses_first_two_chars() {
        assert_eq!(type_abbreviation("Security"), "se");
        assert_eq!(type_abbreviation("x"), "x");
    }

    #[test]
    fn test_title_contract() {
        let id = Uuid::now_v7();
        let title = process_title(Some("backend"), "myproject", id);
        assert_eq!(title, format!("zmcp-be-myproject-{id}"));
    }

    #[test]
    fn test_title_truncates_project_to_twenty() {
        let id = Uuid::now_v7();
        let title = process_title(Some("backend"), "a-very-long-project-name-indeed", id);
        assert_eq!(title, format!("zmcp-be-a-very-long-project--{id}"));
    }

    #[tokio::test]
    async fn test_spawn_reports_completion_on_bus() {
        let bus = Arc::new(EventBus::new());
        let supervisor = ProcessSupervisor::new(Arc::clone(&bus));
        let agent_id = Uuid::now_v7();

        let (_sub, mut rx) = bus
            .subscribe(crate::services::event_bus::EventKind::AgentTerminated, None)
            .unwrap();

        let pid = supervisor
            .spawn_child(
                SpawnSpec {
                    program: "true".to_string(),
                    args: vec![],
                    env: HashMap::new(),
                    title: process_title(Some("testing"), "demo", agent_id),
                    cwd: None,
                },
                ChildIdentity {
                    agent_id,
                    repository_path: "/r".to_string(),
                    foreground: false,
                },
            )
            .await
            .expect("spawn failed");
        assert!(pid > 0);

        let event = rx.recv().await.expect("no terminated event");
        match event.payload {
            EventPayload::AgentTerminated {
                agent_id: id,
                final_status,
                ..
            } => {
                assert_eq!(id, agent_id);
                assert_eq!(final_status, AgentStatus::Completed);
            }
            _ => panic!("wrong payload"),
        }
        assert_eq!(supervisor.exit_code(pid), Some(0));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_child_spawn_error() {
        let bus = Arc::new(EventBus::new());
        let supervisor = ProcessSupervisor::new(bus);
        let err = supervisor
            .spawn_child(
                SpawnSpec {
                    program: "/definitely/not/a/real/binary".to_string(),
                    args: vec![],
                    env: HashMap::new(),
                    title: "zmcp-ts-x-0".to_string(),
                    cwd: None,
                },
                ChildIdentity {
                    agent_id: Uuid::now_v7(),
                    repository_path: "/r".to_string(),
                    foreground: false,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "child_spawn");
    }

    #[test]
    fn test_is_alive_for_own_process() {
        let bus = Arc::new(EventBus::new());
        let supervisor = ProcessSupervisor::new(bus);
        let own_pid = std::process::id() as i32;
        assert!(supervisor.is_alive(own_pid));
        // pid 0 addresses the whole process group; use an unlikely pid
        assert!(!supervisor.is_alive(i32::MAX - 1));
    }
}
