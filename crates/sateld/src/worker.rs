use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use satele_core::config::AppConfig;
use satele_core::error::SateleError;
use satele_core::types::{upload_result, Task};
use tracing::{error, info, warn};

use crate::executor::ShellExecutor;
use crate::intent_router::{route, DirectCommand, Route};
use crate::interpreter::{Environment, InterpretError, Interpreter};
use crate::llm_gateway::LlmGateway;
use crate::memory::RecallStore;
use crate::paths::RealFs;
use crate::plan::{parse_plan, upload_target};
use crate::postprocess::{execute_plan, truncate_result, PlanOutcome};
use crate::reasoning::ReasoningPass;
use crate::session::Session;
use crate::skills::SkillProvider;
use crate::task_source::TaskSource;

/// How one instruction should be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Handed off to another agent; nothing is reported.
    Skip,
    /// Report the acknowledgement, then restart the service.
    Restart(String),
    Text(String),
}

/// Everything the polling loop needs, built once at startup.
pub struct Bridge {
    config: AppConfig,
    executor: ShellExecutor,
    session: Session,
    interpreter: Interpreter,
    reasoning: ReasoningPass,
    task_source: TaskSource,
    memory: Option<Arc<RecallStore>>,
    fs: RealFs,
}

impl Bridge {
    pub fn new(config: AppConfig) -> Result<Self, SateleError> {
        let gateway = LlmGateway::from_config(&config);
        Self::with_gateway(config, gateway)
    }

    pub fn with_gateway(config: AppConfig, gateway: LlmGateway) -> Result<Self, SateleError> {
        std::fs::create_dir_all(config.state_dir())?;
        let memory = open_memory(&config);
        let host_home = PathBuf::from(&config.sandbox.host_home);
        let host_home = (!config.sandbox.host_home.trim().is_empty() && host_home.is_dir()).then_some(host_home);
        let session = Session::restore(config.default_cwd(), config.cwd_state_file(), host_home);
        let interpreter = Interpreter::new(
            gateway,
            SkillProvider::from_config(&config),
            memory.clone(),
            config.memory.recall_limit,
        );
        Ok(Self {
            executor: ShellExecutor::from_config(&config.tools),
            reasoning: ReasoningPass::from_config(&config.reasoning),
            task_source: TaskSource::from_config(&config.bridge)?,
            session,
            interpreter,
            memory,
            fs: RealFs,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn memory(&self) -> Option<&RecallStore> {
        self.memory.as_deref()
    }

    pub fn gateway(&self) -> &LlmGateway {
        self.interpreter.gateway()
    }

    /// Poll forever. A failed iteration is logged and followed by a longer pause.
    pub async fn run_loop(&mut self) {
        let poll = Duration::from_millis(self.config.bridge.effective_poll_interval_ms());
        let backoff = Duration::from_secs(self.config.bridge.error_backoff_seconds.max(1));
        info!(
            "polling {} every {}ms, cwd={}",
            self.task_source.base_url(),
            poll.as_millis(),
            self.session.cwd().display()
        );
        loop {
            match self.run_once().await {
                Ok(_) => tokio::time::sleep(poll).await,
                Err(err) => {
                    error!("poll iteration failed: {err}");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Fetch and fully handle at most one task. Returns whether a task was found.
    pub async fn run_once(&mut self) -> Result<bool, SateleError> {
        let Some(task) = self.task_source.fetch_next().await? else {
            return Ok(false);
        };
        self.handle_task(&task).await;
        Ok(true)
    }

    pub async fn handle_task(&mut self, task: &Task) {
        info!(
            "new task task_id={} source={} instruction={}",
            task.id,
            task.source.as_deref().unwrap_or("-"),
            task.instruction
        );
        let media = task.media().map(PathBuf::from);
        match self.respond(&task.instruction, media.as_deref()).await {
            Reply::Skip => info!("handoff task_id={}: left for another agent", task.id),
            Reply::Restart(ack) => {
                self.task_source.report(&task.id, &ack).await;
                self.trigger_restart().await;
            }
            Reply::Text(output) => {
                self.task_source.report(&task.id, &output).await;
            }
        }
    }

    /// Route one instruction and produce its reply without touching the task source.
    pub async fn respond(&mut self, instruction: &str, media: Option<&Path>) -> Reply {
        let decision = route(
            instruction,
            media.is_some(),
            &self.config.bridge.handoff_marker,
        );
        let text = match decision {
            Route::Handoff => return Reply::Skip,
            Route::Restart => {
                info!("restart requested");
                return Reply::Restart(format!(
                    "Restarting {}. I will be back in a moment...",
                    self.config.bridge.bot_name
                ));
            }
            Route::Update => {
                info!("update requested");
                let out = self.run_control("gitpull").await;
                format!("System Update:\n{out}")
            }
            Route::Status => {
                info!("status requested");
                let out = self.run_control("status").await;
                format!("System Status:\n{out}")
            }
            Route::RunCommand(cmd) => {
                self.run_direct(
                    cmd,
                    "Shell Execution",
                    "No command specified. Try 'run command - satele help'.",
                )
                .await
            }
            Route::Printout(cmd) => {
                self.run_direct(
                    cmd,
                    "Shell Printout",
                    "No command specified for printout. Try 'send me printout - satele help'.",
                )
                .await
            }
            Route::RawShell(cmd) => self.run_raw(&cmd).await,
            Route::Pipeline => self.process_instruction(instruction, media).await,
        };
        Reply::Text(truncate_result(&text, self.config.tools.max_result_chars))
    }

    /// Plain executor run in the session directory.
    pub async fn shell(&self, cmd: &str) -> String {
        self.executor.run(cmd, self.session.cwd()).await
    }

    /// `sh:` bypass. An `UPLOAD:` answer from the command itself is passed through.
    pub async fn run_raw(&self, cmd: &str) -> String {
        info!("raw shell: {cmd}");
        let out = self.shell(cmd).await;
        if upload_target(&out).is_some() {
            return out.trim().to_string();
        }
        format!("Executing Raw: {cmd}\n---\n{out}")
    }

    /// Interpreter, then plan execution, then the optional reasoning pass.
    pub async fn process_instruction(&mut self, instruction: &str, media: Option<&Path>) -> String {
        let home = self.session.home_dir();
        let cwd = self.session.cwd().to_path_buf();
        let env = Environment {
            cwd: &cwd,
            home: &home,
            host_home: self.session.host_home(),
            bot_name: &self.config.bridge.bot_name,
        };
        let lines = match self.interpreter.interpret(instruction, media, &env).await {
            Ok(lines) => lines,
            Err(err) => {
                warn!("interpretation failed: {err}");
                return fallback_message(instruction, Some(&err));
            }
        };
        let plan = parse_plan(&lines);
        if plan.is_empty() {
            return fallback_message(instruction, None);
        }
        info!("plan: {lines:?}");
        match execute_plan(&plan, &mut self.session, &self.executor, &self.fs).await {
            PlanOutcome::Upload(path) => upload_result(&path.to_string_lossy()),
            PlanOutcome::Failed(msg) => msg,
            PlanOutcome::Completed(output) => {
                if self.reasoning.should_run(instruction, &output) {
                    self.reasoning
                        .analyze(self.interpreter.gateway(), instruction, &output)
                        .await
                } else {
                    output
                }
            }
        }
    }

    async fn run_direct(&self, cmd: DirectCommand, label: &str, missing: &str) -> String {
        match cmd {
            DirectCommand::Control(sub) => {
                let out = self.run_control(&sub).await;
                format!("Satele Printout ({sub}):\n{out}")
            }
            DirectCommand::Shell(cmd) => {
                info!("direct command: {cmd}");
                let out = self.executor.run(&cmd, self.session.cwd()).await;
                format!("{label}:\n{out}")
            }
            DirectCommand::Missing => missing.to_string(),
        }
    }

    async fn run_control(&self, sub: &str) -> String {
        let script = self.config.control_script();
        let cmd = format!("\"{}\" {sub}", script.display());
        self.executor.run(cmd.trim(), self.session.cwd()).await
    }

    /// Detached so the reply is already delivered when the service goes down.
    async fn trigger_restart(&self) {
        let script = self.config.control_script();
        let script = script.display();
        let cmd = format!(
            "nohup bash -c 'sleep 2; \"{script}\" stop; \"{script}\" start' > /dev/null 2>&1 &"
        );
        let out = self.executor.run(&cmd, self.session.cwd()).await;
        info!("restart scheduled: {out}");
    }
}

fn open_memory(config: &AppConfig) -> Option<Arc<RecallStore>> {
    if !config.memory.enabled {
        return None;
    }
    let path = PathBuf::from(&config.memory.sqlite_path);
    match RecallStore::open(&path, config.memory.item_max_chars) {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            warn!("recall store unavailable at {}: {err}", path.display());
            None
        }
    }
}

fn fallback_message(instruction: &str, err: Option<&InterpretError>) -> String {
    // backend errors stay in the logs
    let detail = match err {
        Some(InterpretError::NoBackend) => " (no language model configured)",
        Some(InterpretError::Backend(_)) => " (model unavailable, see logs)",
        None => "",
    };
    format!(
        "I received: '{instruction}'. I couldn't safely translate this to commands{detail}. Try 'sh: <command>'."
    )
}
