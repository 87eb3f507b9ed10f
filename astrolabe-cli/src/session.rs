//! Conversation state and the interactive stdin loop.

use crate::error::CliError;
use astrolabe_core::model::ModelClient;
use astrolabe_core::types::{ChatMessage, MessageRole};
use astrolabe_core::{AgentRoundTripController, RoundTripOutcome, ToolOrchestrator};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// History carried from one turn to the next.
#[derive(Debug, Clone)]
pub struct Session {
    history: Vec<ChatMessage>,
}

impl Session {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let mut session = Self {
            history: Vec::new(),
        };
        session.set_system_prompt(system_prompt);
        session
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Replace the leading system message, keeping the rest of the history.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        if self
            .history
            .first()
            .is_some_and(|message| message.role == MessageRole::System)
        {
            self.history.remove(0);
        }
        if !prompt.trim().is_empty() {
            self.history.insert(0, ChatMessage::system(prompt));
        }
    }

    /// Drop everything except the system message.
    pub fn reset(&mut self) {
        self.history
            .retain(|message| message.role == MessageRole::System);
    }

    /// Run one user turn. On a model error the history is left untouched.
    pub async fn ask(
        &mut self,
        input: &str,
        controller: &AgentRoundTripController,
        model: &dyn ModelClient,
        orchestrator: &ToolOrchestrator,
    ) -> Result<RoundTripOutcome, CliError> {
        let mut messages = self.history.clone();
        messages.push(ChatMessage::user(input));
        let outcome = controller
            .run(messages, model, orchestrator.registry())
            .await?;
        self.history = outcome.messages.clone();
        Ok(outcome)
    }
}

/// Combine the user's own system text with the orchestrator's tool guidance.
pub fn compose_system_prompt(extra: Option<&str>, guidance: &str) -> String {
    match extra.map(str::trim).filter(|text| !text.is_empty()) {
        Some(extra) => format!("{extra}\n\n{guidance}"),
        None => guidance.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Tools,
    Servers,
    Reset,
    Help,
    Exit,
    Unknown(String),
}

impl Command {
    /// `None` when the line is a prompt rather than a command.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let name = line.strip_prefix('/').or_else(|| line.strip_prefix(':'))?;
        let name = name.split_whitespace().next().unwrap_or_default();
        Some(match name.to_ascii_lowercase().as_str() {
            "tools" => Command::Tools,
            "servers" => Command::Servers,
            "reset" | "clear" => Command::Reset,
            "help" | "?" => Command::Help,
            "exit" | "quit" | "q" => Command::Exit,
            other => Command::Unknown(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}

/// Read prompts and commands until EOF or `/exit`.
pub async fn run_loop<R, W>(
    input: R,
    output: &mut W,
    session: &mut Session,
    system_extra: Option<&str>,
    controller: &AgentRoundTripController,
    model: &dyn ModelClient,
    orchestrator: &mut ToolOrchestrator,
) -> Result<(), CliError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    print_banner(output, controller.model(), orchestrator).await?;
    let mut lines = input.lines();

    loop {
        output.write_all(b"> ").await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = Command::parse(line) {
            let control =
                handle_command(command, output, session, system_extra, orchestrator).await?;
            if control == LoopControl::Exit {
                break;
            }
            continue;
        }

        match session.ask(line, controller, model, orchestrator).await {
            Ok(outcome) => print_outcome(output, &outcome).await?,
            Err(CliError::Model(err)) => {
                warn!(error = %err, "Model request failed");
                write_line(output, &format!("error: {}", err.user_message())).await?;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

async fn handle_command<W>(
    command: Command,
    output: &mut W,
    session: &mut Session,
    system_extra: Option<&str>,
    orchestrator: &mut ToolOrchestrator,
) -> Result<LoopControl, CliError>
where
    W: AsyncWrite + Unpin,
{
    match command {
        Command::Tools => {
            orchestrator.refresh_tools().await;
            session.set_system_prompt(compose_system_prompt(
                system_extra,
                &orchestrator.system_prompt(),
            ));
            let catalogue = orchestrator.registry().get_all_tools();
            if catalogue.values().all(Vec::is_empty) {
                write_line(output, "No tools available.").await?;
            }
            for (server, tools) in catalogue {
                for tool in tools {
                    write_line(output, &format!("  {server}.{}  {}", tool.name, tool.description))
                        .await?;
                }
            }
        }
        Command::Servers => {
            let statuses = orchestrator.server_status().await;
            if statuses.is_empty() {
                write_line(output, "No tool servers configured.").await?;
            }
            for status in statuses {
                let state = match (status.running, status.connected) {
                    (true, true) => "connected",
                    (true, false) => "running, not connected",
                    (false, _) => "stopped",
                };
                write_line(
                    output,
                    &format!("  {}  {state}  ({} tools)", status.id, status.tools),
                )
                .await?;
            }
        }
        Command::Reset => {
            session.reset();
            write_line(output, "Conversation cleared.").await?;
        }
        Command::Help => print_help(output).await?,
        Command::Exit => return Ok(LoopControl::Exit),
        Command::Unknown(name) => {
            write_line(output, &format!("Unknown command '/{name}'. Type /help.")).await?;
        }
    }
    Ok(LoopControl::Continue)
}

/// Tool activity first, then the answer.
pub async fn print_outcome<W>(output: &mut W, outcome: &RoundTripOutcome) -> Result<(), CliError>
where
    W: AsyncWrite + Unpin,
{
    for tool in &outcome.outcomes {
        let status = if tool.is_success() { "ok" } else { "failed" };
        write_line(output, &format!("  [{}] {status}", tool.tool_name())).await?;
    }
    write_line(output, &outcome.content).await
}

async fn print_banner<W>(
    output: &mut W,
    model: &str,
    orchestrator: &ToolOrchestrator,
) -> Result<(), CliError>
where
    W: AsyncWrite + Unpin,
{
    let servers = orchestrator.registry().server_ids().len();
    write_line(
        output,
        &format!("astrolabe | model {model} | {servers} tool server(s) connected"),
    )
    .await?;
    write_line(output, "Type a message, or /help for commands.").await
}

async fn print_help<W>(output: &mut W) -> Result<(), CliError>
where
    W: AsyncWrite + Unpin,
{
    for line in [
        "/tools    refresh and list available tools",
        "/servers  show tool server status",
        "/reset    forget the conversation so far",
        "/exit     stop all servers and quit",
    ] {
        write_line(output, line).await?;
    }
    Ok(())
}

async fn write_line<W>(output: &mut W, text: &str) -> Result<(), CliError>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
