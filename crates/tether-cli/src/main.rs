//! tether - terminal front-end for the tether agent runtime

mod config;
mod store;
mod tools;

use anyhow::Context as _;
use base64::Engine as _;
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_agent::{
    AgentEvent, AgentLoop, ApprovalGateway, Attachment, PendingApproval, ProviderTransport,
    TurnOutcome,
};
use tether_ai::providers::openai::OpenAIProvider;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

/// tether - an AI agent that asks before it acts
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model to use (default: gpt-4o)
    #[arg(short, long)]
    model: Option<String>,

    /// OpenAI-compatible endpoint
    #[arg(long)]
    base_url: Option<String>,

    /// Run a single prompt and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Continue a stored conversation by id
    #[arg(long)]
    resume: Option<String>,

    /// List stored conversations
    #[arg(long)]
    conversations: bool,

    /// Attach a file to the first message (repeatable)
    #[arg(long)]
    attach: Vec<PathBuf>,

    /// Command driving the browser tools
    #[arg(long)]
    browser_command: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("tether=debug,tether_agent=debug,tether_ai=debug,tether_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if args.init_config {
        let path = config::Config::init().context("creating config file")?;
        println!("Config file at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let cfg = config::Config::load();
    let model = args
        .model
        .clone()
        .or(cfg.model.clone())
        .unwrap_or_else(|| config::DEFAULT_MODEL.to_string());

    let store = Arc::new(store::JsonlStore::new(
        cfg.data_dir().join("conversations"),
        &model,
    ));

    if args.conversations {
        return list_conversations(&store);
    }

    let Some(api_key) = cfg.api_key() else {
        eprintln!("Error: No API key found");
        eprintln!();
        eprintln!("Set one with: export OPENAI_API_KEY=your-key");
        eprintln!("Or add it to the config file: tether --init-config");
        std::process::exit(1);
    };

    let mut provider = OpenAIProvider::new(api_key);
    if let Some(base_url) = args.base_url.clone().or(cfg.base_url.clone()) {
        provider = provider.with_base_url(base_url);
    }
    let transport = Arc::new(ProviderTransport::new(provider));

    let browser = args
        .browser_command
        .clone()
        .or(cfg.browser_command.clone())
        .map(|command| Arc::new(tools::CommandBrowserDriver::new(command)) as Arc<dyn tools::BrowserDriver>);
    let registry = tools::builtin_registry(browser, &cfg.data_dir());
    tracing::debug!(tools = ?registry.names(), "Registered tools");

    let approvals = ApprovalGateway::new(cfg.approval_timeout());
    let agent = Arc::new(AgentLoop::new(
        cfg.agent_config()?,
        transport,
        store,
        registry,
        approvals,
    ));

    let conversation_id = args
        .resume
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let attachments = args
        .attach
        .iter()
        .map(|path| load_attachment(path))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let printer = spawn_event_printer(agent.subscribe());
    let mut lines = spawn_stdin_reader();

    let mut session = Session {
        agent,
        model,
        conversation_id,
        attachments,
    };

    let result = match args.command {
        Some(command) => session.run_prompt(command, &mut lines).await,
        None => session.run_interactive(&mut lines).await,
    };

    printer.abort();
    result
}

fn list_conversations(store: &store::JsonlStore) -> anyhow::Result<()> {
    let conversations = store
        .list_conversations()
        .with_context(|| format!("reading {}", store.dir().display()))?;
    if conversations.is_empty() {
        println!("No stored conversations.");
        return Ok(());
    }
    for info in conversations {
        println!(
            "{}  {}  {:<20} {} messages",
            info.conversation.id,
            info.created_at_display(),
            info.model,
            info.message_count
        );
    }
    Ok(())
}

fn mime_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("txt" | "md") => "text/plain",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        _ => "application/octet-stream",
    }
}

fn load_attachment(path: &Path) -> anyhow::Result<Attachment> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Attachment {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
        mime_type: mime_type_for(path).to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(bytes),
    })
}

/// Truncate a string to `max` characters, appending "..." if truncated.
fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Lines typed by the user, read on a dedicated task so they can answer
/// approval prompts while a turn runs
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut reader = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn spawn_event_printer(mut events: broadcast::Receiver<AgentEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut printed = 0usize;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event printer lagged, skipped {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match event {
                AgentEvent::TurnStart { .. } => printed = 0,
                AgentEvent::DraftUpdated { draft, .. } => match draft.text.get(printed..) {
                    Some(new_text) => {
                        print!("{}", new_text);
                        let _ = std::io::stdout().flush();
                        printed = draft.text.len();
                    }
                    // the draft was rolled back for a retry
                    None => {
                        println!();
                        printed = draft.text.len();
                    }
                },
                AgentEvent::ToolExecutionStart {
                    tool_name,
                    arguments,
                    ..
                } => {
                    println!("\n[{} {}]", tool_name, truncate_chars(&arguments.to_string(), 120));
                }
                AgentEvent::ToolExecutionEnd {
                    tool_name,
                    result,
                    is_error,
                    ..
                } => {
                    let preview = truncate_chars(&result.to_string(), 200);
                    if is_error {
                        println!("[{} failed: {}]", tool_name, preview);
                    } else {
                        println!("[{}: {}]", tool_name, preview);
                    }
                }
                AgentEvent::CompactionStart { reason, .. } => {
                    println!("\n[Compacting context ({:?})]", reason);
                }
                AgentEvent::CompactionEnd {
                    tokens_before,
                    tokens_after,
                    ..
                } => {
                    println!("[Compacted: ~{} -> ~{} tokens]", tokens_before, tokens_after);
                }
                AgentEvent::TurnEnd { status, error, .. } => {
                    println!();
                    match error {
                        Some(e) => eprintln!("Error: {}", e),
                        None if status == tether_agent::TurnStatus::Aborted => println!("[Stopped]"),
                        None => {}
                    }
                }
                AgentEvent::StepStart { .. } | AgentEvent::ApprovalRequested { .. } => {}
            }
        }
    })
}

fn print_approval_prompt(approval: &PendingApproval) {
    println!(
        "\n[approval] {} wants to run with {} (risk: {})",
        approval.tool_name,
        truncate_chars(&approval.arguments.to_string(), 300),
        approval.tier.as_str()
    );
    print!("Allow? [y]es / [n]o / [a]lways for {} tools: ", approval.tier.as_str());
    let _ = std::io::stdout().flush();
}

struct Session {
    agent: Arc<AgentLoop>,
    model: String,
    conversation_id: String,
    attachments: Vec<Attachment>,
}

impl Session {
    async fn run_interactive(&mut self, lines: &mut mpsc::Receiver<String>) -> anyhow::Result<()> {
        if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
            eprintln!("tether ({}) conversation: {}", self.model, self.conversation_id);
            eprintln!("Type /help for commands.");
            eprintln!();
        }

        loop {
            print!("> ");
            std::io::stdout().flush()?;

            let Some(input) = lines.recv().await else {
                break;
            };
            let input = input.trim();
            if input.is_empty() {
                continue;
            }

            if let Some(command) = input.strip_prefix('/') {
                let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
                match name {
                    "exit" | "quit" => break,
                    "new" => {
                        self.agent.forget(&self.conversation_id);
                        self.conversation_id = uuid::Uuid::new_v4().to_string();
                        println!("New conversation: {}", self.conversation_id);
                    }
                    "attach" => match load_attachment(Path::new(rest.trim())) {
                        Ok(attachment) => {
                            println!("Attached {} to the next message.", attachment.name);
                            self.attachments.push(attachment);
                        }
                        Err(e) => eprintln!("Error: {:#}", e),
                    },
                    "revoke" => {
                        self.agent.approvals().clear_session();
                        println!("Session approvals cleared.");
                    }
                    "help" => {
                        println!("/new             start a new conversation");
                        println!("/attach <path>   attach a file to the next message");
                        println!("/revoke          forget \"always\" approvals");
                        println!("/stop            stop the running turn (while it runs)");
                        println!("/exit            quit");
                    }
                    _ => println!("Unknown command: /{}", name),
                }
                continue;
            }

            if let Err(e) = self.run_prompt(input.to_string(), lines).await {
                eprintln!("Error: {:#}", e);
            }
        }
        Ok(())
    }

    /// Run one turn while answering approval prompts and stop requests
    async fn run_prompt(
        &mut self,
        prompt: String,
        lines: &mut mpsc::Receiver<String>,
    ) -> anyhow::Result<()> {
        let mut approvals = self.agent.approvals().subscribe();
        let attachments = std::mem::take(&mut self.attachments);

        let mut turn = {
            let agent = Arc::clone(&self.agent);
            let conversation_id = self.conversation_id.clone();
            let model = self.model.clone();
            tokio::spawn(async move {
                agent
                    .run_turn(&conversation_id, &prompt, &model, attachments)
                    .await
            })
        };

        loop {
            tokio::select! {
                outcome = &mut turn => {
                    let outcome = outcome.context("turn task panicked")??;
                    if let TurnOutcome::Failed { error, .. } = &outcome {
                        tracing::debug!("Turn failed: {}", error);
                    }
                    self.agent.clear_error(&self.conversation_id);
                    return Ok(());
                }
                Ok(()) = approvals.changed() => {
                    let pending = approvals.borrow_and_update().clone();
                    if let Some(approval) = pending.filter(|p| p.conversation_id == self.conversation_id) {
                        print_approval_prompt(&approval);
                    }
                }
                Some(line) = lines.recv() => self.handle_line_during_turn(line.trim()),
                _ = tokio::signal::ctrl_c() => {
                    self.agent.stop(&self.conversation_id);
                }
            }
        }
    }

    fn handle_line_during_turn(&self, line: &str) {
        let gateway = self.agent.approvals();
        if let Some(approval) = gateway.pending() {
            let answered = match line.to_ascii_lowercase().as_str() {
                "y" | "yes" => gateway.approve(&approval.id),
                "n" | "no" => gateway.deny(&approval.id),
                "a" | "always" => {
                    gateway.allow_all_for_session(approval.tier);
                    true
                }
                _ => false,
            };
            if !answered {
                print!("Please answer y, n or a: ");
                let _ = std::io::stdout().flush();
            }
            return;
        }

        if line == "/stop" {
            self.agent.stop(&self.conversation_id);
        } else if !line.is_empty() {
            println!("[A turn is running; type /stop to abort it]");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_type_for() {
        assert_eq!(mime_type_for(Path::new("photo.JPG")), "image/jpeg");
        assert_eq!(mime_type_for(Path::new("notes.md")), "text/plain");
        assert_eq!(mime_type_for(Path::new("archive")), "application/octet-stream");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_load_attachment_encodes_base64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixel.png");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let attachment = load_attachment(&path).unwrap();
        assert_eq!(attachment.name, "pixel.png");
        assert!(attachment.is_image());
        assert_eq!(attachment.data, "AQID");
    }
}
