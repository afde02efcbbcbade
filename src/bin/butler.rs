//! Orion Butler CLI
//!
//! A command-line interface for the butler with REPL support.

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::{FutureExt, StreamExt};
use orion_butler::events::EventSender;
use orion_butler::permission::spawn_expiry_sweeper;
use orion_butler::session::ConversationKind;
use orion_butler::tool::humanize_call;
use orion_butler::{
    event_channel, init_logging, ButlerConfig, ButlerEvent, Response, Runtime, UserTurn,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SWEEP_PERIOD: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "butler")]
#[command(about = "Orion Butler - delegate requests to specialist agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: <config_dir>/orion-butler/butler.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (auth.json, session database, logs)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Conversation to use: daily, inbox, adhoc or project:<id>
    #[arg(long, default_value = "daily")]
    conversation: ConversationKind,

    /// Print responses as JSON
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive REPL session
    Repl,

    /// Send a single message
    Prompt {
        /// The message to send to the butler
        message: String,

        /// Structured argument passed to the tools (repeatable)
        #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },

    /// List agents, or show one
    Agents {
        #[command(subcommand)]
        command: Option<AgentsCommands>,
    },

    /// List the tool catalog
    Tools,

    /// Check configuration and integration credentials
    Check,

    /// Show the audit trail of a conversation
    Audit {
        /// Conversation id (conv_...) or kind (daily, inbox, project:<id>)
        conversation: String,
    },

    /// Show recent conversations, or one conversation's transcript
    Sessions {
        #[command(subcommand)]
        command: Option<SessionsCommands>,

        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum SessionsCommands {
    /// Show the turns of a conversation
    Show {
        /// Conversation id (conv_...) or kind (daily, inbox, project:<id>)
        conversation: String,
    },
}

#[derive(Subcommand)]
enum AgentsCommands {
    /// Show an agent's definition and rendered prompt
    Show { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    let mut config = ButlerConfig::load(cli.config.as_deref())?.with_verbose(cli.verbose);
    if let Some(dir) = cli.data_dir.clone() {
        config = config.with_data_dir(dir);
    }
    std::fs::create_dir_all(&config.data_dir)?;

    let _telemetry = init_logging(&config.telemetry, &config.log_dir())?;
    let runtime = Runtime::bootstrap(config)?;

    let shutdown = CancellationToken::new();
    let sweeper = spawn_expiry_sweeper(runtime.ledger().clone(), SWEEP_PERIOD, shutdown.clone());

    let result = match cli.command.take() {
        Some(Commands::Prompt { message, args }) => {
            run_single_prompt(&runtime, &cli, &message, args).await
        }
        Some(Commands::Agents { command }) => show_agents(&runtime, command),
        Some(Commands::Tools) => {
            show_tools(&runtime);
            Ok(())
        }
        Some(Commands::Check) => run_check(&runtime).await,
        Some(Commands::Audit { conversation }) => {
            show_audit(&runtime, &conversation, cli.json).await
        }
        Some(Commands::Sessions {
            command: Some(SessionsCommands::Show { conversation }),
            ..
        }) => show_transcript(&runtime, &conversation, cli.json).await,
        Some(Commands::Sessions { limit, .. }) => show_sessions(&runtime, limit).await,
        Some(Commands::Repl) | None => run_repl(&runtime, &cli).await,
    };

    shutdown.cancel();
    let _ = sweeper.await;
    result
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Run one turn, rendering progress; Ctrl-C cancels it
async fn run_turn(runtime: &Runtime, turn: UserTurn, verbose: bool) -> Response {
    with_progress(verbose, |cancel, tx| {
        runtime.coordinator().handle_with(turn, cancel, Some(tx))
    })
    .await
}

/// Confirm and replay a parked call, rendering progress; Ctrl-C cancels it
async fn run_confirm(
    runtime: &Runtime,
    conversation_id: &str,
    confirmation_id: &str,
    verbose: bool,
) -> Response {
    with_progress(verbose, |cancel, tx| {
        runtime
            .coordinator()
            .confirm_with(conversation_id, confirmation_id, cancel, Some(tx))
    })
    .await
}

async fn with_progress<F, Fut>(verbose: bool, start: F) -> Response
where
    F: FnOnce(CancellationToken, EventSender) -> Fut,
    Fut: Future<Output = Response>,
{
    let cancel = CancellationToken::new();
    let (tx, mut events) = event_channel();
    let handling = start(cancel.clone(), tx);
    tokio::pin!(handling);

    let response = loop {
        tokio::select! {
            response = &mut handling => break response,
            Some(event) = events.next() => render_event(&event, verbose),
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                println!("^C cancelling...");
                cancel.cancel();
            }
        }
    };

    while let Some(Some(event)) = events.next().now_or_never() {
        render_event(&event, verbose);
    }
    response
}

fn render_event(event: &ButlerEvent, verbose: bool) {
    match event {
        ButlerEvent::DelegationStart { agent, intent } => {
            println!("  -> {} ({})", agent, intent);
        }
        ButlerEvent::ToolCallStart { agent, summary, .. } => {
            println!("  [{}] {}", agent, summary);
        }
        ButlerEvent::PermissionDecision {
            agent,
            tool,
            decision,
            reason,
        } if verbose => {
            println!("  [{}] {}: {} ({})", agent, tool, decision.as_str(), reason);
        }
        ButlerEvent::ToolCallEnd {
            tool,
            is_error: true,
            ..
        } => {
            println!("  {} did not complete", tool);
        }
        _ => {}
    }
}

fn print_response(response: &Response, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }
    println!("[{}] {}", response.handled_by, response.message);
    for call in response.tool_calls.iter().filter(|c| c.warning) {
        println!("  note: {} made changes", call.summary);
    }
    Ok(())
}

fn ask_yes_no(question: &str) -> Result<bool> {
    let mut rl = DefaultEditor::new()?;
    match rl.readline(question) {
        Ok(answer) => Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")),
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn run_single_prompt(
    runtime: &Runtime,
    cli: &Cli,
    message: &str,
    args: Vec<(String, String)>,
) -> Result<()> {
    let conversation_id = runtime
        .store()
        .ensure_conversation(&cli.conversation)
        .await?;

    let turn = args
        .into_iter()
        .fold(UserTurn::generate(&conversation_id, message), |turn, (key, value)| {
            turn.with_argument(key, Value::String(value))
        });
    let response = run_turn(runtime, turn, cli.verbose).await;
    print_response(&response, cli.json)?;

    if let Some(id) = response.pending_confirmation() {
        let follow_up = if ask_yes_no("Go ahead? [y/N] ")? {
            run_confirm(runtime, &conversation_id, id, cli.verbose).await
        } else {
            runtime.coordinator().decline(&conversation_id, id).await
        };
        print_response(&follow_up, cli.json)?;
    }
    Ok(())
}

fn print_repl_help() {
    println!("Commands:");
    println!("  /quit, /exit     - Exit the REPL");
    println!("  /pending         - Show confirmations waiting for you");
    println!("  confirm <id>     - Approve a pending action (also /confirm)");
    println!("  decline <id>     - Refuse a pending action (also /decline)");
    println!("  /audit           - Show this conversation's audit trail");
    println!("  /history         - Show this conversation's transcript");
    println!("  /sessions        - Show recent conversations");
    println!("  /agents          - List agents");
    println!("  /tools           - List tools");
    println!("  /help            - Show this help");
    println!("  Ctrl-C during a reply cancels it");
}

/// Bare `confirm`/`decline` only count as commands when given an id
fn is_confirmation_arg(cmd: &str, arg: &str) -> bool {
    cmd.starts_with('/') || arg.starts_with("confirm_")
}

async fn run_repl(runtime: &Runtime, cli: &Cli) -> Result<()> {
    let conversation_id = runtime
        .store()
        .ensure_conversation(&cli.conversation)
        .await?;
    let coordinator = runtime.coordinator();

    println!("Orion Butler REPL");
    println!("Conversation: {}", conversation_id);
    println!("Data directory: {}", runtime.config().data_dir.display());
    println!();
    print_repl_help();
    println!();

    let mut rl = DefaultEditor::new()?;
    let history_path = runtime.config().data_dir.join("history.txt");
    let _ = rl.load_history(&history_path);

    loop {
        match rl.readline("butler> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                let mut parts = line.splitn(2, ' ');
                let cmd = parts.next().unwrap_or_default();
                let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

                match (cmd, arg) {
                    ("/quit" | "/exit", _) => {
                        println!("Goodbye!");
                        break;
                    }
                    ("/help", _) => print_repl_help(),
                    ("confirm" | "/confirm", Some(id)) if is_confirmation_arg(cmd, id) => {
                        let response = run_confirm(runtime, &conversation_id, id, cli.verbose).await;
                        print_response(&response, cli.json)?;
                    }
                    ("decline" | "/decline", Some(id)) if is_confirmation_arg(cmd, id) => {
                        let response = coordinator.decline(&conversation_id, id).await;
                        print_response(&response, cli.json)?;
                    }
                    ("/confirm" | "/decline", None) => println!("Usage: {} <id>", cmd),
                    ("/pending", _) => {
                        let pending = runtime.ledger().pending_for(&conversation_id);
                        if pending.is_empty() {
                            println!("Nothing is waiting for confirmation.");
                        }
                        for p in pending {
                            println!(
                                "  {} | {} | {} | expires {}",
                                p.id,
                                p.binding.agent,
                                humanize_call(&p.binding.tool, &p.args),
                                p.expires_at.format("%H:%M:%S")
                            );
                        }
                    }
                    ("/audit", _) => {
                        if let Err(e) = show_audit(runtime, &conversation_id, cli.json).await {
                            eprintln!("Error: {}", e);
                        }
                    }
                    ("/history", _) => {
                        if let Err(e) = show_transcript(runtime, &conversation_id, cli.json).await {
                            eprintln!("Error: {}", e);
                        }
                    }
                    ("/sessions", _) => {
                        if let Err(e) = show_sessions(runtime, 10).await {
                            eprintln!("Error: {}", e);
                        }
                    }
                    ("/agents", _) => {
                        if let Err(e) = show_agents(runtime, None) {
                            eprintln!("Error: {}", e);
                        }
                    }
                    ("/tools", _) => show_tools(runtime),
                    _ if cmd.starts_with('/') => println!("Unknown command: {}", cmd),
                    _ => {
                        println!();
                        let turn = UserTurn::generate(&conversation_id, line);
                        let response = run_turn(runtime, turn, cli.verbose).await;
                        print_response(&response, cli.json)?;
                        println!();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

fn show_agents(runtime: &Runtime, command: Option<AgentsCommands>) -> Result<()> {
    let registry = runtime.registry();
    match command {
        None => {
            println!("Agents:");
            println!("{:-<80}", "");
            for agent in registry.list_all() {
                let intents: Vec<&str> = agent.intents.iter().map(|p| p.as_str()).collect();
                println!(
                    "  {:20} | {:4} | {:2} tools | {}",
                    agent.name,
                    agent.model_tier.as_str(),
                    agent.tools.len(),
                    intents.join(", ")
                );
                if !agent.description.is_empty() {
                    println!("    {}", agent.description);
                }
            }
        }
        Some(AgentsCommands::Show { name }) => {
            let agent = registry.lookup(&name)?;
            println!("{}", serde_yaml::to_string(agent)?);
            println!(
                "Model: {}",
                runtime.config().model_for(agent.model_tier)
            );
            println!("{:-<80}", "");
            let prompt = runtime.coordinator().templates().render_agent_prompt(
                agent,
                registry,
                runtime.catalog(),
            )?;
            println!("{}", prompt);
        }
    }
    Ok(())
}

fn show_tools(runtime: &Runtime) {
    println!("Tools:");
    println!("{:-<80}", "");
    for tool in runtime.catalog().list() {
        println!(
            "  {:22} | {:11} | {:16} | {}",
            tool.id,
            tool.side_effect.as_str(),
            tool.integration.as_deref().unwrap_or("-"),
            tool.description
        );
    }
}

async fn run_check(runtime: &Runtime) -> Result<()> {
    println!(
        "Configuration OK: {} agents, {} tools",
        runtime.registry().len(),
        runtime.catalog().len()
    );

    let readiness = runtime.readiness().await?;
    println!("\nIntegrations:");
    for status in &readiness.integrations {
        if status.connected {
            println!("  ok      {}", status.integration);
        } else {
            println!(
                "  missing {} (set {} or add \"{}\" to auth.json)",
                status.integration, status.env_var, status.integration
            );
        }
    }

    println!("\nSession store:");
    match &readiness.store {
        Some(health) => {
            let path = health
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string());
            println!(
                "  {} | journal={} | {} conversations | {}",
                path,
                health.journal_mode,
                health.conversations,
                if health.healthy { "healthy" } else { "UNHEALTHY" }
            );
        }
        None => println!("  in-memory (nothing is persisted)"),
    }

    if !readiness.is_ready() {
        println!("\nSome integrations are not connected; requests that need them will explain what is missing.");
    }
    Ok(())
}

fn resolve_conversation(arg: &str) -> Result<String> {
    if arg.starts_with("conv_") {
        return Ok(arg.to_string());
    }
    let kind: ConversationKind = arg.parse()?;
    Ok(kind.conversation_id(chrono::Utc::now()))
}

async fn show_audit(runtime: &Runtime, conversation: &str, json: bool) -> Result<()> {
    let conversation_id = resolve_conversation(conversation)?;
    let records = runtime.store().list_audit(Some(&conversation_id)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!("Audit trail for {} ({} records):", conversation_id, records.len());
    println!("{:-<80}", "");
    for r in records {
        println!(
            "  {} | {:18} | {:20} | {:20} | {}{}",
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            r.agent,
            r.tool,
            r.decision.as_str(),
            r.reason,
            if r.warning { " (warned)" } else { "" }
        );
        if let Some(ref id) = r.confirmation_id {
            println!("    confirmation: {}", id);
        }
    }
    Ok(())
}

async fn show_sessions(runtime: &Runtime, limit: usize) -> Result<()> {
    let sessions = runtime.store().recent_conversations(limit).await?;
    println!("Recent Conversations (last {}):", limit);
    println!("{:-<80}", "");
    if sessions.is_empty() {
        println!("  No conversations found.");
    }
    for s in sessions {
        println!(
            "  {} | {} | {} messages | last active {}",
            s.id,
            s.display_name,
            s.message_count,
            s.last_active.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn show_transcript(runtime: &Runtime, conversation: &str, json: bool) -> Result<()> {
    let conversation_id = resolve_conversation(conversation)?;
    let turns = runtime.store().list_turns(&conversation_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&turns)?);
        return Ok(());
    }

    println!("Transcript of {} ({} turns):", conversation_id, turns.len());
    println!("{:-<80}", "");
    for t in turns {
        println!(
            "  {} | {:18} | {}",
            t.created_at.format("%Y-%m-%d %H:%M:%S"),
            t.handled_by.as_deref().unwrap_or(t.role.as_str()),
            t.content
        );
        for call in &t.tool_calls {
            println!("    {} ({})", call.summary, call.status);
        }
    }
    Ok(())
}
