use crate::session::{report_retry, Session};
use anyhow::{Context, Result};
use colored::Colorize;
use ragdesk_core::config::Config;
use ragdesk_core::{prompts, transcript, Channel, OperationId, Outcome, ReasoningEffort, StateUpdate};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

enum Flow {
    Continue,
    Quit,
}

const HELP: &str = "\
Commands:
  /model [id]          show or switch the model
  /effort <level>      none, minimal, low, medium, high or default
  /mode [name]         list prompt presets or switch to one
  /use <collection>    search a collection (by id or name); '/use off' disables
  /clear               start a new conversation
  /cost                show token usage and cost
  /export [path]       save the conversation as text
  /quit                leave
Ctrl-C cancels a response while it streams.";

pub async fn run(config: Config, mode: Option<String>, collection: Option<String>) -> Result<()> {
    let mut session = Session::connect(&config)?;

    if let Err(err) = session.sync_knowledge().await {
        eprintln!("{} Knowledge base unavailable: {err:#}", "!".yellow().bold());
    }
    if let Some(mode) = mode {
        session.dispatcher.apply_prompt_mode(&mode)?;
    }
    if let Some(collection) = collection.or(config.knowledge.active_collection.clone()) {
        use_collection(&session, &collection)?;
    }
    session.observer.drain();

    print_banner(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", ">".cyan().bold());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            match handle_command(&mut session, command) {
                Ok(Flow::Quit) => break,
                Ok(Flow::Continue) => {}
                Err(err) => eprintln!("{} {err:#}", "✗".red().bold()),
            }
            continue;
        }

        match session.dispatcher.send_message(line) {
            Ok(op) => stream_turn(&mut session, op).await?,
            Err(err) => eprintln!("{} {err}", "✗".red().bold()),
        }
    }

    Ok(())
}

fn print_banner(session: &Session) {
    let settings = &session.observer.state().settings;
    println!("{} {}", "Model:".bold(), settings.model.cyan());
    println!(
        "{} {}",
        "Prompt:".bold(),
        settings.prompt_mode.as_deref().unwrap_or("custom")
    );
    if let Some(id) = &settings.file_search {
        let name = session
            .observer
            .state()
            .knowledge
            .collection(id)
            .map(|c| c.display_name.as_str())
            .unwrap_or(id.as_str());
        println!("{} {}", "Searching:".bold(), name);
    }
    println!("{}", "Type /help for commands.".dimmed());
    println!();
}

/// Prints the response as it streams in until the operation finishes.
async fn stream_turn(session: &mut Session, op: OperationId) -> Result<()> {
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            update = session.observer.recv() => {
                let Some(update) = update else {
                    anyhow::bail!("The dispatcher stopped unexpectedly");
                };
                report_retry(&update, session.observer.state());

                match update {
                    StateUpdate::PartialText { delta } => {
                        print!("{delta}");
                        stdout.flush()?;
                    }
                    StateUpdate::TurnRestarted => {
                        println!();
                        eprintln!("{}", "  (response restarted)".dimmed());
                    }
                    StateUpdate::TurnSealed { turn, cost, attempts } => {
                        println!();
                        if let Some(reason) = &turn.incomplete {
                            eprintln!("{}", format!("  (response cut short: {reason})").yellow());
                        }
                        let total = session.observer.state().cost.session_total;
                        let mut line = format!(
                            "  {} in / {} out tokens, {} this turn, {} this session",
                            turn.usage.input_tokens, turn.usage.output_tokens, cost, total
                        );
                        if attempts > 1 {
                            line.push_str(&format!(", {attempts} attempts"));
                        }
                        println!("{}", line.dimmed());
                    }
                    StateUpdate::OperationFinished { op: finished, outcome, .. } if finished == op => {
                        match outcome {
                            Outcome::Completed => {}
                            Outcome::Cancelled => println!("\n{}", "Cancelled.".yellow()),
                            Outcome::Failed(failure) => {
                                println!();
                                eprintln!("{} {}", "✗".red().bold(), failure.description());
                            }
                        }
                        println!();
                        return Ok(());
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                session.dispatcher.cancel(Channel::Chat);
            }
        }
    }
}

fn handle_command(session: &mut Session, command: &str) -> Result<Flow> {
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    let dispatcher = &session.dispatcher;

    match name {
        "quit" | "exit" => return Ok(Flow::Quit),
        "help" => println!("{HELP}"),
        "clear" => {
            dispatcher.clear_conversation()?;
            println!("{}", "Conversation cleared.".green());
        }
        "model" if arg.is_empty() => {
            println!("{}", session.observer.state().settings.model.cyan());
        }
        "model" => {
            dispatcher.set_model(arg)?;
            println!("{} Model: {}", "✓".green().bold(), arg.cyan());
        }
        "effort" => {
            let effort = match arg {
                "" | "default" => None,
                level => Some(level.parse::<ReasoningEffort>().map_err(anyhow::Error::msg)?),
            };
            dispatcher.set_reasoning_effort(effort)?;
            println!(
                "{} Reasoning effort: {}",
                "✓".green().bold(),
                effort.map(|e| e.to_string()).unwrap_or_else(|| "default".into())
            );
        }
        "mode" if arg.is_empty() => {
            let current = session.observer.state().settings.prompt_mode.clone();
            for mode in prompts::modes() {
                let marker = if current.as_deref() == Some(mode) { "•" } else { " " };
                println!("{} {mode}", marker.cyan());
            }
        }
        "mode" => {
            dispatcher.apply_prompt_mode(arg)?;
            println!("{} Prompt mode: {}", "✓".green().bold(), arg.cyan());
        }
        "use" => match arg {
            "" => anyhow::bail!("Usage: /use <collection|off>"),
            "off" => {
                dispatcher.set_file_search(None)?;
                println!("{} File search disabled", "✓".green().bold());
            }
            collection => use_collection(session, collection)?,
        },
        "cost" => {
            session.observer.drain();
            let cost = &session.observer.state().cost;
            println!("Session total: {}", cost.session_total);
            if let Some(last) = &cost.last_turn {
                println!("Last turn:     {last}");
            }
            if cost.unpriced_turns > 0 {
                println!("Unpriced turns: {}", cost.unpriced_turns);
            }
        }
        "export" => {
            session.observer.drain();
            let state = session.observer.state();
            let path = if arg.is_empty() {
                transcript::default_file_name(&chrono::Local::now())
            } else {
                arg.to_string()
            };
            std::fs::write(&path, transcript::render(&state.settings, &state.conversation))
                .with_context(|| format!("Failed to write {path}"))?;
            println!("{} Saved to {}", "✓".green().bold(), path);
        }
        other => anyhow::bail!("Unknown command /{other}; try /help"),
    }

    session.observer.drain();
    Ok(Flow::Continue)
}

fn use_collection(session: &Session, collection: &str) -> Result<()> {
    let (id, name) = session
        .observer
        .state()
        .knowledge
        .resolve(collection)
        .map(|c| (c.id.clone(), c.display_name.clone()))
        .with_context(|| format!("No collection named '{collection}'"))?;

    session.dispatcher.set_file_search(Some(&id))?;
    println!("{} Searching {}", "✓".green().bold(), name.cyan());
    Ok(())
}
