use crate::session::{check, report_retry, Session};
use anyhow::{Context, Result};
use clap::Subcommand;
use colored::{ColoredString, Colorize};
use ragdesk_core::config::Config;
use ragdesk_core::knowledge::{KnowledgeView, SyncStatus, UploadStatus};
use ragdesk_core::{FileBlob, OperationId};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum KbCommands {
    #[command(about = "List collections and their files")]
    List,

    #[command(about = "Create a collection")]
    Create { name: String },

    #[command(about = "Rename a collection")]
    Rename {
        /// Collection id or current name.
        collection: String,
        name: String,
    },

    #[command(about = "Delete a collection")]
    Delete { collection: String },

    #[command(about = "Upload a file into a collection and wait for indexing")]
    Upload {
        collection: String,
        path: PathBuf,
    },

    #[command(about = "Remove a file from a collection")]
    Rm {
        collection: String,
        /// File id or original name.
        file: String,
    },

    #[command(about = "Re-list one collection, or all of them")]
    Refresh { collection: Option<String> },
}

pub async fn run(config: Config, command: KbCommands) -> Result<()> {
    let mut session = Session::connect(&config)?;
    session.sync_knowledge().await?;

    match command {
        KbCommands::List => {}
        KbCommands::Create { name } => {
            let op = session.dispatcher.create_collection(&name)?;
            wait(&mut session, op).await?;
            println!("{} Created {}", "✓".green().bold(), name.cyan());
        }
        KbCommands::Rename { collection, name } => {
            let id = resolve(&session, &collection)?;
            let op = session.dispatcher.rename_collection(&id, &name)?;
            wait(&mut session, op).await?;
            println!("{} Renamed to {}", "✓".green().bold(), name.cyan());
        }
        KbCommands::Delete { collection } => {
            let id = resolve(&session, &collection)?;
            let op = session.dispatcher.delete_collection(&id)?;
            wait(&mut session, op).await?;
            println!("{} Deleted {}", "✓".green().bold(), collection.cyan());
        }
        KbCommands::Upload { collection, path } => {
            let id = resolve(&session, &collection)?;
            let blob = FileBlob::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            println!("{} Uploading {}...", "→".blue(), blob.name);
            let op = session.dispatcher.upload_file(&id, blob)?;
            wait(&mut session, op).await?;
        }
        KbCommands::Rm { collection, file } => {
            let id = resolve(&session, &collection)?;
            let file_id = resolve_file(&session.observer.state().knowledge, &id, &file)?;
            let op = session.dispatcher.remove_file(&id, &file_id)?;
            wait(&mut session, op).await?;
            println!("{} Removed {}", "✓".green().bold(), file);
        }
        KbCommands::Refresh { collection } => {
            if let Some(collection) = collection {
                let id = resolve(&session, &collection)?;
                let op = session.dispatcher.refresh_knowledge(Some(&id))?;
                wait(&mut session, op).await?;
            }
        }
    }

    print_view(&session.observer.state().knowledge);
    Ok(())
}

async fn wait(session: &mut Session, op: OperationId) -> Result<()> {
    let outcome = session.observer.until_finished(op, report_retry).await;
    check(outcome)
}

fn resolve(session: &Session, collection: &str) -> Result<String> {
    session
        .observer
        .state()
        .knowledge
        .resolve(collection)
        .map(|c| c.id.clone())
        .with_context(|| format!("No collection named '{collection}'"))
}

fn resolve_file(view: &KnowledgeView, collection_id: &str, file: &str) -> Result<String> {
    if view.files.contains_key(file) {
        return Ok(file.to_string());
    }
    view.members(collection_id)
        .chain(view.files.values().filter(|f| {
            matches!(f.upload_status, UploadStatus::Failed | UploadStatus::Pending)
        }))
        .find(|f| f.original_name == file)
        .map(|f| f.id.clone())
        .with_context(|| format!("No file named '{file}'"))
}

fn sync_label(status: SyncStatus) -> ColoredString {
    match status {
        SyncStatus::Clean => "clean".green(),
        SyncStatus::Syncing => "syncing".blue(),
        SyncStatus::Stale => "stale".yellow(),
        SyncStatus::Error => "error".red(),
    }
}

fn upload_label(status: UploadStatus) -> ColoredString {
    match status {
        UploadStatus::Pending => "pending".dimmed(),
        UploadStatus::Uploaded => "indexing".blue(),
        UploadStatus::Indexed => "indexed".green(),
        UploadStatus::Failed => "failed".red(),
    }
}

fn print_view(view: &KnowledgeView) {
    if view.collections.is_empty() {
        println!("{}", "No collections yet. Create one with 'ragdesk kb create <name>'".yellow());
        return;
    }

    println!("{}", "Collections:".bold().green());
    for collection in view.collections.values() {
        println!();
        println!(
            "  {} {} [{}]",
            collection.display_name.bold(),
            collection.id.dimmed(),
            sync_label(collection.sync_status)
        );
        if let Some(error) = &collection.error {
            println!("    {}", error.red());
        }
        for file in view.members(&collection.id) {
            println!(
                "    {} {} ({})",
                "•".cyan(),
                file.original_name,
                upload_label(file.upload_status)
            );
            if let Some(error) = &file.error {
                println!("      {}", error.red());
            }
        }
    }

    let unattached: Vec<_> = view
        .files
        .values()
        .filter(|f| !view.is_member_anywhere(&f.id))
        .collect();
    if !unattached.is_empty() {
        println!();
        println!("{}", "Not in any collection:".bold());
        for file in unattached {
            println!(
                "    {} {} ({}) {}",
                "•".cyan(),
                file.original_name,
                upload_label(file.upload_status),
                file.id.dimmed()
            );
        }
    }
}
